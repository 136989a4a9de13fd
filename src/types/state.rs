use super::ids::{ArtifactId, InvocationId};
use crate::error::PatchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field roots owned by the typed sections of [`SharedState`].
pub const RESERVED_FIELD_ROOTS: [&str; 5] =
    ["version", "characters", "backgrounds", "scenes", "credential"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Agent,
    Ui,
    /// Writes made by the session itself, e.g. artifacts appended after a
    /// successful invocation.
    Engine,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Agent => "agent",
            Self::Ui => "ui",
            Self::Engine => "engine",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Character,
    Background,
    Scene,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [Self::Character, Self::Background, Self::Scene];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Background => "background",
            Self::Scene => "scene",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn first_revision() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub media_ref: Option<String>,
    pub source_invocation_id: InvocationId,
    #[serde(default = "first_revision")]
    pub revision: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<ArtifactId>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        kind: ArtifactKind,
        name: impl Into<String>,
        description: impl Into<String>,
        media_ref: Option<String>,
        source_invocation_id: InvocationId,
    ) -> Self {
        Self {
            id: ArtifactId::new(),
            kind,
            name: name.into(),
            description: description.into(),
            media_ref,
            source_invocation_id,
            revision: first_revision(),
            supersedes: None,
            created_at: Utc::now(),
        }
    }

    /// A new artifact that replaces `self` in the current view. `self` is
    /// left untouched.
    pub fn revise(
        &self,
        name: Option<String>,
        description: impl Into<String>,
        media_ref: Option<String>,
        source_invocation_id: InvocationId,
    ) -> Self {
        Self {
            id: ArtifactId::new(),
            kind: self.kind,
            name: name.unwrap_or_else(|| self.name.clone()),
            description: description.into(),
            media_ref,
            source_invocation_id,
            revision: self.revision + 1,
            supersedes: Some(self.id),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    pub version: u64,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub characters: Vec<Artifact>,
    #[serde(default)]
    pub backgrounds: Vec<Artifact>,
    #[serde(default)]
    pub scenes: Vec<Artifact>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl SharedState {
    pub fn collection(&self, kind: ArtifactKind) -> &[Artifact] {
        match kind {
            ArtifactKind::Character => &self.characters,
            ArtifactKind::Background => &self.backgrounds,
            ArtifactKind::Scene => &self.scenes,
        }
    }

    fn collection_mut(&mut self, kind: ArtifactKind) -> &mut Vec<Artifact> {
        match kind {
            ArtifactKind::Character => &mut self.characters,
            ArtifactKind::Background => &mut self.backgrounds,
            ArtifactKind::Scene => &mut self.scenes,
        }
    }

    pub fn artifact(&self, id: ArtifactId) -> Option<&Artifact> {
        ArtifactKind::ALL
            .iter()
            .flat_map(|kind| self.collection(*kind))
            .find(|artifact| artifact.id == id)
    }

    /// Artifacts of `kind` that no later revision supersedes.
    pub fn current(&self, kind: ArtifactKind) -> Vec<&Artifact> {
        let artifacts = self.collection(kind);
        artifacts
            .iter()
            .filter(|candidate| {
                !artifacts
                    .iter()
                    .any(|other| other.supersedes == Some(candidate.id))
            })
            .collect()
    }

    pub fn has_credential(&self) -> bool {
        self.credential
            .as_deref()
            .is_some_and(|value| !value.trim().is_empty())
    }

    pub fn field(&self, path: &str) -> Option<&Value> {
        let segments = split_field_path(path).ok()?;
        let (first, rest) = segments.split_first()?;
        let mut cursor = self.fields.get(*first)?;
        for segment in rest {
            cursor = cursor.as_object()?.get(*segment)?;
        }
        Some(cursor)
    }

    /// Returns the state that results from applying `patch`, leaving `self`
    /// unchanged. All operations apply or none do. The version is not
    /// touched; the store owns version numbering.
    pub fn applied(&self, actor: Actor, patch: &Patch) -> Result<SharedState, PatchError> {
        if patch.ops.is_empty() {
            return Err(PatchError::Empty);
        }
        if actor != Actor::Ui && patch.touches_credential() {
            return Err(PatchError::CredentialNotWritable(actor));
        }

        let mut next = self.clone();
        for op in &patch.ops {
            next.apply_op(op)?;
        }
        Ok(next)
    }

    pub fn apply_patch(&mut self, actor: Actor, patch: &Patch) -> Result<(), PatchError> {
        *self = self.applied(actor, patch)?;
        Ok(())
    }

    fn apply_op(&mut self, op: &PatchOp) -> Result<(), PatchError> {
        match op {
            PatchOp::Set { path, value } => {
                let segments = split_field_path(path)?;
                set_field(&mut self.fields, &segments, value.clone())
            }
            PatchOp::Remove { path } => {
                let segments = split_field_path(path)?;
                remove_field(&mut self.fields, &segments);
                Ok(())
            }
            PatchOp::Append { artifact } => {
                if self.artifact(artifact.id).is_some() {
                    return Err(PatchError::DuplicateArtifact(artifact.id));
                }
                self.collection_mut(artifact.kind).push(artifact.clone());
                Ok(())
            }
            PatchOp::SetCredential { credential } => {
                self.credential = credential
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(ToString::to_string);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub ops: Vec<PatchOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// Write a value at a dotted path under `fields`.
    Set { path: String, value: Value },
    Remove { path: String },
    /// Append to the collection matching `artifact.kind`.
    Append { artifact: Artifact },
    SetCredential { credential: Option<String> },
}

impl Patch {
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self {
            ops: vec![PatchOp::Set {
                path: path.into(),
                value,
            }],
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            ops: vec![PatchOp::Remove { path: path.into() }],
        }
    }

    pub fn append(artifact: Artifact) -> Self {
        Self {
            ops: vec![PatchOp::Append { artifact }],
        }
    }

    pub fn credential(credential: Option<String>) -> Self {
        Self {
            ops: vec![PatchOp::SetCredential { credential }],
        }
    }

    pub fn and(mut self, op: PatchOp) -> Self {
        self.ops.push(op);
        self
    }

    /// Append-only patches commute with each other, so they can be replayed
    /// against a newer version without losing sibling appends.
    pub fn is_append_only(&self) -> bool {
        !self.ops.is_empty()
            && self
                .ops
                .iter()
                .all(|op| matches!(op, PatchOp::Append { .. }))
    }

    pub fn is_credential_only(&self) -> bool {
        !self.ops.is_empty()
            && self
                .ops
                .iter()
                .all(|op| matches!(op, PatchOp::SetCredential { .. }))
    }

    pub fn touches_credential(&self) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, PatchOp::SetCredential { .. }))
    }
}

pub fn split_field_path(path: &str) -> Result<Vec<&str>, PatchError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.trim().is_empty()) {
        return Err(PatchError::InvalidPath(path.to_string()));
    }
    if RESERVED_FIELD_ROOTS.contains(&segments[0]) {
        return Err(PatchError::ReservedField(segments[0].to_string()));
    }
    Ok(segments)
}

fn set_field(root: &mut Map<String, Value>, segments: &[&str], value: Value) -> Result<(), PatchError> {
    let Some((last, parents)) = segments.split_last() else {
        return Err(PatchError::InvalidPath(String::new()));
    };

    let mut cursor = root;
    for (depth, segment) in parents.iter().enumerate() {
        let entry = cursor
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        cursor = match entry {
            Value::Object(map) => map,
            _ => return Err(PatchError::NotAnObject(segments[..=depth].join("."))),
        };
    }
    cursor.insert(last.to_string(), value);
    Ok(())
}

fn remove_field(root: &mut Map<String, Value>, segments: &[&str]) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut cursor = root;
    for segment in parents {
        match cursor.get_mut(*segment) {
            Some(Value::Object(map)) => cursor = map,
            _ => return,
        }
    }
    cursor.remove(*last);
}
