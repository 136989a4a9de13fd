use super::registry::{ToolAction, ToolSpec};
use crate::error::InvocationError;
use crate::types::{ArtifactId, ArtifactKind, SharedState, ToolArgs};
use serde_json::{Map, Value};

/// Marker key for an argument that should be read from shared state:
/// `{"$state": "style.palette"}`.
pub const STATE_REF_KEY: &str = "$state";

/// Replaces every `{"$state": path}` value in `args` with the value found at
/// `path` in `state`. The credential is never copied into arguments.
pub fn resolve_state_refs(
    tool: &str,
    args: &ToolArgs,
    state: &SharedState,
) -> Result<ToolArgs, InvocationError> {
    args.iter()
        .map(|(key, value)| Ok((key.clone(), resolve_value(tool, value, state)?)))
        .collect()
}

fn resolve_value(tool: &str, value: &Value, state: &SharedState) -> Result<Value, InvocationError> {
    match value {
        Value::Object(map) => match state_ref(map) {
            Some(path) => lookup(tool, path, state),
            None => map
                .iter()
                .map(|(key, inner)| Ok((key.clone(), resolve_value(tool, inner, state)?)))
                .collect::<Result<Map<String, Value>, InvocationError>>()
                .map(Value::Object),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(tool, item, state))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn state_ref(map: &Map<String, Value>) -> Option<&str> {
    if map.len() != 1 {
        return None;
    }
    map.get(STATE_REF_KEY).and_then(Value::as_str)
}

fn lookup(tool: &str, path: &str, state: &SharedState) -> Result<Value, InvocationError> {
    if path.trim() == "credential" {
        return Err(InvocationError::invalid(
            tool,
            "the credential cannot be passed as an argument",
        ));
    }
    state.field(path).cloned().ok_or_else(|| {
        InvocationError::invalid(tool, format!("`{path}` is not set in shared state"))
    })
}

/// Artifact ids a tool call points at, with the kind each must have.
pub fn referenced_artifacts(
    spec: &ToolSpec,
    args: &ToolArgs,
) -> Result<Vec<(ArtifactId, Option<ArtifactKind>)>, InvocationError> {
    let parse = |raw: &str| {
        ArtifactId::parse(raw).map_err(|reason| InvocationError::invalid(&spec.name, reason))
    };

    let mut refs = Vec::new();
    match spec.action {
        ToolAction::Generate(ArtifactKind::Scene) => {
            if let Some(ids) = args.get("character_ids").and_then(Value::as_array) {
                for raw in ids.iter().filter_map(Value::as_str) {
                    refs.push((parse(raw)?, Some(ArtifactKind::Character)));
                }
            }
            if let Some(raw) = args.get("background_id").and_then(Value::as_str) {
                refs.push((parse(raw)?, Some(ArtifactKind::Background)));
            }
        }
        ToolAction::Edit => {
            if let Some(raw) = args.get("artifact_id").and_then(Value::as_str) {
                refs.push((parse(raw)?, None));
            }
        }
        ToolAction::Generate(_) | ToolAction::SetField => {}
    }
    Ok(refs)
}

pub fn check_artifact_refs(
    spec: &ToolSpec,
    args: &ToolArgs,
    state: &SharedState,
) -> Result<(), InvocationError> {
    for (id, kind) in referenced_artifacts(spec, args)? {
        let artifact = state
            .artifact(id)
            .ok_or(InvocationError::ArtifactNotFound(id))?;
        if let Some(kind) = kind {
            if artifact.kind != kind {
                return Err(InvocationError::invalid(
                    &spec.name,
                    format!("artifact {id} is a {}, expected a {kind}", artifact.kind),
                ));
            }
        }
    }
    Ok(())
}
