use crate::error::InvocationError;
use crate::types::{ArtifactKind, ToolArgs};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const CREATE_CHARACTER: &str = "create_character";
pub const CREATE_BACKGROUND: &str = "create_background";
pub const CREATE_SCENE: &str = "create_scene";
pub const EDIT_ARTIFACT: &str = "edit_artifact";
pub const SET_STORY_FIELD: &str = "set_story_field";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    String,
    Integer,
    Boolean,
    StringList,
    Any,
}

impl ArgKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            Self::Any => true,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Integer => "an integer",
            Self::Boolean => "a boolean",
            Self::StringList => "a list of strings",
            Self::Any => "any value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArgSpec {
    pub name: String,
    pub kind: ArgKind,
    pub required: bool,
}

impl ArgSpec {
    pub fn required(name: &str, kind: ArgKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: &str, kind: ArgKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
        }
    }
}

/// What running a tool does once it clears the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "kind", rename_all = "snake_case")]
pub enum ToolAction {
    /// Generate media for a new artifact of the given kind.
    Generate(ArtifactKind),
    /// Generate a new revision of an existing artifact.
    Edit,
    /// Write a value into the shared `fields` map.
    SetField,
}

impl ToolAction {
    pub fn uses_backend(self) -> bool {
        !matches!(self, Self::SetField)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub gated: bool,
    pub action: ToolAction,
    pub args: Vec<ArgSpec>,
}

impl ToolSpec {
    pub fn needs_credential(&self) -> bool {
        self.action.uses_backend()
    }

    pub fn validate_args(&self, args: &ToolArgs) -> Result<(), InvocationError> {
        if let Some(unexpected) = args
            .keys()
            .find(|key| !self.args.iter().any(|spec| &spec.name == *key))
        {
            return Err(InvocationError::invalid(
                &self.name,
                format!("unexpected argument `{unexpected}`"),
            ));
        }

        for spec in &self.args {
            match args.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(InvocationError::invalid(
                        &self.name,
                        format!("missing required argument `{}`", spec.name),
                    ));
                }
                None | Some(Value::Null) => {}
                Some(value) if !spec.kind.matches(value) => {
                    return Err(InvocationError::invalid(
                        &self.name,
                        format!("`{}` must be {}", spec.name, spec.kind.describe()),
                    ));
                }
                Some(Value::String(text)) if spec.required && text.trim().is_empty() => {
                    return Err(InvocationError::invalid(
                        &self.name,
                        format!("`{}` must not be empty", spec.name),
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Known tools keyed by name.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolSpec>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for spec in builtin_tools() {
            registry.register(spec);
        }
        registry
    }
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, spec: ToolSpec) -> Option<ToolSpec> {
        self.tools.insert(spec.name.clone(), spec)
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn set_gated(&mut self, name: &str, gated: bool) -> bool {
        match self.tools.get_mut(name) {
            Some(spec) => {
                spec.gated = gated;
                true
            }
            None => false,
        }
    }
}

fn builtin_tools() -> Vec<ToolSpec> {
    let generate = |name: &str, kind: ArtifactKind, description: &str| ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        gated: true,
        action: ToolAction::Generate(kind),
        args: vec![
            ArgSpec::required("name", ArgKind::String),
            ArgSpec::required("prompt", ArgKind::String),
            ArgSpec::optional("description", ArgKind::String),
        ],
    };

    let mut scene = generate(
        CREATE_SCENE,
        ArtifactKind::Scene,
        "Generate a scene, optionally staging existing characters on a background.",
    );
    scene
        .args
        .push(ArgSpec::optional("character_ids", ArgKind::StringList));
    scene
        .args
        .push(ArgSpec::optional("background_id", ArgKind::String));

    vec![
        generate(
            CREATE_CHARACTER,
            ArtifactKind::Character,
            "Generate a character portrait.",
        ),
        generate(
            CREATE_BACKGROUND,
            ArtifactKind::Background,
            "Generate a background image.",
        ),
        scene,
        ToolSpec {
            name: EDIT_ARTIFACT.to_string(),
            description: "Generate a revised version of an existing artifact.".to_string(),
            gated: true,
            action: ToolAction::Edit,
            args: vec![
                ArgSpec::required("artifact_id", ArgKind::String),
                ArgSpec::required("prompt", ArgKind::String),
                ArgSpec::optional("name", ArgKind::String),
            ],
        },
        ToolSpec {
            name: SET_STORY_FIELD.to_string(),
            description: "Record a value in the shared story fields.".to_string(),
            gated: false,
            action: ToolAction::SetField,
            args: vec![
                ArgSpec::required("path", ArgKind::String),
                ArgSpec::required("value", ArgKind::Any),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> ToolArgs {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_builtin_registry_gating() {
        let registry = ToolRegistry::default();
        assert!(registry.get(CREATE_CHARACTER).is_some_and(|spec| spec.gated));
        assert!(registry.get(EDIT_ARTIFACT).is_some_and(|spec| spec.gated));
        assert!(registry.get(SET_STORY_FIELD).is_some_and(|spec| !spec.gated));
        assert!(!registry
            .get(SET_STORY_FIELD)
            .is_some_and(ToolSpec::needs_credential));
    }

    #[test]
    fn test_unknown_tool_is_absent() {
        let registry = ToolRegistry::default();
        assert!(registry.get("launch_rocket").is_none());
        assert!(!registry.names().any(|name| name == "launch_rocket"));
    }

    #[test]
    fn test_validate_argument_schema() {
        let registry = ToolRegistry::default();
        let spec = |name: &str| registry.get(name).expect("builtin tool");
        assert!(spec(CREATE_CHARACTER)
            .validate_args(&args(json!({"name": "Ari", "prompt": "a fox scout"})))
            .is_ok());

        let missing = spec(CREATE_CHARACTER)
            .validate_args(&args(json!({"name": "Ari"})))
            .expect_err("missing prompt");
        assert!(missing.to_string().contains("missing required argument `prompt`"));

        let blank = spec(CREATE_CHARACTER)
            .validate_args(&args(json!({"name": " ", "prompt": "x"})))
            .expect_err("blank name");
        assert!(blank.to_string().contains("must not be empty"));

        let wrong_type = spec(CREATE_SCENE)
            .validate_args(&args(json!({"name": "s", "prompt": "p", "character_ids": "abc"})))
            .expect_err("wrong type");
        assert!(wrong_type.to_string().contains("a list of strings"));

        let extra = spec(CREATE_BACKGROUND)
            .validate_args(&args(json!({"name": "b", "prompt": "p", "seed": 4})))
            .expect_err("unexpected");
        assert!(extra.to_string().contains("unexpected argument `seed`"));
    }

    #[test]
    fn test_set_gated_overrides_builtin() {
        let mut registry = ToolRegistry::default();
        assert!(registry.set_gated(CREATE_SCENE, false));
        assert!(!registry.set_gated("nope", false));
        assert!(registry.get(CREATE_SCENE).is_some_and(|spec| !spec.gated));
    }
}
