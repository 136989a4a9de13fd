mod registry;
mod resolve;

pub use registry::{
    ArgKind, ArgSpec, ToolAction, ToolRegistry, ToolSpec, CREATE_BACKGROUND, CREATE_CHARACTER,
    CREATE_SCENE, EDIT_ARTIFACT, SET_STORY_FIELD,
};
pub use resolve::{check_artifact_refs, referenced_artifacts, resolve_state_refs, STATE_REF_KEY};
