mod http;
mod scripted;

pub use http::HttpBackend;
pub use scripted::{ScriptedBackend, ScriptedCall};

use crate::error::BackendError;
use crate::types::ArtifactKind;
use async_trait::async_trait;
use serde::Serialize;

/// One generation call. The credential is never serialized.
#[derive(Clone, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub kind: ArtifactKind,
    #[serde(skip)]
    pub credential: String,
}

impl std::fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("prompt", &self.prompt)
            .field("kind", &self.kind)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Produces media for a prompt. Returns an opaque media reference.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<String, BackendError>;
}
