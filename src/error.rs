use crate::types::{Actor, ArtifactId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("patch has no operations")]
    Empty,
    #[error("invalid field path `{0}`")]
    InvalidPath(String),
    #[error("field root `{0}` is reserved for typed state")]
    ReservedField(String),
    #[error("field `{0}` is not an object")]
    NotAnObject(String),
    #[error("artifact {0} already exists")]
    DuplicateArtifact(ArtifactId),
    #[error("{0} may not write the credential")]
    CredentialNotWritable(Actor),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("version conflict: patch based on {based_on}, store is at {current}")]
    Conflict { based_on: u64, current: u64 },
    #[error("invalid patch: {0}")]
    InvalidPatch(#[from] PatchError),
    #[error("patch still conflicting after {attempts} attempts")]
    RetriesExhausted { attempts: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("backend rejected the request: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments for `{tool}`: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("no credential is set; enter one before running `{tool}`")]
    MissingCredential { tool: String },
    #[error("artifact {0} not found")]
    ArtifactNotFound(ArtifactId),
    #[error("generation failed after {attempts} attempt(s): {source}")]
    Backend {
        attempts: u32,
        #[source]
        source: BackendError,
    },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl InvocationError {
    pub fn invalid(tool: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTool(_) => ErrorKind::UnknownTool,
            Self::InvalidArguments { .. } => ErrorKind::InvalidArguments,
            Self::MissingCredential { .. } => ErrorKind::MissingCredential,
            Self::ArtifactNotFound(_) => ErrorKind::ArtifactNotFound,
            Self::Backend { source, .. } if source.is_transient() => ErrorKind::TransientBackend,
            Self::Backend { .. } => ErrorKind::PermanentBackend,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Store(_) => ErrorKind::State,
        }
    }

    pub fn info(&self) -> ToolErrorInfo {
        ToolErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownTool,
    InvalidArguments,
    MissingCredential,
    ArtifactNotFound,
    TransientBackend,
    PermanentBackend,
    Cancelled,
    State,
}

/// Wire form of an [`InvocationError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sync channel closed")]
pub struct ChannelClosed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_kind_follows_transience() {
        let transient = InvocationError::Backend {
            attempts: 3,
            source: BackendError::Transient("rate limited".to_string()),
        };
        assert_eq!(transient.kind(), ErrorKind::TransientBackend);
        assert!(transient.to_string().contains("after 3 attempt(s)"));

        let permanent = InvocationError::Backend {
            attempts: 1,
            source: BackendError::Permanent("bad prompt".to_string()),
        };
        assert_eq!(permanent.info().kind, ErrorKind::PermanentBackend);
    }

    #[test]
    fn test_missing_credential_message_is_user_actionable() {
        let err = InvocationError::MissingCredential {
            tool: "create_character".to_string(),
        };
        let info = err.info();
        assert_eq!(info.kind, ErrorKind::MissingCredential);
        assert!(info.message.contains("enter one"));
    }
}
