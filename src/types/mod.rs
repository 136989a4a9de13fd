mod ids;
mod invocation;
mod message;
mod state;

pub use ids::{ArtifactId, InvocationId, SessionId};
pub use invocation::{
    ApprovalDecision, ApprovalRequest, Decision, EventDetail, InvocationEvent, InvocationOutcome,
    InvocationStatus, ToolArgs, ToolInvocation, ToolResult,
};
pub use message::{Envelope, Party, Peer, PeerMessage, SessionMessage};
pub use state::{
    split_field_path, Actor, Artifact, ArtifactKind, Patch, PatchOp, SharedState,
    RESERVED_FIELD_ROOTS,
};
