use super::ids::{InvocationId, SessionId};
use super::invocation::{ApprovalDecision, ApprovalRequest, InvocationEvent, ToolArgs, ToolResult};
use super::state::{Actor, Patch, SharedState};
use crate::error::ToolErrorInfo;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One side of a session's sync channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Peer {
    Agent,
    Ui,
}

impl Peer {
    pub fn actor(self) -> Actor {
        match self {
            Self::Agent => Actor::Agent,
            Self::Ui => Actor::Ui,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.actor().fmt(f)
    }
}

/// Whoever stamped an envelope's sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Agent,
    Ui,
    Session,
}

impl From<Peer> for Party {
    fn from(peer: Peer) -> Self {
        match peer {
            Peer::Agent => Self::Agent,
            Peer::Ui => Self::Ui,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    pub session_id: SessionId,
    pub sender: Party,
    /// Strictly increasing per sender and connection; used to drop
    /// retransmitted duplicates.
    pub seq: u64,
    pub message: M,
}

/// Messages a peer sends to its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerMessage {
    StatePatch {
        based_on_version: u64,
        patch: Patch,
    },
    SnapshotRequest,
    ApprovalDecision(ApprovalDecision),
    InvocationRequest {
        request_id: String,
        tool: String,
        #[serde(default)]
        args: ToolArgs,
    },
    CancelInvocation {
        invocation_id: InvocationId,
    },
}

/// Messages a session sends to its peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionMessage {
    StatePatch {
        version: u64,
        actor: Actor,
        patch: Patch,
    },
    StateSnapshot {
        state: SharedState,
    },
    PatchRejected {
        based_on_version: u64,
        current_version: u64,
        reason: String,
    },
    InvocationEvent(InvocationEvent),
    ApprovalRequest(ApprovalRequest),
    InvocationAccepted {
        request_id: String,
        invocation_id: InvocationId,
    },
    InvocationRefused {
        request_id: String,
        error: ToolErrorInfo,
    },
    ToolResult(ToolResult),
}

impl SessionMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatePatch { .. } => "state_patch",
            Self::StateSnapshot { .. } => "state_snapshot",
            Self::PatchRejected { .. } => "patch_rejected",
            Self::InvocationEvent(_) => "invocation_event",
            Self::ApprovalRequest(_) => "approval_request",
            Self::InvocationAccepted { .. } => "invocation_accepted",
            Self::InvocationRefused { .. } => "invocation_refused",
            Self::ToolResult(_) => "tool_result",
        }
    }
}
