use super::ids::InvocationId;
use super::state::Artifact;
use crate::error::ToolErrorInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub type ToolArgs = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Requested,
    AwaitingApproval,
    Approved,
    Rejected,
    Running,
    Succeeded,
    Failed,
    Expired,
}

impl InvocationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Succeeded | Self::Failed | Self::Expired
        )
    }

    pub fn can_transition_to(self, next: InvocationStatus) -> bool {
        use InvocationStatus::*;
        matches!(
            (self, next),
            (Requested, AwaitingApproval)
                | (Requested, Running)
                | (Requested, Failed)
                | (Requested, Expired)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Rejected)
                | (AwaitingApproval, Failed)
                | (AwaitingApproval, Expired)
                | (Approved, Running)
                | (Approved, Failed)
                | (Approved, Expired)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome stored on a terminal invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Succeeded {
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact: Option<Artifact>,
    },
    Rejected {
        reason: String,
    },
    Failed {
        error: ToolErrorInfo,
    },
    Expired {
        reason: String,
    },
}

impl InvocationOutcome {
    pub fn status(&self) -> InvocationStatus {
        match self {
            Self::Succeeded { .. } => InvocationStatus::Succeeded,
            Self::Rejected { .. } => InvocationStatus::Rejected,
            Self::Failed { .. } => InvocationStatus::Failed,
            Self::Expired { .. } => InvocationStatus::Expired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: InvocationId,
    pub tool: String,
    pub args: ToolArgs,
    pub status: InvocationStatus,
    #[serde(default)]
    pub result: Option<InvocationOutcome>,
    pub gated: bool,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, args: ToolArgs, gated: bool) -> Self {
        Self {
            id: InvocationId::new(),
            tool: tool.into(),
            args,
            status: InvocationStatus::Requested,
            result: None,
            gated,
            requested_at: Utc::now(),
            decided_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub invocation_id: InvocationId,
    pub decision: Decision,
    /// Replacement arguments, e.g. a prompt the user rewrote before approving.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_args: Option<ToolArgs>,
    pub decided_at: DateTime<Utc>,
}

impl ApprovalDecision {
    pub fn approve(invocation_id: InvocationId) -> Self {
        Self {
            invocation_id,
            decision: Decision::Approve,
            edited_args: None,
            decided_at: Utc::now(),
        }
    }

    pub fn approve_with(invocation_id: InvocationId, edited_args: ToolArgs) -> Self {
        Self {
            edited_args: Some(edited_args),
            ..Self::approve(invocation_id)
        }
    }

    pub fn reject(invocation_id: InvocationId) -> Self {
        Self {
            invocation_id,
            decision: Decision::Reject,
            edited_args: None,
            decided_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub invocation_id: InvocationId,
    pub tool: String,
    pub args: ToolArgs,
    pub credential_present: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationEvent {
    pub invocation_id: InvocationId,
    pub tool: String,
    pub status: InvocationStatus,
    pub detail: EventDetail,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDetail {
    /// Plain lifecycle step with no payload.
    Status,
    Progress { attempt: u32, message: String },
    Outcome(InvocationOutcome),
}

/// What the agent's reasoning loop sees as the result of a tool call.
/// Rejections are ordinary output, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub invocation_id: InvocationId,
    pub tool: String,
    pub status: InvocationStatus,
    pub output: Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn from_outcome(invocation_id: InvocationId, tool: &str, outcome: &InvocationOutcome) -> Self {
        let (output, is_error) = match outcome {
            InvocationOutcome::Succeeded { output, .. } => (output.clone(), false),
            InvocationOutcome::Rejected { reason } => (
                Value::String(format!("The user rejected `{tool}`: {reason}")),
                false,
            ),
            InvocationOutcome::Failed { error } => (
                serde_json::to_value(error).unwrap_or_else(|_| Value::String(error.message.clone())),
                true,
            ),
            InvocationOutcome::Expired { reason } => (
                Value::String(format!("`{tool}` expired before it ran: {reason}")),
                true,
            ),
        };
        Self {
            invocation_id,
            tool: tool.to_string(),
            status: outcome.status(),
            output,
            is_error,
        }
    }
}
