use crate::sync::SessionPorts;
use crate::types::{
    ApprovalRequest, EventDetail, InvocationEvent, InvocationOutcome, Peer, SessionMessage,
    ToolInvocation, ToolResult,
};
use chrono::Utc;
use std::sync::Arc;

/// Routes invocation traffic to the peers that consume it: lifecycle events
/// to both, approval requests to the UI, tool results to the agent.
#[derive(Clone)]
pub struct EventSink {
    ports: Arc<SessionPorts>,
}

impl EventSink {
    pub fn new(ports: Arc<SessionPorts>) -> Self {
        Self { ports }
    }

    pub fn status(&self, invocation: &ToolInvocation) {
        self.emit(invocation, EventDetail::Status);
    }

    pub fn progress(&self, invocation: &ToolInvocation, attempt: u32, message: impl Into<String>) {
        self.emit(
            invocation,
            EventDetail::Progress {
                attempt,
                message: message.into(),
            },
        );
    }

    pub fn outcome(&self, invocation: &ToolInvocation, outcome: InvocationOutcome) {
        self.emit(invocation, EventDetail::Outcome(outcome));
    }

    pub fn approval_request(&self, request: ApprovalRequest) -> bool {
        self.ports
            .send(Peer::Ui, SessionMessage::ApprovalRequest(request))
    }

    pub fn tool_result(&self, result: ToolResult) -> bool {
        self.ports.send(Peer::Agent, SessionMessage::ToolResult(result))
    }

    fn emit(&self, invocation: &ToolInvocation, detail: EventDetail) {
        self.ports
            .broadcast(SessionMessage::InvocationEvent(InvocationEvent {
                invocation_id: invocation.id,
                tool: invocation.tool.clone(),
                status: invocation.status,
                detail,
                at: Utc::now(),
            }));
    }
}
