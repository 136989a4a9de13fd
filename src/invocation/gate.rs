use crate::types::{ApprovalDecision, Decision, InvocationId, ToolArgs};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub(crate) const REJECTED_REASON: &str = "rejected by the user";

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Approved { edited_args: Option<ToolArgs> },
    Rejected { reason: String },
    Expired { reason: String },
}

struct PendingApproval {
    respond: oneshot::Sender<ApprovalDecision>,
    expires_at: Option<DateTime<Utc>>,
}

/// Holds one response slot per invocation awaiting a human decision.
///
/// A slot is consumed by the first decision, a timeout or a cancel,
/// whichever comes first; anything that arrives later finds no slot and
/// is ignored.
pub struct ApprovalGate {
    pending: Mutex<HashMap<InvocationId, PendingApproval>>,
    timeout: Option<Duration>,
}

/// Receiving side of an opened gate slot.
pub struct ApprovalTicket {
    id: InvocationId,
    response: oneshot::Receiver<ApprovalDecision>,
    expires_at: Option<DateTime<Utc>>,
    deadline: Option<Instant>,
}

impl ApprovalTicket {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}

impl ApprovalGate {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn open(&self, id: InvocationId) -> ApprovalTicket {
        let (respond, response) = oneshot::channel();
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let expires_at = self
            .timeout
            .and_then(|timeout| chrono::Duration::from_std(timeout).ok())
            .map(|timeout| Utc::now() + timeout);
        self.lock().insert(
            id,
            PendingApproval {
                respond,
                expires_at,
            },
        );
        ApprovalTicket {
            id,
            response,
            expires_at,
            deadline,
        }
    }

    pub fn is_pending(&self, id: InvocationId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn expires_at(&self, id: InvocationId) -> Option<DateTime<Utc>> {
        self.lock().get(&id).and_then(|pending| pending.expires_at)
    }

    /// Delivers a decision. Returns `false` when no decision is awaited for
    /// that invocation, e.g. a retransmitted or late decision.
    pub fn decide(&self, decision: ApprovalDecision) -> bool {
        let Some(pending) = self.lock().remove(&decision.invocation_id) else {
            return false;
        };
        pending.respond.send(decision).is_ok()
    }

    fn withdraw(&self, id: InvocationId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Waits for the decision on `ticket`, its deadline, or `cancel`. The
    /// deadline is fixed when the gate opens, so it matches the advertised
    /// `expires_at` however late the wait starts.
    pub async fn wait(&self, ticket: ApprovalTicket, cancel: &CancellationToken) -> GateOutcome {
        let ApprovalTicket {
            id,
            mut response,
            deadline,
            ..
        } = ticket;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        // A decision that already claimed the slot wins over a cancel or the
        // timer firing in the same instant.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if self.withdraw(id) {
                    GateOutcome::Expired { reason: "cancelled before a decision was made".to_string() }
                } else {
                    resolve(response.await)
                }
            }
            decision = &mut response => resolve(decision),
            _ = expired => {
                if self.withdraw(id) {
                    GateOutcome::Expired { reason: format!("no decision within {}", describe(self.timeout)) }
                } else {
                    resolve(response.await)
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InvocationId, PendingApproval>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn describe(timeout: Option<Duration>) -> String {
    match timeout {
        Some(timeout) if timeout.as_millis() % 1000 == 0 => format!("{}s", timeout.as_secs()),
        Some(timeout) => format!("{}ms", timeout.as_millis()),
        None => "the allowed time".to_string(),
    }
}

fn resolve(decision: Result<ApprovalDecision, oneshot::error::RecvError>) -> GateOutcome {
    match decision {
        Ok(ApprovalDecision {
            decision: Decision::Approve,
            edited_args,
            ..
        }) => GateOutcome::Approved { edited_args },
        Ok(ApprovalDecision {
            decision: Decision::Reject,
            ..
        }) => GateOutcome::Rejected {
            reason: REJECTED_REASON.to_string(),
        },
        Err(_) => GateOutcome::Expired {
            reason: "approval channel closed".to_string(),
        },
    }
}
