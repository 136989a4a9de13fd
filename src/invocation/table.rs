use crate::types::{InvocationId, InvocationOutcome, InvocationStatus, ToolArgs, ToolInvocation};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Entries {
    by_id: HashMap<InvocationId, ToolInvocation>,
    order: Vec<InvocationId>,
}

/// Lifecycle bookkeeping for every invocation in a session. Only legal
/// status transitions are applied, so a terminal invocation can never be
/// finished twice.
#[derive(Default)]
pub struct InvocationTable {
    entries: Mutex<Entries>,
}

impl InvocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, invocation: ToolInvocation) {
        let mut entries = self.lock();
        if entries.by_id.insert(invocation.id, invocation.clone()).is_none() {
            entries.order.push(invocation.id);
        }
    }

    pub fn get(&self, id: InvocationId) -> Option<ToolInvocation> {
        self.lock().by_id.get(&id).cloned()
    }

    pub fn status(&self, id: InvocationId) -> Option<InvocationStatus> {
        self.lock().by_id.get(&id).map(|invocation| invocation.status)
    }

    /// All invocations in request order.
    pub fn all(&self) -> Vec<ToolInvocation> {
        let entries = self.lock();
        entries
            .order
            .iter()
            .filter_map(|id| entries.by_id.get(id).cloned())
            .collect()
    }

    pub fn awaiting_approval(&self) -> Vec<ToolInvocation> {
        self.all()
            .into_iter()
            .filter(|invocation| invocation.status == InvocationStatus::AwaitingApproval)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .by_id
            .values()
            .filter(|invocation| !invocation.status.is_terminal())
            .count()
    }

    /// Moves `id` to `next` if that transition is legal and returns the
    /// updated record.
    pub fn advance(&self, id: InvocationId, next: InvocationStatus) -> Option<ToolInvocation> {
        let mut entries = self.lock();
        let invocation = entries.by_id.get_mut(&id)?;
        if !invocation.status.can_transition_to(next) {
            tracing::debug!(
                invocation_id = %id,
                from = %invocation.status,
                to = %next,
                "ignored illegal invocation transition"
            );
            return None;
        }

        let now = Utc::now();
        invocation.status = next;
        if matches!(next, InvocationStatus::Approved | InvocationStatus::Rejected) {
            invocation.decided_at = Some(now);
        }
        if next.is_terminal() {
            invocation.completed_at = Some(now);
        }
        Some(invocation.clone())
    }

    /// Records the terminal outcome. Returns `None` when the invocation is
    /// unknown or already terminal.
    pub fn finish(&self, id: InvocationId, outcome: InvocationOutcome) -> Option<ToolInvocation> {
        let status = outcome.status();
        let mut entries = self.lock();
        let invocation = entries.by_id.get_mut(&id)?;
        if !invocation.status.can_transition_to(status) {
            return None;
        }

        let now = Utc::now();
        if status == InvocationStatus::Rejected {
            invocation.decided_at = Some(now);
        }
        invocation.status = status;
        invocation.completed_at = Some(now);
        invocation.result = Some(outcome);
        Some(invocation.clone())
    }

    pub fn set_args(&self, id: InvocationId, args: ToolArgs) {
        if let Some(invocation) = self.lock().by_id.get_mut(&id) {
            invocation.args = args;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn requested(gated: bool) -> ToolInvocation {
        ToolInvocation::new("create_character", ToolArgs::new(), gated)
    }

    #[test]
    fn test_advance_follows_lifecycle() {
        let table = InvocationTable::new();
        let invocation = requested(true);
        let id = invocation.id;
        table.insert(invocation);

        assert!(table.advance(id, InvocationStatus::Running).is_some());
        assert!(table.advance(id, InvocationStatus::AwaitingApproval).is_none());
        assert_eq!(table.status(id), Some(InvocationStatus::Running));
        assert_eq!(table.pending_count(), 1);
    }

    #[test]
    fn test_finish_only_once() {
        let table = InvocationTable::new();
        let invocation = requested(true);
        let id = invocation.id;
        table.insert(invocation);
        table
            .advance(id, InvocationStatus::AwaitingApproval)
            .expect("awaiting");

        let rejected = table
            .finish(
                id,
                InvocationOutcome::Rejected {
                    reason: "no".to_string(),
                },
            )
            .expect("finish");
        assert_eq!(rejected.status, InvocationStatus::Rejected);
        assert!(rejected.decided_at.is_some());
        assert!(rejected.completed_at.is_some());

        let again = table.finish(
            id,
            InvocationOutcome::Succeeded {
                output: json!({}),
                artifact: None,
            },
        );
        assert!(again.is_none());
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn test_listing_keeps_request_order_and_filters_awaiting() {
        let table = InvocationTable::new();
        let first = requested(true);
        let second = requested(false);
        let (first_id, second_id) = (first.id, second.id);
        table.insert(first);
        table.insert(second);
        table.advance(first_id, InvocationStatus::AwaitingApproval);

        let ids: Vec<_> = table.all().into_iter().map(|inv| inv.id).collect();
        assert_eq!(ids, vec![first_id, second_id]);
        let awaiting = table.awaiting_approval();
        assert_eq!(awaiting.len(), 1);
        assert_eq!(awaiting[0].id, first_id);
    }
}
