use super::events::EventSink;
use super::gate::{ApprovalGate, ApprovalTicket, GateOutcome};
use super::supervisor::ExecutionSupervisor;
use super::table::InvocationTable;
use crate::error::InvocationError;
use crate::state::StateStore;
use crate::tools::{check_artifact_refs, resolve_state_refs, ToolAction, ToolRegistry, ToolSpec};
use crate::types::{
    split_field_path, ApprovalDecision, ApprovalRequest, InvocationId, InvocationOutcome,
    InvocationStatus, SharedState, ToolArgs, ToolInvocation, ToolResult,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const SESSION_CLOSED_REASON: &str = "session closed before a decision was made";

struct Inner {
    registry: Arc<ToolRegistry>,
    store: Arc<StateStore>,
    table: InvocationTable,
    gate: ApprovalGate,
    supervisor: ExecutionSupervisor,
    events: EventSink,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    cancels: Mutex<HashMap<InvocationId, CancellationToken>>,
}

/// Entry point for tool calls: validates and resolves arguments, routes
/// gated tools through the approval gate and hands the rest to the
/// execution supervisor. Each invocation is driven by its own task.
#[derive(Clone)]
pub struct InvocationPipeline {
    inner: Arc<Inner>,
}

impl InvocationPipeline {
    pub fn new(
        registry: Arc<ToolRegistry>,
        store: Arc<StateStore>,
        gate: ApprovalGate,
        supervisor: ExecutionSupervisor,
        events: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                table: InvocationTable::new(),
                gate,
                supervisor,
                events,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                cancels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn request_invocation(
        &self,
        tool: &str,
        args: ToolArgs,
    ) -> Result<InvocationId, InvocationError> {
        self.submit(tool, args, |_| {})
    }

    /// Like [`request_invocation`](Self::request_invocation), calling
    /// `accepted` with the new id before any event for it is emitted.
    pub fn submit<F>(
        &self,
        tool: &str,
        args: ToolArgs,
        accepted: F,
    ) -> Result<InvocationId, InvocationError>
    where
        F: FnOnce(InvocationId),
    {
        let inner = &self.inner;
        let spec = inner
            .registry
            .get(tool)
            .cloned()
            .ok_or_else(|| InvocationError::UnknownTool(tool.to_string()))?;
        let snapshot = inner.store.snapshot();
        let resolved = prepare_args(&spec, &args, &snapshot)?;

        if inner.shutdown.is_cancelled() {
            return Err(InvocationError::Cancelled);
        }

        let invocation = ToolInvocation::new(tool, resolved, spec.gated);
        let id = invocation.id;
        let cancel = inner.shutdown.child_token();
        inner.table.insert(invocation);
        inner.lock_cancels().insert(id, cancel.clone());
        tracing::info!(invocation_id = %id, tool, gated = spec.gated, "invocation requested");

        accepted(id);

        let ticket = spec.gated.then(|| self.open_gate(id, &snapshot));
        let pipeline = self.clone();
        inner.tracker.spawn(async move {
            pipeline.drive(id, spec, ticket, cancel).await;
        });
        Ok(id)
    }

    /// Routes a decision to its invocation. Returns `false` when the
    /// invocation is not awaiting approval.
    pub fn decide(&self, decision: ApprovalDecision) -> bool {
        let id = decision.invocation_id;
        if self.inner.table.status(id) != Some(InvocationStatus::AwaitingApproval) {
            tracing::debug!(invocation_id = %id, "decision ignored; not awaiting approval");
            return false;
        }
        self.inner.gate.decide(decision)
    }

    /// Cancels one invocation. Terminal or unknown invocations are left
    /// alone and `false` is returned.
    pub fn cancel(&self, id: InvocationId) -> bool {
        let terminal = self
            .inner
            .table
            .status(id)
            .map_or(true, InvocationStatus::is_terminal);
        if terminal {
            return false;
        }
        match self.inner.lock_cancels().get(&id) {
            Some(token) => {
                tracing::info!(invocation_id = %id, "invocation cancel requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Re-sends the approval request of every invocation still awaiting a
    /// decision, e.g. to a UI that just re-attached.
    pub fn resend_pending_approvals(&self) -> usize {
        let has_credential = self.inner.store.snapshot().has_credential();
        let pending = self.inner.table.awaiting_approval();
        for invocation in &pending {
            self.inner.events.approval_request(ApprovalRequest {
                invocation_id: invocation.id,
                tool: invocation.tool.clone(),
                args: invocation.args.clone(),
                credential_present: has_credential,
                expires_at: self.inner.gate.expires_at(invocation.id),
            });
        }
        pending.len()
    }

    pub fn invocation(&self, id: InvocationId) -> Option<ToolInvocation> {
        self.inner.table.get(id)
    }

    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.inner.table.all()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.table.pending_count()
    }

    /// Expires everything awaiting approval, cancels running work and waits
    /// for every invocation task to settle.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    fn open_gate(&self, id: InvocationId, snapshot: &SharedState) -> ApprovalTicket {
        let inner = &self.inner;
        let ticket = inner.gate.open(id);
        if let Some(awaiting) = inner.table.advance(id, InvocationStatus::AwaitingApproval) {
            inner.events.status(&awaiting);
            inner.events.approval_request(ApprovalRequest {
                invocation_id: id,
                tool: awaiting.tool.clone(),
                args: awaiting.args.clone(),
                credential_present: snapshot.has_credential(),
                expires_at: ticket.expires_at(),
            });
        }
        ticket
    }

    async fn drive(
        self,
        id: InvocationId,
        spec: ToolSpec,
        ticket: Option<ApprovalTicket>,
        cancel: CancellationToken,
    ) {
        if let Some(ticket) = ticket {
            match self.inner.gate.wait(ticket, &cancel).await {
                GateOutcome::Approved { edited_args } => {
                    if let Some(approved) = self.inner.table.advance(id, InvocationStatus::Approved) {
                        tracing::info!(invocation_id = %id, edited = edited_args.is_some(), "invocation approved");
                        self.inner.events.status(&approved);
                    }
                    if let Some(edited) = edited_args {
                        let snapshot = self.inner.store.snapshot();
                        match prepare_args(&spec, &edited, &snapshot) {
                            Ok(resolved) => self.inner.table.set_args(id, resolved),
                            Err(err) => {
                                return self.finish(id, InvocationOutcome::Failed { error: err.info() });
                            }
                        }
                    }
                }
                GateOutcome::Rejected { reason } => {
                    tracing::info!(invocation_id = %id, "invocation rejected");
                    return self.finish(id, InvocationOutcome::Rejected { reason });
                }
                GateOutcome::Expired { reason } => {
                    let reason = if self.inner.shutdown.is_cancelled() {
                        SESSION_CLOSED_REASON.to_string()
                    } else {
                        reason
                    };
                    tracing::info!(invocation_id = %id, %reason, "invocation expired");
                    return self.finish(id, InvocationOutcome::Expired { reason });
                }
            }
        }

        if cancel.is_cancelled() {
            return self.finish(
                id,
                InvocationOutcome::Expired {
                    reason: "cancelled before dispatch".to_string(),
                },
            );
        }

        // Approval may have taken arbitrarily long; the credential is read
        // again right before dispatch.
        let credential = if spec.needs_credential() {
            match self.inner.store.snapshot().credential.clone() {
                Some(credential) if !credential.trim().is_empty() => Some(credential),
                _ => {
                    let err = InvocationError::MissingCredential {
                        tool: spec.name.clone(),
                    };
                    tracing::warn!(invocation_id = %id, tool = %spec.name, "credential missing at dispatch");
                    return self.finish(id, InvocationOutcome::Failed { error: err.info() });
                }
            }
        } else {
            None
        };

        let Some(running) = self.inner.table.advance(id, InvocationStatus::Running) else {
            return;
        };
        self.inner.events.status(&running);

        let outcome = self
            .inner
            .supervisor
            .execute(&running, spec.action, credential, &self.inner.events, &cancel)
            .await;
        self.finish(id, outcome);
    }

    fn finish(&self, id: InvocationId, outcome: InvocationOutcome) {
        self.inner.lock_cancels().remove(&id);
        let Some(finished) = self.inner.table.finish(id, outcome.clone()) else {
            return;
        };
        tracing::debug!(invocation_id = %id, status = %finished.status, "invocation finished");
        let result = ToolResult::from_outcome(id, &finished.tool, &outcome);
        self.inner.events.outcome(&finished, outcome);
        self.inner.events.tool_result(result);
    }
}

impl Inner {
    fn lock_cancels(&self) -> MutexGuard<'_, HashMap<InvocationId, CancellationToken>> {
        self.cancels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Resolves state references and checks the result against the tool's
/// schema and the artifacts it points at.
fn prepare_args(
    spec: &ToolSpec,
    args: &ToolArgs,
    state: &SharedState,
) -> Result<ToolArgs, InvocationError> {
    let resolved = resolve_state_refs(&spec.name, args, state)?;
    spec.validate_args(&resolved)?;
    check_artifact_refs(spec, &resolved, state)?;
    if spec.action == ToolAction::SetField {
        let path = resolved.get("path").and_then(Value::as_str).unwrap_or_default();
        split_field_path(path).map_err(|err| InvocationError::invalid(&spec.name, err.to_string()))?;
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::error::ErrorKind;
    use crate::invocation::RetryPolicy;
    use crate::sync::{PeerEndpoint, SessionPorts};
    use crate::types::{Actor, Patch, Peer, SessionId, SessionMessage};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        pipeline: InvocationPipeline,
        store: Arc<StateStore>,
        agent: PeerEndpoint,
        ui: PeerEndpoint,
        _ports: Arc<SessionPorts>,
    }

    fn harness(backend: ScriptedBackend) -> Harness {
        let store = Arc::new(StateStore::new());
        let (ports, _inbox) = SessionPorts::new(SessionId::new());
        let ports = Arc::new(ports);
        let agent = ports.attach(Peer::Agent);
        let ui = ports.attach(Peer::Ui);
        let supervisor = ExecutionSupervisor::new(
            Arc::clone(&store),
            Arc::new(backend),
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            4,
        );
        let pipeline = InvocationPipeline::new(
            Arc::new(ToolRegistry::default()),
            Arc::clone(&store),
            ApprovalGate::new(None),
            supervisor,
            EventSink::new(Arc::clone(&ports)),
        );
        Harness {
            pipeline,
            store,
            agent,
            ui,
            _ports: ports,
        }
    }

    fn args(value: Value) -> ToolArgs {
        value.as_object().cloned().unwrap_or_default()
    }

    fn set_credential(store: &StateStore, credential: Option<&str>) {
        store
            .apply(
                Actor::Ui,
                store.version(),
                Patch::credential(credential.map(ToString::to_string)),
            )
            .expect("credential");
    }

    async fn next_tool_result(endpoint: &mut PeerEndpoint) -> ToolResult {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), endpoint.recv()).await {
                Ok(Some(SessionMessage::ToolResult(result))) => return result,
                Ok(Some(_)) => continue,
                other => panic!("no tool result: {other:?}"),
            }
        }
    }

    async fn next_approval(endpoint: &mut PeerEndpoint) -> ApprovalRequest {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), endpoint.recv()).await {
                Ok(Some(SessionMessage::ApprovalRequest(request))) => return request,
                Ok(Some(_)) => continue,
                other => panic!("no approval request: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_args_create_nothing() {
        let h = harness(ScriptedBackend::new());
        assert_eq!(
            h.pipeline.request_invocation("paint_wall", ToolArgs::new()),
            Err(InvocationError::UnknownTool("paint_wall".to_string()))
        );
        let err = h
            .pipeline
            .request_invocation("create_character", args(json!({"name": "Ari"})))
            .expect_err("missing prompt");
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
        assert!(h.pipeline.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_gated_invocation_waits_for_approval() {
        let mut h = harness(ScriptedBackend::new());
        set_credential(&h.store, Some("key"));
        let id = h
            .pipeline
            .request_invocation(
                "create_character",
                args(json!({"name": "Ari", "prompt": "a fox scout"})),
            )
            .expect("request");

        let request = next_approval(&mut h.ui).await;
        assert_eq!(request.invocation_id, id);
        assert!(request.credential_present);
        assert_eq!(
            h.pipeline.invocation(id).map(|inv| inv.status),
            Some(InvocationStatus::AwaitingApproval)
        );

        assert!(h.pipeline.decide(ApprovalDecision::approve(id)));
        let result = next_tool_result(&mut h.agent).await;
        assert_eq!(result.status, InvocationStatus::Succeeded);
        assert!(!result.is_error);
        assert!(!h.pipeline.decide(ApprovalDecision::approve(id)));
        assert_eq!(h.store.snapshot().characters.len(), 1);
    }

    #[tokio::test]
    async fn test_edited_args_are_revalidated() {
        let mut h = harness(ScriptedBackend::new());
        set_credential(&h.store, Some("key"));
        let id = h
            .pipeline
            .request_invocation(
                "create_character",
                args(json!({"name": "Ari", "prompt": "a fox scout"})),
            )
            .expect("request");
        next_approval(&mut h.ui).await;

        assert!(h.pipeline.decide(ApprovalDecision::approve_with(
            id,
            args(json!({"name": "Ari", "prompt": ""}))
        )));
        let result = next_tool_result(&mut h.agent).await;
        assert_eq!(result.status, InvocationStatus::Failed);
        assert!(result.is_error);
        assert_eq!(result.output["kind"], json!("invalid_arguments"));
    }

    #[tokio::test]
    async fn test_ungated_tool_runs_immediately() {
        let mut h = harness(ScriptedBackend::new());
        let id = h
            .pipeline
            .request_invocation(
                "set_story_field",
                args(json!({"path": "story.mood", "value": "tense"})),
            )
            .expect("request");
        let result = next_tool_result(&mut h.agent).await;
        assert_eq!(result.invocation_id, id);
        assert_eq!(result.status, InvocationStatus::Succeeded);
        assert_eq!(h.store.snapshot().field("story.mood"), Some(&json!("tense")));
        assert!(h.ui.try_recv().is_some(), "ui sees lifecycle events");
    }

    #[tokio::test]
    async fn test_state_refs_resolve_before_validation() {
        let mut h = harness(ScriptedBackend::new());
        h.store
            .apply(Actor::Agent, 0, Patch::set("story.premise", json!("a lighthouse keeper")))
            .expect("premise");
        set_credential(&h.store, Some("key"));

        let id = h
            .pipeline
            .request_invocation(
                "create_character",
                args(json!({"name": "Mara", "prompt": {"$state": "story.premise"}})),
            )
            .expect("reference resolves to a string");
        let request = next_approval(&mut h.ui).await;
        assert_eq!(request.invocation_id, id);
        assert_eq!(request.args["prompt"], json!("a lighthouse keeper"));

        let err = h
            .pipeline
            .request_invocation(
                "create_character",
                args(json!({"name": "Mara", "prompt": {"$state": "story.missing"}})),
            )
            .expect_err("unset reference");
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[tokio::test]
    async fn test_reserved_set_field_path_is_refused_up_front() {
        let h = harness(ScriptedBackend::new());
        let err = h
            .pipeline
            .request_invocation(
                "set_story_field",
                args(json!({"path": "credential", "value": "x"})),
            )
            .expect_err("reserved");
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[tokio::test]
    async fn test_cancel_awaiting_expires_and_repeat_is_noop() {
        let mut h = harness(ScriptedBackend::new());
        let id = h
            .pipeline
            .request_invocation(
                "create_background",
                args(json!({"name": "Dock", "prompt": "rain"})),
            )
            .expect("request");
        let request = next_approval(&mut h.ui).await;
        assert!(!request.credential_present);

        assert!(h.pipeline.cancel(id));
        let result = next_tool_result(&mut h.agent).await;
        assert_eq!(result.status, InvocationStatus::Expired);
        assert!(!h.pipeline.cancel(id));
        assert!(!h.pipeline.cancel(InvocationId::new()));
    }

    #[tokio::test]
    async fn test_shutdown_expires_pending_and_refuses_new_work() {
        let mut h = harness(ScriptedBackend::new());
        let id = h
            .pipeline
            .request_invocation(
                "create_character",
                args(json!({"name": "Ari", "prompt": "fox"})),
            )
            .expect("request");
        next_approval(&mut h.ui).await;

        h.pipeline.shutdown().await;
        let invocation = h.pipeline.invocation(id).expect("invocation");
        assert_eq!(invocation.status, InvocationStatus::Expired);
        assert_eq!(
            invocation.result,
            Some(InvocationOutcome::Expired {
                reason: SESSION_CLOSED_REASON.to_string()
            })
        );
        assert_eq!(h.pipeline.pending_count(), 0);
        assert_eq!(
            h.pipeline.request_invocation(
                "set_story_field",
                args(json!({"path": "a", "value": 1}))
            ),
            Err(InvocationError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_resend_pending_approvals() {
        let mut h = harness(ScriptedBackend::new());
        let id = h
            .pipeline
            .request_invocation(
                "create_character",
                args(json!({"name": "Ari", "prompt": "fox"})),
            )
            .expect("request");
        next_approval(&mut h.ui).await;

        assert_eq!(h.pipeline.resend_pending_approvals(), 1);
        assert_eq!(next_approval(&mut h.ui).await.invocation_id, id);
    }
}
