use crate::backend::GenerationBackend;
use crate::config::Config;
use crate::error::{ChannelClosed, StoreError};
use crate::invocation::{ApprovalGate, EventSink, ExecutionSupervisor, InvocationPipeline};
use crate::state::{StateChange, StateStore};
use crate::sync::{Inbound, PeerEndpoint, SeqTracker, SessionPorts};
use crate::tools::ToolRegistry;
use crate::types::{
    InvocationId, Party, Peer, PeerMessage, SessionId, SessionMessage, SharedState, ToolInvocation,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

struct Shared {
    id: SessionId,
    store: Arc<StateStore>,
    ports: Arc<SessionPorts>,
    pipeline: InvocationPipeline,
    patch_retries: usize,
    shutdown: CancellationToken,
    closed: watch::Receiver<bool>,
}

/// A freshly opened session with both peers attached.
pub struct Session {
    pub handle: SessionHandle,
    pub agent: PeerEndpoint,
    pub ui: PeerEndpoint,
}

impl Session {
    /// Opens a session and starts its tasks on the current runtime.
    pub fn open(
        config: &Config,
        registry: ToolRegistry,
        backend: Arc<dyn GenerationBackend>,
    ) -> Self {
        Self::open_with_state(config, registry, backend, SharedState::default())
    }

    pub fn open_with_state(
        config: &Config,
        registry: ToolRegistry,
        backend: Arc<dyn GenerationBackend>,
        initial: SharedState,
    ) -> Self {
        let id = SessionId::new();
        let store = Arc::new(StateStore::with_state(initial));
        let (ports, inbox) = SessionPorts::new(id);
        let ports = Arc::new(ports);

        let supervisor = ExecutionSupervisor::new(
            Arc::clone(&store),
            backend,
            config.retry_policy(),
            config.patch_retries,
        );
        let pipeline = InvocationPipeline::new(
            Arc::new(registry),
            Arc::clone(&store),
            ApprovalGate::new(config.approval_timeout),
            supervisor,
            EventSink::new(Arc::clone(&ports)),
        );

        let (closed_tx, closed) = watch::channel(false);
        let shared = Arc::new(Shared {
            id,
            store,
            ports,
            pipeline,
            patch_retries: config.patch_retries,
            shutdown: CancellationToken::new(),
            closed,
        });

        let agent = shared.ports.attach(Peer::Agent);
        let ui = shared.ports.attach(Peer::Ui);

        let ports = Arc::clone(&shared.ports);
        shared.store.on_change(move |change| publish(&ports, change));
        tokio::spawn(run(Arc::clone(&shared), inbox, closed_tx));

        tracing::info!(session_id = %id, "session opened");
        Self {
            handle: SessionHandle { shared },
            agent,
            ui,
        }
    }
}

/// Cheap, cloneable control surface for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn snapshot(&self) -> Arc<SharedState> {
        self.shared.store.snapshot()
    }

    pub fn version(&self) -> u64 {
        self.shared.store.version()
    }

    pub fn invocation(&self, id: InvocationId) -> Option<ToolInvocation> {
        self.shared.pipeline.invocation(id)
    }

    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.shared.pipeline.invocations()
    }

    /// Sends the current state to `peer`. Returns `false` when the peer is
    /// not attached.
    pub fn send_snapshot(&self, peer: Peer) -> bool {
        send_snapshot(&self.shared, peer)
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Attaches a new UI connection, replacing any previous one. The new
    /// endpoint first receives a snapshot, then every approval request still
    /// waiting for a decision.
    pub fn attach_ui(&self) -> Result<PeerEndpoint, ChannelClosed> {
        if self.shared.shutdown.is_cancelled() || self.is_closed() {
            return Err(ChannelClosed);
        }
        let endpoint = self.shared.ports.attach(Peer::Ui);
        send_snapshot(&self.shared, Peer::Ui);
        let resent = self.shared.pipeline.resend_pending_approvals();
        tracing::info!(session_id = %self.shared.id, resent, "ui re-attached");
        Ok(endpoint)
    }

    /// Stops the session and waits until it has fully closed.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.closed().await;
    }

    pub async fn closed(&self) {
        let mut closed = self.shared.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

async fn run(
    shared: Arc<Shared>,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
    closed: watch::Sender<bool>,
) {
    let mut received: HashMap<(Peer, u64), SeqTracker> = HashMap::new();

    loop {
        let inbound = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            inbound = inbox.recv() => inbound,
        };

        match inbound {
            Some(Inbound::Message {
                peer,
                connection,
                envelope,
            }) => {
                if !shared.ports.is_current(peer, connection) {
                    tracing::debug!(session_id = %shared.id, %peer, connection, "message from replaced connection dropped");
                    continue;
                }
                if envelope.session_id != shared.id || envelope.sender != Party::from(peer) {
                    tracing::warn!(
                        session_id = %shared.id,
                        %peer,
                        envelope_session = %envelope.session_id,
                        "misaddressed envelope dropped"
                    );
                    continue;
                }
                if !received
                    .entry((peer, connection))
                    .or_default()
                    .accept(envelope.seq)
                {
                    tracing::trace!(session_id = %shared.id, %peer, seq = envelope.seq, "duplicate envelope dropped");
                    continue;
                }
                dispatch(&shared, peer, envelope.message);
            }
            Some(Inbound::Detached { peer, connection }) => {
                if !shared.ports.detach(peer, connection) {
                    continue;
                }
                received.remove(&(peer, connection));
                match peer {
                    Peer::Agent => {
                        tracing::info!(session_id = %shared.id, "agent disconnected; closing session");
                        break;
                    }
                    Peer::Ui => {
                        tracing::info!(session_id = %shared.id, "ui detached; awaiting re-attach");
                    }
                }
            }
            None => break,
        }
    }

    shared.shutdown.cancel();
    shared.pipeline.shutdown().await;
    shared.ports.close_all();
    let _ = closed.send(true);
    tracing::info!(session_id = %shared.id, "session closed");
}

fn dispatch(shared: &Shared, peer: Peer, message: PeerMessage) {
    match message {
        PeerMessage::StatePatch {
            based_on_version,
            patch,
        } => {
            let outcome =
                shared
                    .store
                    .apply_or_rebase(peer.actor(), based_on_version, patch, shared.patch_retries);
            if let Err(err) = outcome {
                let resync = !matches!(err, StoreError::InvalidPatch(_));
                shared.ports.send(
                    peer,
                    SessionMessage::PatchRejected {
                        based_on_version,
                        current_version: shared.store.version(),
                        reason: err.to_string(),
                    },
                );
                if resync {
                    send_snapshot(shared, peer);
                }
            }
        }
        PeerMessage::SnapshotRequest => {
            send_snapshot(shared, peer);
        }
        PeerMessage::ApprovalDecision(decision) => {
            if peer != Peer::Ui {
                tracing::warn!(session_id = %shared.id, %peer, "approval decisions are only taken from the ui");
                return;
            }
            let invocation_id = decision.invocation_id;
            if !shared.pipeline.decide(decision) {
                tracing::debug!(session_id = %shared.id, %invocation_id, "decision had no pending approval");
            }
        }
        PeerMessage::InvocationRequest {
            request_id,
            tool,
            args,
        } => {
            if peer != Peer::Agent {
                tracing::warn!(session_id = %shared.id, %peer, %tool, "tool invocations are only taken from the agent");
                return;
            }
            let ports = Arc::clone(&shared.ports);
            let accepted_id = request_id.clone();
            let submitted = shared.pipeline.submit(&tool, args, move |invocation_id| {
                ports.send(
                    Peer::Agent,
                    SessionMessage::InvocationAccepted {
                        request_id: accepted_id,
                        invocation_id,
                    },
                );
            });
            if let Err(err) = submitted {
                tracing::info!(session_id = %shared.id, %tool, error = %err, "invocation refused");
                shared.ports.send(
                    Peer::Agent,
                    SessionMessage::InvocationRefused {
                        request_id,
                        error: err.info(),
                    },
                );
            }
        }
        PeerMessage::CancelInvocation { invocation_id } => {
            if !shared.pipeline.cancel(invocation_id) {
                tracing::debug!(session_id = %shared.id, %invocation_id, "cancel was a no-op");
            }
        }
    }
}

/// Sent under the store's read lock so the snapshot is queued ahead of the
/// next version's patch.
fn send_snapshot(shared: &Shared, peer: Peer) -> bool {
    shared.store.with_current(|state| {
        shared.ports.send(
            peer,
            SessionMessage::StateSnapshot {
                state: SharedState::clone(state),
            },
        )
    })
}

fn publish(ports: &SessionPorts, change: &StateChange) {
    ports.broadcast(SessionMessage::StatePatch {
        version: change.version,
        actor: change.actor,
        patch: change.patch.clone(),
    });
}
