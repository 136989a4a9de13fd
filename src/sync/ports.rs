use super::channel::{Inbound, PeerEndpoint};
use crate::types::{Envelope, Party, Peer, SessionId, SessionMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

struct PortSlot {
    connection: u64,
    next_seq: u64,
    tx: mpsc::UnboundedSender<Envelope<SessionMessage>>,
}

#[derive(Default)]
struct Slots {
    agent: Option<PortSlot>,
    ui: Option<PortSlot>,
}

impl Slots {
    fn get_mut(&mut self, peer: Peer) -> &mut Option<PortSlot> {
        match peer {
            Peer::Agent => &mut self.agent,
            Peer::Ui => &mut self.ui,
        }
    }
}

/// Session side of the sync channel: one outbound port per attached peer
/// and the shared inbox every endpoint writes into.
pub struct SessionPorts {
    session_id: SessionId,
    inbox: mpsc::UnboundedSender<Inbound>,
    slots: Mutex<Slots>,
    next_connection: AtomicU64,
}

impl SessionPorts {
    pub fn new(session_id: SessionId) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let ports = Self {
            session_id,
            inbox,
            slots: Mutex::new(Slots::default()),
            next_connection: AtomicU64::new(1),
        };
        (ports, inbox_rx)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Opens a new connection for `peer`, replacing any previous one. The
    /// replaced endpoint stops receiving messages.
    pub fn attach(&self, peer: Peer) -> PeerEndpoint {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slots = self.lock();
        *slots.get_mut(peer) = Some(PortSlot {
            connection,
            next_seq: 0,
            tx,
        });
        drop(slots);
        tracing::debug!(session_id = %self.session_id, %peer, connection, "peer attached");
        PeerEndpoint::new(peer, self.session_id, connection, self.inbox.clone(), rx)
    }

    /// Detaches `peer` if `connection` is still its live connection. A stale
    /// detach from a replaced endpoint is ignored.
    pub fn detach(&self, peer: Peer, connection: u64) -> bool {
        let mut slots = self.lock();
        let slot = slots.get_mut(peer);
        if slot.as_ref().is_some_and(|slot| slot.connection == connection) {
            *slot = None;
            tracing::debug!(session_id = %self.session_id, %peer, connection, "peer detached");
            return true;
        }
        false
    }

    pub fn is_current(&self, peer: Peer, connection: u64) -> bool {
        self.lock()
            .get_mut(peer)
            .as_ref()
            .is_some_and(|slot| slot.connection == connection)
    }

    pub fn is_attached(&self, peer: Peer) -> bool {
        self.lock().get_mut(peer).is_some()
    }

    /// Sends to one peer. Returns `false` when the peer is not attached.
    pub fn send(&self, peer: Peer, message: SessionMessage) -> bool {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(peer).as_mut() else {
            tracing::trace!(session_id = %self.session_id, %peer, kind = message.kind(), "peer detached; message dropped");
            return false;
        };
        slot.next_seq += 1;
        let envelope = Envelope {
            session_id: self.session_id,
            sender: Party::Session,
            seq: slot.next_seq,
            message,
        };
        slot.tx.send(envelope).is_ok()
    }

    pub fn broadcast(&self, message: SessionMessage) {
        self.send(Peer::Agent, message.clone());
        self.send(Peer::Ui, message);
    }

    /// Drops every outbound port; attached endpoints see end of stream.
    pub fn close_all(&self) {
        let mut slots = self.lock();
        slots.agent = None;
        slots.ui = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        // Slots hold no invariants a panicking holder could break.
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
