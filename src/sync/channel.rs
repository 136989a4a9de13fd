use crate::error::ChannelClosed;
use crate::types::{Envelope, Peer, PeerMessage, SessionId, SessionMessage};
use tokio::sync::mpsc;

/// Drops envelopes whose sequence number does not advance past the last one
/// accepted from the same sender.
#[derive(Debug, Clone, Default)]
pub struct SeqTracker {
    last: Option<u64>,
}

impl SeqTracker {
    pub fn accept(&mut self, seq: u64) -> bool {
        if self.last.is_some_and(|last| seq <= last) {
            return false;
        }
        self.last = Some(seq);
        true
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }
}

/// Everything the session loop reads from its inbox.
#[derive(Debug)]
pub enum Inbound {
    Message {
        peer: Peer,
        connection: u64,
        envelope: Envelope<PeerMessage>,
    },
    Detached {
        peer: Peer,
        connection: u64,
    },
}

/// A peer's handle on its session: sends [`PeerMessage`]s in order and
/// receives [`SessionMessage`]s with duplicates removed. Dropping the
/// endpoint detaches the peer.
pub struct PeerEndpoint {
    peer: Peer,
    session_id: SessionId,
    connection: u64,
    next_seq: u64,
    inbox: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<Envelope<SessionMessage>>,
    received: SeqTracker,
}

impl PeerEndpoint {
    pub(crate) fn new(
        peer: Peer,
        session_id: SessionId,
        connection: u64,
        inbox: mpsc::UnboundedSender<Inbound>,
        outbound: mpsc::UnboundedReceiver<Envelope<SessionMessage>>,
    ) -> Self {
        Self {
            peer,
            session_id,
            connection,
            next_seq: 0,
            inbox,
            outbound,
            received: SeqTracker::default(),
        }
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn connection(&self) -> u64 {
        self.connection
    }

    /// Stamps `message` with the next sequence number and sends it.
    pub fn send(&mut self, message: PeerMessage) -> Result<u64, ChannelClosed> {
        self.next_seq += 1;
        let envelope = Envelope {
            session_id: self.session_id,
            sender: self.peer.into(),
            seq: self.next_seq,
            message,
        };
        self.forward(envelope)?;
        Ok(self.next_seq)
    }

    /// Sends an envelope stamped elsewhere, e.g. by a remote client behind a
    /// transport. Retransmissions are dropped by the session.
    pub fn forward(&self, envelope: Envelope<PeerMessage>) -> Result<(), ChannelClosed> {
        self.inbox
            .send(Inbound::Message {
                peer: self.peer,
                connection: self.connection,
                envelope,
            })
            .map_err(|_| ChannelClosed)
    }

    pub async fn recv(&mut self) -> Option<SessionMessage> {
        self.recv_envelope().await.map(|envelope| envelope.message)
    }

    pub async fn recv_envelope(&mut self) -> Option<Envelope<SessionMessage>> {
        loop {
            let envelope = self.outbound.recv().await?;
            if self.received.accept(envelope.seq) {
                return Some(envelope);
            }
        }
    }

    /// Next buffered message, if any, without waiting.
    pub fn try_recv(&mut self) -> Option<SessionMessage> {
        while let Ok(envelope) = self.outbound.try_recv() {
            if self.received.accept(envelope.seq) {
                return Some(envelope.message);
            }
        }
        None
    }
}

impl Drop for PeerEndpoint {
    fn drop(&mut self) {
        let _ = self.inbox.send(Inbound::Detached {
            peer: self.peer,
            connection: self.connection,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Party;

    fn endpoint() -> (
        PeerEndpoint,
        mpsc::UnboundedReceiver<Inbound>,
        mpsc::UnboundedSender<Envelope<SessionMessage>>,
    ) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let endpoint = PeerEndpoint::new(Peer::Ui, SessionId::new(), 1, inbox_tx, out_rx);
        (endpoint, inbox_rx, out_tx)
    }

    #[test]
    fn test_seq_tracker_rejects_replays() {
        let mut tracker = SeqTracker::default();
        assert!(tracker.accept(1));
        assert!(tracker.accept(2));
        assert!(!tracker.accept(2));
        assert!(!tracker.accept(1));
        assert!(tracker.accept(5));
        assert_eq!(tracker.last(), Some(5));
    }

    #[tokio::test]
    async fn test_send_stamps_increasing_seq() {
        let (mut endpoint, mut inbox, _out) = endpoint();
        assert_eq!(endpoint.send(PeerMessage::SnapshotRequest), Ok(1));
        assert_eq!(endpoint.send(PeerMessage::SnapshotRequest), Ok(2));

        for expected in 1..=2 {
            match inbox.recv().await {
                Some(Inbound::Message { peer, envelope, .. }) => {
                    assert_eq!(peer, Peer::Ui);
                    assert_eq!(envelope.sender, Party::Ui);
                    assert_eq!(envelope.seq, expected);
                }
                other => panic!("unexpected inbound: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_recv_drops_duplicate_envelopes() {
        let (mut endpoint, _inbox, out) = endpoint();
        let session_id = endpoint.session_id();
        let stamp = |seq| Envelope {
            session_id,
            sender: Party::Session,
            seq,
            message: SessionMessage::PatchRejected {
                based_on_version: seq,
                current_version: seq,
                reason: "test".to_string(),
            },
        };
        out.send(stamp(1)).expect("send");
        out.send(stamp(1)).expect("send");
        out.send(stamp(2)).expect("send");
        drop(out);

        let mut seen = Vec::new();
        while let Some(SessionMessage::PatchRejected {
            based_on_version, ..
        }) = endpoint.recv().await
        {
            seen.push(based_on_version);
        }
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_drop_reports_detach() {
        let (endpoint, mut inbox, _out) = endpoint();
        drop(endpoint);
        assert!(matches!(
            inbox.recv().await,
            Some(Inbound::Detached {
                peer: Peer::Ui,
                connection: 1
            })
        ));
    }
}
