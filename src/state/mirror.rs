use crate::types::{Actor, Patch, SessionMessage, SharedState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorUpdate {
    Applied(u64),
    Loaded(u64),
    /// Already reflected locally; a retransmission or an older patch.
    Stale,
    /// A version was skipped; the mirror refuses patches until a snapshot
    /// arrives.
    ResyncNeeded,
    Unrelated,
}

/// Client-side replica of a session's shared state, kept current from the
/// `StatePatch` / `StateSnapshot` messages of a sync channel.
#[derive(Debug, Clone, Default)]
pub struct StateMirror {
    state: SharedState,
    resync_needed: bool,
}

impl StateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn version(&self) -> u64 {
        self.state.version
    }

    pub fn needs_resync(&self) -> bool {
        self.resync_needed
    }

    pub fn observe(&mut self, message: &SessionMessage) -> MirrorUpdate {
        match message {
            SessionMessage::StateSnapshot { state } => self.load(state.clone()),
            SessionMessage::StatePatch {
                version,
                actor,
                patch,
            } => self.apply_patch(*version, *actor, patch),
            _ => MirrorUpdate::Unrelated,
        }
    }

    /// Replaces the local state with an authoritative snapshot. A snapshot
    /// older than what the mirror already holds is ignored unless a gap left
    /// the mirror waiting for one.
    pub fn load(&mut self, state: SharedState) -> MirrorUpdate {
        let version = state.version;
        if !self.resync_needed && version < self.state.version {
            return MirrorUpdate::Stale;
        }
        self.state = state;
        self.resync_needed = false;
        MirrorUpdate::Loaded(version)
    }

    pub fn apply_patch(&mut self, version: u64, actor: Actor, patch: &Patch) -> MirrorUpdate {
        if version <= self.state.version {
            return MirrorUpdate::Stale;
        }
        if self.resync_needed || version != self.state.version + 1 {
            self.resync_needed = true;
            return MirrorUpdate::ResyncNeeded;
        }

        match self.state.applied(actor, patch) {
            Ok(mut next) => {
                next.version = version;
                self.state = next;
                MirrorUpdate::Applied(version)
            }
            Err(err) => {
                tracing::warn!(version, error = %err, "mirror could not replay accepted patch");
                self.resync_needed = true;
                MirrorUpdate::ResyncNeeded
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch_message(version: u64, key: &str) -> SessionMessage {
        SessionMessage::StatePatch {
            version,
            actor: Actor::Agent,
            patch: Patch::set(key, json!(version)),
        }
    }

    #[test]
    fn test_mirror_applies_patches_in_order() {
        let mut mirror = StateMirror::new();
        assert_eq!(mirror.observe(&patch_message(1, "a")), MirrorUpdate::Applied(1));
        assert_eq!(mirror.observe(&patch_message(2, "b")), MirrorUpdate::Applied(2));
        assert_eq!(mirror.observe(&patch_message(2, "b")), MirrorUpdate::Stale);
        assert_eq!(mirror.state().field("b"), Some(&json!(2)));
        assert_eq!(mirror.version(), 2);
    }

    #[test]
    fn test_gap_requires_snapshot() {
        let mut mirror = StateMirror::new();
        assert_eq!(mirror.observe(&patch_message(2, "a")), MirrorUpdate::ResyncNeeded);
        assert!(mirror.needs_resync());
        assert_eq!(mirror.observe(&patch_message(1, "a")), MirrorUpdate::ResyncNeeded);

        let mut authoritative = SharedState::default();
        authoritative.version = 5;
        authoritative.fields.insert("a".to_string(), json!("x"));
        let update = mirror.observe(&SessionMessage::StateSnapshot {
            state: authoritative.clone(),
        });
        assert_eq!(update, MirrorUpdate::Loaded(5));
        assert!(!mirror.needs_resync());
        assert_eq!(mirror.state(), &authoritative);
        assert_eq!(mirror.observe(&patch_message(6, "b")), MirrorUpdate::Applied(6));
    }

    #[test]
    fn test_older_snapshot_does_not_roll_back() {
        let mut mirror = StateMirror::new();
        mirror.observe(&patch_message(1, "a"));
        mirror.observe(&patch_message(2, "b"));

        let mut older = SharedState::default();
        older.version = 1;
        older.fields.insert("a".to_string(), json!(1));
        assert_eq!(
            mirror.observe(&SessionMessage::StateSnapshot { state: older }),
            MirrorUpdate::Stale
        );
        assert_eq!(mirror.version(), 2);
        assert_eq!(mirror.state().field("b"), Some(&json!(2)));
    }

    #[test]
    fn test_snapshot_after_gap_is_taken_even_if_older() {
        let mut mirror = StateMirror::new();
        mirror.observe(&patch_message(1, "a"));
        mirror.observe(&patch_message(2, "b"));
        assert_eq!(mirror.observe(&patch_message(4, "c")), MirrorUpdate::ResyncNeeded);

        let mut authoritative = SharedState::default();
        authoritative.version = 1;
        assert_eq!(
            mirror.observe(&SessionMessage::StateSnapshot {
                state: authoritative
            }),
            MirrorUpdate::Loaded(1)
        );
        assert!(!mirror.needs_resync());
    }
}
