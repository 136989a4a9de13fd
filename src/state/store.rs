use crate::error::StoreError;
use crate::types::{Actor, Patch, SharedState};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Notification published for every accepted patch, in version order.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub version: u64,
    pub actor: Actor,
    pub patch: Patch,
}

type ChangeListener = Box<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Applied {
    pub version: u64,
    pub state: Arc<SharedState>,
}

/// Versioned owner of a session's shared state.
///
/// Writes are serialized through [`StateStore::apply`], which only accepts a
/// patch derived from the current version. Readers get an immutable
/// `Arc<SharedState>` per version.
///
/// Change listeners run synchronously under the write lock, so whatever they
/// enqueue is ordered with respect to anything the writer does next.
pub struct StateStore {
    current: watch::Sender<Arc<SharedState>>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::with_state(SharedState::default())
    }

    pub fn with_state(state: SharedState) -> Self {
        let (current, _) = watch::channel(Arc::new(state));
        Self {
            current,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Arc<SharedState> {
        self.current.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.borrow().version
    }

    /// Runs `read` against the current state while holding off writers.
    /// Anything `read` enqueues lands before the next version's change
    /// notification.
    pub fn with_current<R>(&self, read: impl FnOnce(&Arc<SharedState>) -> R) -> R {
        read(&self.current.borrow())
    }

    /// Registers `listener` for every accepted patch, in version order. It
    /// runs under the write lock and must not call back into the store.
    pub fn on_change(&self, listener: impl Fn(&StateChange) + Send + Sync + 'static) {
        self.lock_listeners().push(Box::new(listener));
    }

    /// Applies `patch` if `based_on` is the current version.
    ///
    /// A credential-only patch from the UI is applied at whatever version is
    /// current: the UI is the credential's only writer, so there is nothing
    /// to merge with.
    pub fn apply(&self, actor: Actor, based_on: u64, patch: Patch) -> Result<Applied, StoreError> {
        let mut outcome: Result<Applied, StoreError> = Err(StoreError::Conflict {
            based_on,
            current: based_on,
        });

        self.current.send_if_modified(|current| {
            let current_version = current.version;
            let credential_override = actor == Actor::Ui && patch.is_credential_only();
            if based_on != current_version && !credential_override {
                outcome = Err(StoreError::Conflict {
                    based_on,
                    current: current_version,
                });
                return false;
            }

            match current.applied(actor, &patch) {
                Ok(mut next) => {
                    next.version = current_version + 1;
                    let next = Arc::new(next);
                    *current = Arc::clone(&next);
                    let change = StateChange {
                        version: next.version,
                        actor,
                        patch,
                    };
                    for listener in self.lock_listeners().iter() {
                        listener(&change);
                    }
                    outcome = Ok(Applied {
                        version: next.version,
                        state: next,
                    });
                    true
                }
                Err(err) => {
                    outcome = Err(err.into());
                    false
                }
            }
        });

        match &outcome {
            Ok(applied) => {
                tracing::trace!(%actor, version = applied.version, "state patch applied");
            }
            Err(StoreError::Conflict { based_on, current }) => {
                tracing::debug!(%actor, based_on, current, "state patch conflicted");
            }
            Err(err) => {
                tracing::debug!(%actor, error = %err, "state patch rejected");
            }
        }
        outcome
    }

    /// Re-reads the latest state and re-derives the patch until it lands
    /// without a conflict, up to `max_attempts` times.
    pub fn apply_with_retry<F>(
        &self,
        actor: Actor,
        max_attempts: usize,
        mut derive: F,
    ) -> Result<Applied, StoreError>
    where
        F: FnMut(&SharedState) -> Patch,
    {
        let attempts = max_attempts.max(1);
        for _ in 0..attempts {
            let snapshot = self.snapshot();
            let patch = derive(&snapshot);
            match self.apply(actor, snapshot.version, patch) {
                Err(StoreError::Conflict { .. }) => continue,
                other => return other,
            }
        }
        Err(StoreError::RetriesExhausted { attempts })
    }

    /// Applies `patch` at `based_on`; an append-only patch that lost the
    /// version race is replayed against the latest version instead of being
    /// rejected.
    pub fn apply_or_rebase(
        &self,
        actor: Actor,
        based_on: u64,
        patch: Patch,
        max_attempts: usize,
    ) -> Result<Applied, StoreError> {
        let rebase = patch.is_append_only().then(|| patch.clone());
        match (self.apply(actor, based_on, patch), rebase) {
            (Err(StoreError::Conflict { .. }), Some(patch)) => {
                self.apply_with_retry(actor, max_attempts, |_| patch.clone())
            }
            (outcome, _) => outcome,
        }
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<ChangeListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
