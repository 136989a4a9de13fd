use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

/// Process-wide lock for tests that mutate environment variables.
static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

const SCENESYNC_VARS: [&str; 12] = [
    "SCENESYNC_BACKEND_URL",
    "SCENESYNC_BACKEND_TIMEOUT_SECS",
    "SCENESYNC_APPROVAL_TIMEOUT_SECS",
    "SCENESYNC_MAX_ATTEMPTS",
    "SCENESYNC_BACKOFF_MS",
    "SCENESYNC_BACKOFF_MAX_MS",
    "SCENESYNC_PATCH_RETRIES",
    "SCENESYNC_UNGATED_TOOLS",
    "SCENESYNC_LOG",
    "SCENESYNC_LOG_PATH",
    "SCENESYNC_LOG_ANSI",
    "SCENESYNC_TEST_NUMBER",
];

/// Holds [`ENV_LOCK`] with every `SCENESYNC_*` variable unset, and unsets
/// them again when dropped. Sync tests only.
pub struct ScopedEnv {
    _lock: MutexGuard<'static, ()>,
}

impl ScopedEnv {
    pub fn acquire() -> Self {
        let lock = ENV_LOCK.blocking_lock();
        clear_vars();
        Self { _lock: lock }
    }

    pub fn set(&self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }
}

impl Drop for ScopedEnv {
    fn drop(&mut self) {
        clear_vars();
    }
}

fn clear_vars() {
    for var in SCENESYNC_VARS {
        std::env::remove_var(var);
    }
}
