use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::invocation::RetryPolicy;
use crate::tools::ToolRegistry;
use crate::util::{env_override_u64, env_override_usize, env_string, is_local_endpoint_url};

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8787/v1/generate";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub backend_url: String,
    pub backend_timeout: Duration,
    /// `None` leaves approvals pending until decided or cancelled.
    pub approval_timeout: Option<Duration>,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
    pub patch_retries: usize,
    pub ungated_tools: Vec<String>,
    pub log_filter: String,
    pub log_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            backend_timeout: Duration::from_secs(60),
            approval_timeout: None,
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            backoff_max: Duration::from_millis(8_000),
            patch_retries: 8,
            ungated_tools: Vec::new(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_path: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let defaults = Self::default();

        let approval_timeout = match env_string("SCENESYNC_APPROVAL_TIMEOUT_SECS") {
            None => None,
            Some(raw) => match raw.parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(_) => bail!(
                    "Invalid SCENESYNC_APPROVAL_TIMEOUT_SECS '{raw}': expected a whole number of seconds"
                ),
            },
        };

        let backoff_ms = env_override_u64("SCENESYNC_BACKOFF_MS", 500, 10, 60_000);
        let backoff_max_ms =
            env_override_u64("SCENESYNC_BACKOFF_MAX_MS", 8_000, backoff_ms, 300_000).max(backoff_ms);

        Ok(Self {
            backend_url: env_string("SCENESYNC_BACKEND_URL").unwrap_or(defaults.backend_url),
            backend_timeout: Duration::from_secs(env_override_u64(
                "SCENESYNC_BACKEND_TIMEOUT_SECS",
                60,
                1,
                600,
            )),
            approval_timeout,
            max_attempts: env_override_u64("SCENESYNC_MAX_ATTEMPTS", 3, 1, 10) as u32,
            backoff: Duration::from_millis(backoff_ms),
            backoff_max: Duration::from_millis(backoff_max_ms),
            patch_retries: env_override_usize("SCENESYNC_PATCH_RETRIES", 8, 1, 64),
            ungated_tools: env_string("SCENESYNC_UNGATED_TOOLS")
                .map(|raw| parse_tool_list(&raw))
                .unwrap_or_default(),
            log_filter: env_string("SCENESYNC_LOG").unwrap_or(defaults.log_filter),
            log_path: env_string("SCENESYNC_LOG_PATH").map(PathBuf::from),
        })
    }

    pub fn validate(&self, registry: &ToolRegistry) -> Result<()> {
        let url = self.backend_url.trim();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            bail!(
                "Invalid SCENESYNC_BACKEND_URL '{}': expected http:// or https:// URL",
                self.backend_url
            );
        }

        // Credentials travel with every generation call.
        if url.starts_with("http://") && !is_local_endpoint_url(url) {
            bail!(
                "SCENESYNC_BACKEND_URL '{}' must use https:// for non-local endpoints",
                self.backend_url
            );
        }

        if let Some(unknown) = self
            .ungated_tools
            .iter()
            .find(|name| !registry.contains(name))
        {
            let known: Vec<&str> = registry.names().collect();
            bail!(
                "SCENESYNC_UNGATED_TOOLS names unknown tool '{unknown}' (known: {})",
                known.join(", ")
            );
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: self.backoff,
            max_delay: self.backoff_max.max(self.backoff),
        }
    }

    /// Marks every tool listed in `ungated_tools` as ungated.
    pub fn apply_to_registry(&self, registry: &mut ToolRegistry) {
        for name in &self.ungated_tools {
            if registry.set_gated(name, false) {
                tracing::info!(tool = %name, "tool runs without approval");
            }
        }
    }
}

fn parse_tool_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .collect()
}
