use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine behaviour configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default workflow interrupt deadline (ISO-8601 duration).
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout: String,

    /// Default workflow kill deadline (ISO-8601 duration).
    #[serde(default = "default_hard_timeout")]
    pub hard_timeout: String,

    /// Maximum time to wait for an instance lock.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Age after which another replica may take over an instance.
    #[serde(default = "default_ownership_timeout")]
    pub ownership_timeout_secs: u64,

    /// Cron pattern of the stalled-instance sweep.
    #[serde(default = "default_stalled_scan_cron")]
    pub stalled_scan_cron: String,

    /// Retry delay used when a retry policy declares none (ISO-8601 duration).
    #[serde(default = "default_retry_delay")]
    pub default_retry_delay: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            soft_timeout: default_soft_timeout(),
            hard_timeout: default_hard_timeout(),
            lock_timeout_secs: default_lock_timeout(),
            ownership_timeout_secs: default_ownership_timeout(),
            stalled_scan_cron: default_stalled_scan_cron(),
            default_retry_delay: default_retry_delay(),
        }
    }
}

impl EngineConfig {
    /// Lock acquisition bound.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Ownership lease length.
    pub fn ownership_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ownership_timeout_secs as i64)
    }
}

fn default_soft_timeout() -> String {
    "PT15M".to_string()
}

fn default_hard_timeout() -> String {
    "PT20M".to_string()
}

fn default_lock_timeout() -> u64 {
    10
}

fn default_ownership_timeout() -> u64 {
    60
}

fn default_stalled_scan_cron() -> String {
    "*/30 * * * * *".to_string()
}

fn default_retry_delay() -> String {
    "PT5S".to_string()
}
