use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for attaching to or launching a browser.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Attach to an existing DevTools endpoint instead of launching.
    pub websocket_url: Option<String>,
    /// Explicit browser binary; otherwise resolved from well-known names.
    pub executable: Option<PathBuf>,
    /// Profile to reuse. Copied to a scratch directory before launch so the
    /// running browser's singleton lock is not violated.
    pub user_data_dir: Option<PathBuf>,
    /// Set false to launch against `user_data_dir` in place.
    pub copy_profile: bool,
    pub headless: bool,
    /// Needed in containerized environments without a user namespace.
    pub no_sandbox: bool,
    pub window_width: u32,
    pub window_height: u32,
    /// Per-command response deadline.
    pub command_timeout_ms: u64,
    /// Deadline for navigation readiness polling.
    pub navigation_timeout_ms: u64,
    /// Liveness probe cadence; zero disables the heartbeat.
    pub heartbeat_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            websocket_url: None,
            executable: None,
            user_data_dir: None,
            copy_profile: true,
            headless: false,
            no_sandbox: false,
            window_width: 1280,
            window_height: 800,
            command_timeout_ms: 30_000,
            navigation_timeout_ms: 30_000,
            heartbeat_interval_ms: 15_000,
        }
    }
}

impl SessionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }
}
