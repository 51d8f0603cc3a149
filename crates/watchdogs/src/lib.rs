//! Read-only background observers translating raw protocol events into
//! stability and error signals.
//!
//! Each watchdog subscribes to its raw-event topics on the bus when started
//! and publishes [`WatchdogSignal`]s onto [`Topic::Signals`]. Signals are
//! advisory wait hints: a watchdog that fails to initialize is treated as
//! absent, degrading wait quality but never correctness.
//!
//! [`WatchdogSignal`]: helmsman_event_bus::WatchdogSignal

mod dom;
mod error;
mod navigation;
mod network;
mod set;
#[cfg(test)]
pub(crate) mod testutil;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use helmsman_event_bus::Topic;

pub use dom::DomWatchdog;
pub use error::ErrorWatchdog;
pub use navigation::NavigationWatchdog;
pub use network::NetworkWatchdog;
pub use set::WatchdogSet;

/// A watchdog that could not initialize. Non-fatal: the caller treats the
/// watchdog as absent.
#[derive(Debug, Error)]
#[error("watchdog {name} failed to initialize: {reason}")]
pub struct WatchdogInitError {
    pub name: &'static str,
    pub reason: String,
}

/// Tuning shared by the watchdog set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Cadence of the idle/stability probes.
    pub poll_interval_ms: u64,
    /// Quiet window after the last network activity before idle is
    /// signalled.
    pub network_quiet_ms: u64,
    /// Quiet window after load settles before navigation-complete is
    /// signalled.
    pub navigation_quiet_ms: u64,
    /// Quiet window without mutations before the DOM counts as settled.
    pub dom_quiet_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            network_quiet_ms: 500,
            navigation_quiet_ms: 500,
            dom_quiet_ms: 300,
        }
    }
}

impl WatchdogConfig {
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub(crate) fn network_quiet(&self) -> Duration {
        Duration::from_millis(self.network_quiet_ms)
    }

    pub(crate) fn navigation_quiet(&self) -> Duration {
        Duration::from_millis(self.navigation_quiet_ms)
    }

    pub(crate) fn dom_quiet(&self) -> Duration {
        Duration::from_millis(self.dom_quiet_ms)
    }
}

/// Lifecycle capability common to the closed set of watchdog variants.
///
/// Watchdogs never mutate page state; they observe the event stream and
/// publish derived signals.
#[async_trait]
pub trait Watchdog: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this watchdog subscribes to `topic` while started.
    fn handles(&self, topic: Topic) -> bool;

    /// Subscribe to raw-event topics and begin observing. Starting an
    /// already-started watchdog is a no-op.
    async fn start(&self) -> Result<(), WatchdogInitError>;

    /// Drop every bus subscription and stop probing. Idempotent: stopping
    /// an unstarted or already-stopped watchdog is a no-op.
    async fn stop(&self);
}
