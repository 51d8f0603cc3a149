//! Lifecycle aggregation for the standard watchdog complement.

use std::sync::Arc;

use tracing::{info, warn};

use cdp_session::ProtocolClient;
use helmsman_event_bus::EventBus;

use crate::{
    DomWatchdog, ErrorWatchdog, NavigationWatchdog, NetworkWatchdog, Watchdog, WatchdogConfig,
    WatchdogInitError,
};

/// The standard complement of observers for one session.
///
/// Watchdogs degrade independently: a member that fails to start is simply
/// absent, and the rest keep running.
pub struct WatchdogSet {
    watchdogs: Vec<Arc<dyn Watchdog>>,
}

impl WatchdogSet {
    /// Navigation, network, DOM and error watchdogs over one session.
    pub fn standard(
        bus: Arc<EventBus>,
        client: Arc<dyn ProtocolClient>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            watchdogs: vec![
                NavigationWatchdog::new(Arc::clone(&bus), config.clone()) as Arc<dyn Watchdog>,
                NetworkWatchdog::new(Arc::clone(&bus), config.clone()),
                DomWatchdog::new(Arc::clone(&bus), client, config.clone()),
                ErrorWatchdog::new(bus, config),
            ],
        }
    }

    /// Start every member, returning the failures. An empty vec means the
    /// full complement is observing.
    pub async fn start_all(&self) -> Vec<WatchdogInitError> {
        let mut failures = Vec::new();
        for watchdog in &self.watchdogs {
            match watchdog.start().await {
                Ok(()) => info!(target: "watchdog", name = watchdog.name(), "started"),
                Err(err) => {
                    warn!(target: "watchdog", name = watchdog.name(), %err, "continuing without it");
                    failures.push(err);
                }
            }
        }
        failures
    }

    pub async fn stop_all(&self) {
        for watchdog in &self.watchdogs {
            watchdog.stop().await;
        }
    }

    pub fn len(&self) -> usize {
        self.watchdogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchdogs.is_empty()
    }
}
