//! Network idle detection over the request/response event stream.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use helmsman_event_bus::{
    BusEvent, EventBus, EventHandler, HandlerError, SignalKind, SubscriptionId, Topic,
    WatchdogSignal,
};

use crate::{Watchdog, WatchdogConfig, WatchdogInitError};

/// Request URLs that never count toward pending work.
const IGNORED_SCHEMES: &[&str] = &["data:", "chrome-extension:"];

#[derive(Debug)]
struct NetworkInner {
    /// Request ids still awaiting completion.
    pending: HashSet<String>,
    /// Request id to URL, for failure reporting.
    urls: HashMap<String, String>,
    last_activity: Option<Instant>,
    was_idle: bool,
}

impl Default for NetworkInner {
    fn default() -> Self {
        Self {
            pending: HashSet::new(),
            urls: HashMap::new(),
            last_activity: None,
            // A page with no traffic yet is already idle; only a
            // busy-to-quiet transition should signal.
            was_idle: true,
        }
    }
}

/// Bus tap feeding the shared request ledger.
struct NetworkTap {
    bus: Arc<EventBus>,
    state: Arc<Mutex<NetworkInner>>,
}

#[async_trait]
impl EventHandler for NetworkTap {
    fn name(&self) -> &str {
        "network-watchdog"
    }

    async fn handle(&self, event: &BusEvent) -> Result<(), HandlerError> {
        let Some(event) = event.as_protocol() else {
            return Ok(());
        };
        let request_id = event.params["requestId"].as_str().unwrap_or("");
        if request_id.is_empty() {
            return Ok(());
        }

        match event.method.as_str() {
            "Network.requestWillBeSent" => {
                let url = event.params["request"]["url"].as_str().unwrap_or("");
                if IGNORED_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                    return Ok(());
                }
                let mut state = self.state.lock();
                state.pending.insert(request_id.to_string());
                state.urls.insert(request_id.to_string(), url.to_string());
                state.last_activity = Some(Instant::now());
                state.was_idle = false;
            }
            "Network.loadingFinished" => {
                let mut state = self.state.lock();
                state.pending.remove(request_id);
                state.urls.remove(request_id);
                state.last_activity = Some(Instant::now());
            }
            "Network.loadingFailed" => {
                let error_text = event.params["errorText"].as_str().unwrap_or("").to_string();
                let url = {
                    let mut state = self.state.lock();
                    state.pending.remove(request_id);
                    state.last_activity = Some(Instant::now());
                    state.urls.remove(request_id).unwrap_or_default()
                };
                // ERR_ABORTED is routine: cancelled fetches, stopped
                // navigations. Not worth a signal.
                if error_text == "net::ERR_ABORTED" {
                    return Ok(());
                }
                warn!(target: "watchdog", %url, %error_text, "request failed");
                self.bus
                    .publish(BusEvent::Signal(WatchdogSignal::new(
                        SignalKind::ErrorDetected,
                        json!({
                            "scope": "network",
                            "message": error_text,
                            "source": url,
                        }),
                    )))
                    .await;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Signals [`SignalKind::NetworkIdle`] when the request ledger has been empty
/// for the configured quiet window.
pub struct NetworkWatchdog {
    bus: Arc<EventBus>,
    config: WatchdogConfig,
    state: Arc<Mutex<NetworkInner>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkWatchdog {
    pub fn new(bus: Arc<EventBus>, config: WatchdogConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            state: Arc::new(Mutex::new(NetworkInner::default())),
            subscriptions: Mutex::new(Vec::new()),
            poll_task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Watchdog for NetworkWatchdog {
    fn name(&self) -> &'static str {
        "network"
    }

    fn handles(&self, topic: Topic) -> bool {
        topic == Topic::NetworkEvents
    }

    async fn start(&self) -> Result<(), WatchdogInitError> {
        {
            let mut subscriptions = self.subscriptions.lock();
            if !subscriptions.is_empty() {
                return Ok(());
            }
            let tap = Arc::new(NetworkTap {
                bus: Arc::clone(&self.bus),
                state: Arc::clone(&self.state),
            });
            subscriptions.push(self.bus.subscribe(Topic::NetworkEvents, tap));
        }

        let bus = Arc::clone(&self.bus);
        let state = Arc::clone(&self.state);
        let quiet = self.config.network_quiet();
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let task = tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let newly_idle = {
                    let mut state = state.lock();
                    let quiet_elapsed = state
                        .last_activity
                        .map(|at| at.elapsed() >= quiet)
                        .unwrap_or(true);
                    let idle = state.pending.is_empty() && quiet_elapsed;
                    let newly_idle = idle && !state.was_idle;
                    state.was_idle = idle;
                    newly_idle
                };
                if newly_idle {
                    debug!(target: "watchdog", "network idle");
                    bus.publish(BusEvent::Signal(WatchdogSignal::new(
                        SignalKind::NetworkIdle,
                        json!({"in_flight": 0}),
                    )))
                    .await;
                }
            }
        });
        *self.poll_task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        for id in self.subscriptions.lock().drain(..) {
            self.bus.unsubscribe(id);
        }
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for NetworkWatchdog {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
    }
}
