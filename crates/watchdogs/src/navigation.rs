//! Navigation-complete detection over the page lifecycle event stream.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::debug;

use helmsman_event_bus::{
    BusEvent, EventBus, EventHandler, HandlerError, SignalKind, SubscriptionId, Topic,
    WatchdogSignal,
};

use crate::{Watchdog, WatchdogConfig, WatchdogInitError};

#[derive(Debug, Default)]
struct NavigationInner {
    committed_url: Option<String>,
    /// A main-frame navigation has committed and not yet been signalled.
    navigating: bool,
    /// The load event has fired for the committed navigation.
    load_settled: bool,
    last_change: Option<Instant>,
}

struct NavigationTap {
    state: Arc<Mutex<NavigationInner>>,
}

#[async_trait]
impl EventHandler for NavigationTap {
    fn name(&self) -> &str {
        "navigation-watchdog"
    }

    async fn handle(&self, event: &BusEvent) -> Result<(), HandlerError> {
        let Some(event) = event.as_protocol() else {
            return Ok(());
        };
        match event.method.as_str() {
            "Page.frameNavigated" => {
                let frame = &event.params["frame"];
                // Subframe commits carry a parentId; only the main frame
                // drives the navigation signal.
                if frame.get("parentId").and_then(|id| id.as_str()).is_some() {
                    return Ok(());
                }
                let mut state = self.state.lock();
                state.committed_url = frame["url"].as_str().map(str::to_string);
                state.navigating = true;
                state.load_settled = false;
                state.last_change = Some(Instant::now());
            }
            "Page.navigatedWithinDocument" => {
                // Hash/history navigations never fire a load event.
                let mut state = self.state.lock();
                state.committed_url = event.params["url"].as_str().map(str::to_string);
                state.navigating = true;
                state.load_settled = true;
                state.last_change = Some(Instant::now());
            }
            "Page.loadEventFired" => {
                let mut state = self.state.lock();
                state.load_settled = true;
                state.last_change = Some(Instant::now());
            }
            "Page.domContentEventFired" => {
                self.state.lock().last_change = Some(Instant::now());
            }
            _ => {}
        }
        Ok(())
    }
}

/// Signals [`SignalKind::NavigationComplete`] once a committed main-frame
/// navigation has loaded and stayed quiet for the configured window.
pub struct NavigationWatchdog {
    bus: Arc<EventBus>,
    config: WatchdogConfig,
    state: Arc<Mutex<NavigationInner>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl NavigationWatchdog {
    pub fn new(bus: Arc<EventBus>, config: WatchdogConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            state: Arc::new(Mutex::new(NavigationInner::default())),
            subscriptions: Mutex::new(Vec::new()),
            poll_task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Watchdog for NavigationWatchdog {
    fn name(&self) -> &'static str {
        "navigation"
    }

    fn handles(&self, topic: Topic) -> bool {
        topic == Topic::PageEvents
    }

    async fn start(&self) -> Result<(), WatchdogInitError> {
        {
            let mut subscriptions = self.subscriptions.lock();
            if !subscriptions.is_empty() {
                return Ok(());
            }
            let tap = Arc::new(NavigationTap {
                state: Arc::clone(&self.state),
            });
            subscriptions.push(self.bus.subscribe(Topic::PageEvents, tap));
        }

        let bus = Arc::clone(&self.bus);
        let state = Arc::clone(&self.state);
        let quiet = self.config.navigation_quiet();
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let task = tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let completed = {
                    let mut state = state.lock();
                    let quiet_elapsed = state
                        .last_change
                        .map(|at| at.elapsed() >= quiet)
                        .unwrap_or(false);
                    if state.navigating && state.load_settled && quiet_elapsed {
                        state.navigating = false;
                        state.committed_url.clone()
                    } else {
                        None
                    }
                };
                if let Some(url) = completed {
                    debug!(target: "watchdog", %url, "navigation complete");
                    bus.publish(BusEvent::Signal(WatchdogSignal::new(
                        SignalKind::NavigationComplete,
                        json!({"url": url}),
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

impl Drop for NavigationWatchdog {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
    }
}
