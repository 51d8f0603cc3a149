//! DOM mutation tracking via an injected `MutationObserver` counter.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::debug;

use cdp_session::ProtocolClient;
use helmsman_event_bus::{
    BusEvent, EventBus, EventHandler, HandlerError, SignalKind, SubscriptionId, Topic,
    WatchdogSignal,
};

use crate::{Watchdog, WatchdogConfig, WatchdogInitError};

/// Installs a page-global mutation counter. Idempotent: re-evaluation on an
/// already-instrumented page is a no-op.
const OBSERVER_JS: &str = r#"(() => {
    if (window.__helmsman_dom_observer) { return true; }
    window.__helmsman_mutation_count = 0;
    const root = document.body || document.documentElement;
    if (!root) { return false; }
    const observer = new MutationObserver((records) => {
        window.__helmsman_mutation_count += records.length;
    });
    observer.observe(root, { childList: true, subtree: true, attributes: true });
    window.__helmsman_dom_observer = observer;
    return true;
})()"#;

const COUNTER_JS: &str = "window.__helmsman_mutation_count || 0";

#[derive(Debug)]
struct DomInner {
    last_count: u64,
    last_mutation: Option<Instant>,
    /// The quiet window has elapsed since the last observed burst.
    settled: bool,
    /// A document swap invalidated the injected observer.
    needs_install: bool,
}

impl Default for DomInner {
    fn default() -> Self {
        Self {
            last_count: 0,
            last_mutation: None,
            settled: true,
            needs_install: false,
        }
    }
}

struct DomTap {
    state: Arc<Mutex<DomInner>>,
}

#[async_trait]
impl EventHandler for DomTap {
    fn name(&self) -> &str {
        "dom-watchdog"
    }

    async fn handle(&self, event: &BusEvent) -> Result<(), HandlerError> {
        let Some(event) = event.as_protocol() else {
            return Ok(());
        };
        if event.method == "DOM.documentUpdated" {
            // New document, new page globals: the counter restarts at zero
            // and the observer must be reinjected.
            let mut state = self.state.lock();
            state.last_count = 0;
            state.needs_install = true;
            state.last_mutation = Some(Instant::now());
            state.settled = false;
        }
        Ok(())
    }
}

/// Signals [`SignalKind::DomMutated`] once per mutation burst, then settles
/// after the configured quiet window.
pub struct DomWatchdog {
    bus: Arc<EventBus>,
    client: Arc<dyn ProtocolClient>,
    config: WatchdogConfig,
    state: Arc<Mutex<DomInner>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl DomWatchdog {
    pub fn new(
        bus: Arc<EventBus>,
        client: Arc<dyn ProtocolClient>,
        config: WatchdogConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            client,
            config,
            state: Arc::new(Mutex::new(DomInner::default())),
            subscriptions: Mutex::new(Vec::new()),
            poll_task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Watchdog for DomWatchdog {
    fn name(&self) -> &'static str {
        "dom"
    }

    fn handles(&self, topic: Topic) -> bool {
        topic == Topic::DomEvents
    }

    async fn start(&self) -> Result<(), WatchdogInitError> {
        if !self.subscriptions.lock().is_empty() {
            return Ok(());
        }

        // Install before subscribing so an injection failure leaves no
        // residual bus state behind.
        self.client
            .evaluate(OBSERVER_JS)
            .await
            .map_err(|err| WatchdogInitError {
                name: "dom",
                reason: err.to_string(),
            })?;

        {
            let tap = Arc::new(DomTap {
                state: Arc::clone(&self.state),
            });
            self.subscriptions
                .lock()
                .push(self.bus.subscribe(Topic::DomEvents, tap));
        }

        let bus = Arc::clone(&self.bus);
        let client = Arc::clone(&self.client);
        let state = Arc::clone(&self.state);
        let quiet = self.config.dom_quiet();
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let task = tokio::spawn(async move {
            loop {
                ticker.tick().await;

                let reinstall = state.lock().needs_install;
                if reinstall {
                    match client.evaluate(OBSERVER_JS).await {
                        Ok(_) => state.lock().needs_install = false,
                        Err(err) => {
                            debug!(target: "watchdog", %err, "observer reinjection failed");
                            continue;
                        }
                    }
                }

                let count = match client.evaluate(COUNTER_JS).await {
                    Ok(value) => value.as_u64().unwrap_or(0),
                    Err(err) => {
                        debug!(target: "watchdog", %err, "mutation probe failed");
                        continue;
                    }
                };

                let burst = {
                    let mut state = state.lock();
                    if count > state.last_count {
                        let delta = count - state.last_count;
                        state.last_count = count;
                        state.last_mutation = Some(Instant::now());
                        // One signal per burst: quiet mutations extend the
                        // current burst without re-signalling.
                        let fresh = state.settled;
                        state.settled = false;
                        fresh.then_some(delta)
                    } else {
                        let quiet_elapsed = state
                            .last_mutation
                            .map(|at| at.elapsed() >= quiet)
                            .unwrap_or(true);
                        if quiet_elapsed {
                            state.settled = true;
                        }
                        None
                    }
                };

                if let Some(count) = burst {
                    debug!(target: "watchdog", count, "dom mutated");
                    bus.publish(BusEvent::Signal(WatchdogSignal::new(
                        SignalKind::DomMutated,
                        json!({"count": count}),
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

impl Drop for DomWatchdog {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
    }
}
