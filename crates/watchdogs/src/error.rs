//! Page error surfacing: runtime exceptions and console errors.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use helmsman_event_bus::{
    BusEvent, EventBus, EventHandler, HandlerError, SignalKind, SubscriptionId, Topic,
    WatchdogSignal,
};

use crate::{Watchdog, WatchdogConfig, WatchdogInitError};

struct ErrorTap {
    bus: Arc<EventBus>,
}

impl ErrorTap {
    /// Human-readable form of a console argument.
    fn render_argument(argument: &Value) -> Option<String> {
        if let Some(value) = argument.get("value") {
            if let Some(text) = value.as_str() {
                return Some(text.to_string());
            }
            if !value.is_null() {
                return Some(value.to_string());
            }
        }
        argument
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[async_trait]
impl EventHandler for ErrorTap {
    fn name(&self) -> &str {
        "error-watchdog"
    }

    async fn handle(&self, event: &BusEvent) -> Result<(), HandlerError> {
        let Some(event) = event.as_protocol() else {
            return Ok(());
        };
        match event.method.as_str() {
            "Runtime.exceptionThrown" => {
                let details = &event.params["exceptionDetails"];
                let message = details["exception"]["description"]
                    .as_str()
                    .or_else(|| details["text"].as_str())
                    .unwrap_or("uncaught exception")
                    .to_string();
                let source = format!(
                    "{}:{}",
                    details["url"].as_str().unwrap_or("<anonymous>"),
                    details["lineNumber"].as_u64().unwrap_or(0)
                );
                debug!(target: "watchdog", %source, "page exception");
                self.bus
                    .publish(BusEvent::Signal(WatchdogSignal::new(
                        SignalKind::ErrorDetected,
                        json!({
                            "scope": "script",
                            "message": message,
                            "source": source,
                        }),
                    )))
                    .await;
            }
            "Runtime.consoleAPICalled" => {
                if event.params["type"].as_str() != Some("error") {
                    return Ok(());
                }
                let message = event.params["args"]
                    .as_array()
                    .map(|args| {
                        args.iter()
                            .filter_map(ErrorTap::render_argument)
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default();
                self.bus
                    .publish(BusEvent::Signal(WatchdogSignal::new(
                        SignalKind::ErrorDetected,
                        json!({
                            "scope": "script",
                            "message": message,
                            "source": "console",
                        }),
                    )))
                    .await;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Signals [`SignalKind::ErrorDetected`] for uncaught exceptions and
/// `console.error` calls. Purely event-driven: no probe task.
pub struct ErrorWatchdog {
    bus: Arc<EventBus>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl ErrorWatchdog {
    pub fn new(bus: Arc<EventBus>, _config: WatchdogConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            subscriptions: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Watchdog for ErrorWatchdog {
    fn name(&self) -> &'static str {
        "error"
    }

    fn handles(&self, topic: Topic) -> bool {
        topic == Topic::RuntimeEvents
    }

    async fn start(&self) -> Result<(), WatchdogInitError> {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return Ok(());
        }
        let tap = Arc::new(ErrorTap {
            bus: Arc::clone(&self.bus),
        });
        subscriptions.push(self.bus.subscribe(Topic::RuntimeEvents, tap));
        Ok(())
    }

    async fn stop(&self) {
        for id in self.subscriptions.lock().drain(..) {
            self.bus.unsubscribe(id);
        }
    }
}
