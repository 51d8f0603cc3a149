use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use helmsman_core_types::TargetId;
use helmsman_event_bus::{BusEvent, EventBus};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::tabs::{TabEntry, TabInfo, TabRegistry};
use crate::transport::{ChromiumTransport, CommandTarget, Transport};

/// Domains enabled on every attached tab. Extraction and the watchdogs
/// assume these are live.
const ENABLED_DOMAINS: &[&str] = &[
    "Page",
    "DOM",
    "Network",
    "Runtime",
    "Accessibility",
    "DOMSnapshot",
];

/// Capability surface the perceiver, dispatcher and watchdogs are written
/// against. [`CdpSession`] is the live implementation; tests substitute a
/// fake without a browser.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Send a command scoped to the active tab.
    async fn call(&self, method: &str, params: Value) -> Result<Value, SessionError>;

    /// Send a browser-scoped command.
    async fn browser_call(&self, method: &str, params: Value) -> Result<Value, SessionError>;

    /// Evaluate a script expression in the active tab and return its value.
    async fn evaluate(&self, expression: &str) -> Result<Value, SessionError>;

    /// Committed URL of the active tab.
    async fn current_url(&self) -> Result<String, SessionError>;

    async fn tabs(&self) -> Result<Vec<TabInfo>, SessionError>;
    async fn create_tab(&self, url: &str) -> Result<TabInfo, SessionError>;
    async fn switch_tab(&self, index: usize) -> Result<TabInfo, SessionError>;
    async fn close_tab(&self, index: usize) -> Result<(), SessionError>;

    async fn navigate(&self, url: &str) -> Result<(), SessionError>;
    async fn go_back(&self) -> Result<(), SessionError>;
    async fn go_forward(&self) -> Result<(), SessionError>;
    async fn refresh(&self) -> Result<(), SessionError>;
}

/// One live protocol session: owns the transport, pumps its events onto the
/// bus, and tracks page targets.
pub struct CdpSession {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    registry: Mutex<TabRegistry>,
    pump_task: JoinHandle<()>,
}

impl CdpSession {
    /// Launch or attach per `config`, then bootstrap the initial tab.
    pub async fn connect(
        config: SessionConfig,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Self>, SessionError> {
        let transport = Arc::new(ChromiumTransport::connect(&config).await?);
        Self::with_transport(transport, bus, config).await
    }

    /// Bootstrap over an already-connected transport.
    pub async fn with_transport(
        transport: Arc<dyn Transport>,
        bus: Arc<EventBus>,
        config: SessionConfig,
    ) -> Result<Arc<Self>, SessionError> {
        transport
            .send(
                CommandTarget::Browser,
                "Target.setDiscoverTargets",
                json!({ "discover": true }),
            )
            .await?;
        transport
            .send(
                CommandTarget::Browser,
                "Target.setAutoAttach",
                json!({
                    "autoAttach": true,
                    "waitForDebuggerOnStart": false,
                    "flatten": true,
                }),
            )
            .await?;

        let pump_task = spawn_event_pump(transport.clone(), bus);

        let session = Arc::new(Self {
            transport,
            config,
            registry: Mutex::new(TabRegistry::default()),
            pump_task,
        });
        session.bootstrap().await?;
        Ok(session)
    }

    /// Adopt the first existing page target, or create one.
    async fn bootstrap(&self) -> Result<(), SessionError> {
        let targets = self.fetch_target_infos().await?;
        let mut registry = self.registry.lock().await;
        registry.reconcile(&targets);

        if registry.len() == 0 {
            let created = self
                .send_browser("Target.createTarget", json!({ "url": "about:blank" }))
                .await?;
            let target_id = created
                .get("targetId")
                .and_then(Value::as_str)
                .ok_or_else(|| SessionError::internal("createTarget returned no targetId"))?
                .to_string();
            let session_id = self.attach(&target_id).await?;
            registry.push_active(TabEntry {
                target_id: TargetId::from(target_id.as_str()),
                session_id: Some(session_id),
                url: "about:blank".to_string(),
                title: String::new(),
            });
            info!(target: "cdp", tab = %target_id, "created initial tab");
            return Ok(());
        }

        let target_id = match registry.get(0) {
            Some(entry) => entry.target_id.0.clone(),
            None => return Err(SessionError::internal("tab registry empty after reconcile")),
        };
        let session_id = self.attach(&target_id).await?;
        if let Some(entry) = registry.get_mut(0) {
            entry.session_id = Some(session_id);
        }
        registry.set_active(0);
        info!(target: "cdp", tab = %target_id, "adopted existing tab");
        Ok(())
    }

    /// Attach to a target in flat mode and enable the standard domains.
    async fn attach(&self, target_id: &str) -> Result<String, SessionError> {
        let attached = self
            .send_browser(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::internal("attachToTarget returned no sessionId"))?
            .to_string();
        self.enable_domains(&session_id).await?;
        Ok(session_id)
    }

    async fn enable_domains(&self, session_id: &str) -> Result<(), SessionError> {
        let enables = ENABLED_DOMAINS.iter().map(|domain| {
            let method = format!("{domain}.enable");
            async move {
                self.transport
                    .send(
                        CommandTarget::Session(session_id.to_string()),
                        &method,
                        json!({}),
                    )
                    .await
            }
        });
        futures::future::try_join_all(enables).await?;
        debug!(target: "cdp", session = session_id, "protocol domains enabled");
        Ok(())
    }

    async fn send_browser(&self, method: &str, params: Value) -> Result<Value, SessionError> {
        self.transport
            .send(CommandTarget::Browser, method, params)
            .await
    }

    async fn active_session_id(&self) -> Result<String, SessionError> {
        let registry = self.registry.lock().await;
        registry
            .active_entry()
            .and_then(|entry| entry.session_id.clone())
            .ok_or_else(|| SessionError::internal("no attached tab"))
    }

    async fn fetch_target_infos(&self) -> Result<Vec<Value>, SessionError> {
        let result = self.send_browser("Target.getTargets", json!({})).await?;
        let infos = result
            .get("targetInfos")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(infos)
    }

    /// Poll the document ready state until it is usable or the navigation
    /// deadline passes. A deadline here is not an error: slow pages are the
    /// stability wait's problem, not navigation's.
    async fn wait_for_ready(&self) -> Result<(), SessionError> {
        let deadline = tokio::time::Instant::now() + self.config.navigation_timeout();
        loop {
            match self.evaluate("document.readyState").await {
                Ok(state)
                    if matches!(state.as_str(), Some("interactive") | Some("complete")) =>
                {
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => debug!(target: "cdp", %err, "readiness poll failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(target: "cdp", "document readiness not reached before deadline; proceeding");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn history_step(&self, delta: i64, label: &str) -> Result<(), SessionError> {
        let history = self.call("Page.getNavigationHistory", json!({})).await?;
        let current = history
            .get("currentIndex")
            .and_then(Value::as_i64)
            .ok_or_else(|| SessionError::internal("navigation history missing currentIndex"))?;
        let entries = history
            .get("entries")
            .and_then(Value::as_array)
            .ok_or_else(|| SessionError::internal("navigation history missing entries"))?;

        let target = current + delta;
        if target < 0 || target as usize >= entries.len() {
            return Err(SessionError::Navigation(format!(
                "no history entry to go {label}"
            )));
        }
        let entry_id = entries[target as usize]
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| SessionError::internal("history entry missing id"))?;

        self.call("Page.navigateToHistoryEntry", json!({ "entryId": entry_id }))
            .await?;
        self.wait_for_ready().await
    }
}

#[async_trait]
impl ProtocolClient for CdpSession {
    async fn call(&self, method: &str, params: Value) -> Result<Value, SessionError> {
        let session_id = self.active_session_id().await?;
        self.transport
            .send(CommandTarget::Session(session_id), method, params)
            .await
    }

    async fn browser_call(&self, method: &str, params: Value) -> Result<Value, SessionError> {
        self.send_browser(method, params).await
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, SessionError> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|exception| exception.get("description"))
                .and_then(Value::as_str)
                .or_else(|| details.get("text").and_then(Value::as_str))
                .unwrap_or("unknown script exception");
            return Err(SessionError::Script(text.to_string()));
        }

        Ok(result
            .get("result")
            .and_then(|payload| payload.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        let history = self.call("Page.getNavigationHistory", json!({})).await?;
        let current = history
            .get("currentIndex")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let url = history
            .get("entries")
            .and_then(Value::as_array)
            .and_then(|entries| entries.get(current as usize))
            .and_then(|entry| entry.get("url"))
            .and_then(Value::as_str)
            .unwrap_or("about:blank")
            .to_string();
        Ok(url)
    }

    async fn tabs(&self) -> Result<Vec<TabInfo>, SessionError> {
        let targets = self.fetch_target_infos().await?;
        let mut registry = self.registry.lock().await;
        registry.reconcile(&targets);
        Ok(registry.infos())
    }

    async fn create_tab(&self, url: &str) -> Result<TabInfo, SessionError> {
        let created = self
            .send_browser("Target.createTarget", json!({ "url": url }))
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::internal("createTarget returned no targetId"))?
            .to_string();
        let session_id = self.attach(&target_id).await?;

        let mut registry = self.registry.lock().await;
        registry.push_active(TabEntry {
            target_id: TargetId::from(target_id.as_str()),
            session_id: Some(session_id),
            url: url.to_string(),
            title: String::new(),
        });
        info!(target: "cdp", tab = %target_id, url, "tab created");
        registry
            .active_entry()
            .map(|entry| TabInfo {
                target_id: entry.target_id.clone(),
                url: entry.url.clone(),
                title: entry.title.clone(),
                session_id: entry.session_id.clone(),
                is_active: true,
            })
            .ok_or_else(|| SessionError::internal("registry lost freshly created tab"))
    }

    async fn switch_tab(&self, index: usize) -> Result<TabInfo, SessionError> {
        let mut registry = self.registry.lock().await;
        let entry = registry
            .get(index)
            .cloned()
            .ok_or(SessionError::NoSuchTab(index))?;

        self.send_browser(
            "Target.activateTarget",
            json!({ "targetId": entry.target_id.0 }),
        )
        .await?;

        // Tabs discovered via reconcile may never have been attached.
        if entry.session_id.is_none() {
            let session_id = self.attach(&entry.target_id.0).await?;
            if let Some(slot) = registry.get_mut(index) {
                slot.session_id = Some(session_id);
            }
        }
        registry.set_active(index);
        info!(target: "cdp", tab = %entry.target_id, "switched tab");

        registry
            .get(index)
            .map(|slot| TabInfo {
                target_id: slot.target_id.clone(),
                url: slot.url.clone(),
                title: slot.title.clone(),
                session_id: slot.session_id.clone(),
                is_active: true,
            })
            .ok_or(SessionError::NoSuchTab(index))
    }

    async fn close_tab(&self, index: usize) -> Result<(), SessionError> {
        let mut registry = self.registry.lock().await;
        if registry.len() <= 1 {
            return Err(SessionError::LastTab);
        }
        let entry = registry
            .get(index)
            .cloned()
            .ok_or(SessionError::NoSuchTab(index))?;

        // Closing the active tab: hand focus to a neighbour first.
        if index == registry.active_index() {
            let replacement = if index + 1 < registry.len() {
                index + 1
            } else {
                index - 1
            };
            if let Some(next) = registry.get(replacement).cloned() {
                self.send_browser(
                    "Target.activateTarget",
                    json!({ "targetId": next.target_id.0 }),
                )
                .await?;
                if next.session_id.is_none() {
                    let session_id = self.attach(&next.target_id.0).await?;
                    if let Some(slot) = registry.get_mut(replacement) {
                        slot.session_id = Some(session_id);
                    }
                }
                registry.set_active(replacement);
            }
        }

        self.send_browser(
            "Target.closeTarget",
            json!({ "targetId": entry.target_id.0 }),
        )
        .await?;
        registry.remove(index);
        info!(target: "cdp", tab = %entry.target_id, "tab closed");
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        let result = self.call("Page.navigate", json!({ "url": url })).await?;
        if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
            if !error_text.is_empty() {
                return Err(SessionError::Navigation(error_text.to_string()));
            }
        }
        self.wait_for_ready().await
    }

    async fn go_back(&self) -> Result<(), SessionError> {
        self.history_step(-1, "back").await
    }

    async fn go_forward(&self) -> Result<(), SessionError> {
        self.history_step(1, "forward").await
    }

    async fn refresh(&self) -> Result<(), SessionError> {
        self.call("Page.reload", json!({})).await?;
        self.wait_for_ready().await
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        self.pump_task.abort();
    }
}

fn spawn_event_pump(transport: Arc<dyn Transport>, bus: Arc<EventBus>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = transport.next_event().await {
            let report = bus.publish(BusEvent::Protocol(event)).await;
            if !report.all_ok() {
                debug!(
                    target: "cdp",
                    failures = report.failures.len(),
                    "event handlers reported failures"
                );
            }
        }
        warn!(target: "cdp", "protocol event stream ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsman_event_bus::{ProtocolEvent, Topic};
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct FakeTransport {
        responses: SyncMutex<HashMap<String, Value>>,
        calls: SyncMutex<Vec<(String, Value)>>,
        events: Mutex<mpsc::Receiver<ProtocolEvent>>,
    }

    impl FakeTransport {
        fn new() -> (Arc<Self>, mpsc::Sender<ProtocolEvent>) {
            let (tx, rx) = mpsc::channel(16);
            (
                Arc::new(Self {
                    responses: SyncMutex::new(HashMap::new()),
                    calls: SyncMutex::new(Vec::new()),
                    events: Mutex::new(rx),
                }),
                tx,
            )
        }

        fn respond(&self, method: &str, value: Value) {
            self.responses.lock().insert(method.to_string(), value);
        }

        fn calls_for(&self, method: &str) -> Vec<Value> {
            self.calls
                .lock()
                .iter()
                .filter(|(name, _)| name == method)
                .map(|(_, params)| params.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(
            &self,
            _target: CommandTarget,
            method: &str,
            params: Value,
        ) -> Result<Value, SessionError> {
            self.calls.lock().push((method.to_string(), params));
            Ok(self
                .responses
                .lock()
                .get(method)
                .cloned()
                .unwrap_or_else(|| json!({})))
        }

        async fn next_event(&self) -> Option<ProtocolEvent> {
            self.events.lock().await.recv().await
        }

        fn is_alive(&self) -> bool {
            true
        }
    }

    fn one_page_target(fake: &FakeTransport) {
        fake.respond(
            "Target.getTargets",
            json!({ "targetInfos": [
                { "targetId": "t1", "type": "page", "url": "https://a.test", "title": "A" }
            ]}),
        );
        fake.respond("Target.attachToTarget", json!({ "sessionId": "s1" }));
    }

    async fn build_session(fake: Arc<FakeTransport>) -> Arc<CdpSession> {
        let bus = EventBus::new();
        CdpSession::with_transport(fake, bus, SessionConfig::default())
            .await
            .expect("session bootstrap")
    }

    #[tokio::test]
    async fn bootstrap_adopts_existing_tab_and_enables_domains() {
        let (fake, _events) = FakeTransport::new();
        one_page_target(&fake);

        let session = build_session(fake.clone()).await;

        let tabs = session.tabs().await.expect("tabs");
        assert_eq!(tabs.len(), 1);
        assert!(tabs[0].is_active);
        assert_eq!(tabs[0].session_id.as_deref(), Some("s1"));
        assert_eq!(fake.calls_for("Accessibility.enable").len(), 1);
        assert_eq!(fake.calls_for("DOMSnapshot.enable").len(), 1);
    }

    #[tokio::test]
    async fn bootstrap_creates_tab_when_none_exist() {
        let (fake, _events) = FakeTransport::new();
        fake.respond("Target.getTargets", json!({ "targetInfos": [] }));
        fake.respond("Target.createTarget", json!({ "targetId": "fresh" }));
        fake.respond("Target.attachToTarget", json!({ "sessionId": "s9" }));

        let session = build_session(fake.clone()).await;

        assert_eq!(fake.calls_for("Target.createTarget").len(), 1);
        let url = session.current_url().await;
        assert!(url.is_ok());
    }

    #[tokio::test]
    async fn create_tab_becomes_active_and_close_switches_back() {
        let (fake, _events) = FakeTransport::new();
        one_page_target(&fake);
        fake.respond("Target.createTarget", json!({ "targetId": "t2" }));

        let session = build_session(fake.clone()).await;

        let tab = session.create_tab("https://b.test").await.expect("create");
        assert!(tab.is_active);
        assert_eq!(tab.target_id.0, "t2");

        session.close_tab(1).await.expect("close");
        let closed = fake.calls_for("Target.closeTarget");
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0]["targetId"], "t2");
    }

    #[tokio::test]
    async fn closing_the_last_tab_is_refused() {
        let (fake, _events) = FakeTransport::new();
        one_page_target(&fake);

        let session = build_session(fake.clone()).await;

        let err = session.close_tab(0).await.expect_err("must refuse");
        assert!(matches!(err, SessionError::LastTab));
        assert!(fake.calls_for("Target.closeTarget").is_empty());
    }

    #[tokio::test]
    async fn switch_tab_rejects_unknown_index() {
        let (fake, _events) = FakeTransport::new();
        one_page_target(&fake);

        let session = build_session(fake).await;
        let err = session.switch_tab(4).await.expect_err("no such tab");
        assert!(matches!(err, SessionError::NoSuchTab(4)));
    }

    #[tokio::test]
    async fn navigate_surfaces_protocol_error_text() {
        let (fake, _events) = FakeTransport::new();
        one_page_target(&fake);
        fake.respond(
            "Page.navigate",
            json!({ "errorText": "net::ERR_NAME_NOT_RESOLVED" }),
        );

        let session = build_session(fake).await;
        let err = session
            .navigate("https://nope.invalid")
            .await
            .expect_err("dns failure");
        assert!(matches!(err, SessionError::Navigation(ref text) if text.contains("ERR_NAME")));
    }

    #[tokio::test]
    async fn navigate_waits_for_document_readiness() {
        let (fake, _events) = FakeTransport::new();
        one_page_target(&fake);
        fake.respond("Page.navigate", json!({ "frameId": "f1" }));
        fake.respond(
            "Runtime.evaluate",
            json!({ "result": { "type": "string", "value": "complete" } }),
        );

        let session = build_session(fake.clone()).await;
        session.navigate("https://a.test").await.expect("navigate");
        assert!(!fake.calls_for("Runtime.evaluate").is_empty());
    }

    #[tokio::test]
    async fn evaluate_maps_exception_details() {
        let (fake, _events) = FakeTransport::new();
        one_page_target(&fake);
        fake.respond(
            "Runtime.evaluate",
            json!({
                "result": { "type": "undefined" },
                "exceptionDetails": {
                    "text": "Uncaught",
                    "exception": { "description": "ReferenceError: nope is not defined" }
                }
            }),
        );

        let session = build_session(fake).await;
        let err = session.evaluate("nope()").await.expect_err("throws");
        assert!(matches!(err, SessionError::Script(ref text) if text.contains("ReferenceError")));
    }

    #[tokio::test]
    async fn go_back_fails_at_history_start() {
        let (fake, _events) = FakeTransport::new();
        one_page_target(&fake);
        fake.respond(
            "Page.getNavigationHistory",
            json!({
                "currentIndex": 0,
                "entries": [ { "id": 1, "url": "https://a.test" } ]
            }),
        );

        let session = build_session(fake).await;
        let err = session.go_back().await.expect_err("no earlier entry");
        assert!(matches!(err, SessionError::Navigation(ref text) if text.contains("back")));

        let url = session.current_url().await.expect("url");
        assert_eq!(url, "https://a.test");
    }

    #[tokio::test]
    async fn event_pump_forwards_to_bus() {
        let (fake, events) = FakeTransport::new();
        one_page_target(&fake);

        let bus = EventBus::new();
        let (sub, mut rx) = bus.subscribe_channel(Topic::PageEvents, 4);
        let _session = CdpSession::with_transport(fake, bus.clone(), SessionConfig::default())
            .await
            .expect("session");

        events
            .send(ProtocolEvent::new("Page.loadEventFired", json!({})))
            .await
            .expect("feed event");

        let received = rx.recv().await.expect("event on bus");
        assert_eq!(
            received.as_protocol().map(|event| event.method.as_str()),
            Some("Page.loadEventFired")
        );
        bus.unsubscribe(sub);
    }
}
