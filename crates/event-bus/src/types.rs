//! Topics, raw protocol events and derived watchdog signals carried on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of bus topics.
///
/// Raw protocol events are bucketed per protocol domain; derived watchdog
/// output travels on [`Topic::Signals`]. Adding a topic means extending this
/// enum, never stringly-typed registration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// `Page.*` events: frame lifecycle, load, navigation commits.
    PageEvents,
    /// `Network.*` events: request/response/loading lifecycle.
    NetworkEvents,
    /// `Runtime.*` and `Log.*` events: exceptions, console entries.
    RuntimeEvents,
    /// `DOM.*` and `DOMSnapshot.*` events.
    DomEvents,
    /// `Target.*` events: tab creation, attachment, destruction.
    TargetEvents,
    /// Any protocol event outside the domains above.
    OtherEvents,
    /// Derived [`WatchdogSignal`]s.
    Signals,
}

impl Topic {
    /// Topic a raw protocol method is delivered on.
    pub fn for_method(method: &str) -> Topic {
        match method.split('.').next().unwrap_or("") {
            "Page" => Topic::PageEvents,
            "Network" => Topic::NetworkEvents,
            "Runtime" | "Log" => Topic::RuntimeEvents,
            "DOM" | "DOMSnapshot" => Topic::DomEvents,
            "Target" => Topic::TargetEvents,
            _ => Topic::OtherEvents,
        }
    }
}

/// One raw protocol event as forwarded by the session's event pump.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolEvent {
    /// Fully qualified method, e.g. `Network.requestWillBeSent`.
    pub method: String,
    /// Raw event parameters as delivered by the browser.
    pub params: Value,
    /// Protocol session the event belongs to, when the browser scoped it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ProtocolEvent {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn topic(&self) -> Topic {
        Topic::for_method(&self.method)
    }
}

/// Kinds of derived signals the watchdogs publish.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    NavigationComplete,
    NetworkIdle,
    DomMutated,
    ErrorDetected,
}

/// Derived event published by a watchdog.
///
/// Consumed by the orchestration loop as an advisory wait hint; never
/// persisted beyond the current step's decision window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchdogSignal {
    pub kind: SignalKind,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

impl WatchdogSignal {
    pub fn new(kind: SignalKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            emitted_at: Utc::now(),
        }
    }
}

/// Payload delivered to bus handlers.
#[derive(Clone, Debug)]
pub enum BusEvent {
    Protocol(ProtocolEvent),
    Signal(WatchdogSignal),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::Protocol(event) => event.topic(),
            BusEvent::Signal(_) => Topic::Signals,
        }
    }

    pub fn as_protocol(&self) -> Option<&ProtocolEvent> {
        match self {
            BusEvent::Protocol(event) => Some(event),
            BusEvent::Signal(_) => None,
        }
    }

    pub fn as_signal(&self) -> Option<&WatchdogSignal> {
        match self {
            BusEvent::Signal(signal) => Some(signal),
            BusEvent::Protocol(_) => None,
        }
    }
}
