//! Scriptable stand-ins for every seam the loop drives.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use action_dispatch::{ActionIntent, ActionResult, Dispatcher};
use cdp_session::{ProtocolClient, SessionError, TabInfo};
use dom_perceiver::{
    BrowserStateSnapshot, PerceiveError, Perceiver, ScrollPosition, ViewportSize,
};

use crate::config::LoopConfig;
use crate::engine::{Decision, DecisionContext, DecisionEngine, EngineError};
use crate::history::StepRecord;
use crate::observer::StepObserver;

pub(crate) const TEST_URL: &str = "https://app.test/page";

pub(crate) fn snapshot_at(url: &str) -> BrowserStateSnapshot {
    BrowserStateSnapshot {
        url: url.to_string(),
        previous_url: None,
        scroll: ScrollPosition { x: 0.0, y: 0.0 },
        viewport: ViewportSize {
            width: 1280.0,
            height: 800.0,
        },
        tree: Vec::new(),
        indexed: Vec::new(),
        captured_at: Utc::now(),
    }
}

/// Timings tight enough that retry and stability paths finish in
/// milliseconds.
pub(crate) fn fast_config() -> LoopConfig {
    LoopConfig {
        stability_timeout_ms: 40,
        wait_between_actions_ms: 1,
        ..LoopConfig::default()
    }
}

/// Perceiver that replays a script of results, then settles on empty
/// snapshots of [`TEST_URL`].
pub(crate) struct FakePerceiver {
    script: VecDeque<Result<BrowserStateSnapshot, PerceiveError>>,
    pub(crate) extractions: Arc<Mutex<u32>>,
}

impl FakePerceiver {
    pub(crate) fn scripted(script: Vec<Result<BrowserStateSnapshot, PerceiveError>>) -> Self {
        Self {
            script: script.into(),
            extractions: Arc::new(Mutex::new(0)),
        }
    }

    pub(crate) fn always_ok() -> Self {
        Self::scripted(Vec::new())
    }
}

#[async_trait]
impl Perceiver for FakePerceiver {
    async fn extract(&mut self) -> Result<BrowserStateSnapshot, PerceiveError> {
        *self.extractions.lock() += 1;
        self.script
            .pop_front()
            .unwrap_or_else(|| Ok(snapshot_at(TEST_URL)))
    }
}

/// Engine that replays scripted decisions and fails once the script runs
/// out, so a test that loops further than intended surfaces as a failure.
pub(crate) struct FakeEngine {
    script: Mutex<VecDeque<Result<Decision, EngineError>>>,
}

impl FakeEngine {
    pub(crate) fn scripted(script: Vec<Result<Decision, EngineError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
        })
    }

    pub(crate) fn batches(batches: Vec<Vec<ActionIntent>>) -> Arc<Self> {
        Self::scripted(
            batches
                .into_iter()
                .map(|intents| {
                    Ok(Decision {
                        evaluation: None,
                        memory: None,
                        next_goal: None,
                        intents,
                    })
                })
                .collect(),
        )
    }
}

#[async_trait]
impl DecisionEngine for FakeEngine {
    async fn decide(&self, _context: DecisionContext<'_>) -> Result<Decision, EngineError> {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(EngineError("decision script exhausted".to_string())))
    }
}

type ExecFn = dyn Fn(&ActionIntent) -> Result<ActionResult, SessionError> + Send + Sync;

/// Dispatcher that applies one closure to every intent and logs what ran.
pub(crate) struct FakeDispatcher {
    exec: Box<ExecFn>,
    executed: Mutex<Vec<ActionIntent>>,
}

impl FakeDispatcher {
    pub(crate) fn new(
        exec: impl Fn(&ActionIntent) -> Result<ActionResult, SessionError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            exec: Box::new(exec),
            executed: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn always_ok() -> Arc<Self> {
        Self::new(|intent| Ok(ActionResult::ok(intent.describe())))
    }

    pub(crate) fn executed(&self) -> Vec<ActionIntent> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    async fn execute(
        &self,
        intent: &ActionIntent,
        _snapshot: &BrowserStateSnapshot,
    ) -> Result<ActionResult, SessionError> {
        self.executed.lock().push(intent.clone());
        (self.exec)(intent)
    }
}

/// Protocol client that only answers the URL probe. The loop's own tests
/// never exercise tab or navigation plumbing directly.
pub(crate) struct StubClient {
    url: Mutex<String>,
}

impl StubClient {
    pub(crate) fn at(url: &str) -> Arc<Self> {
        Arc::new(Self {
            url: Mutex::new(url.to_string()),
        })
    }

    pub(crate) fn set_url(&self, url: &str) {
        *self.url.lock() = url.to_string();
    }
}

#[async_trait]
impl ProtocolClient for StubClient {
    async fn call(&self, _method: &str, _params: Value) -> Result<Value, SessionError> {
        Ok(Value::Null)
    }

    async fn browser_call(&self, _method: &str, _params: Value) -> Result<Value, SessionError> {
        Ok(Value::Null)
    }

    async fn evaluate(&self, _expression: &str) -> Result<Value, SessionError> {
        Ok(Value::Null)
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        Ok(self.url.lock().clone())
    }

    async fn tabs(&self) -> Result<Vec<TabInfo>, SessionError> {
        Ok(Vec::new())
    }

    async fn create_tab(&self, _url: &str) -> Result<TabInfo, SessionError> {
        Err(SessionError::internal("stub client has no tabs"))
    }

    async fn switch_tab(&self, index: usize) -> Result<TabInfo, SessionError> {
        Err(SessionError::NoSuchTab(index))
    }

    async fn close_tab(&self, index: usize) -> Result<(), SessionError> {
        Err(SessionError::NoSuchTab(index))
    }

    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.set_url(url);
        Ok(())
    }

    async fn go_back(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn go_forward(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn refresh(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Observer that records which steps it saw.
pub(crate) struct CountingObserver {
    steps: Mutex<Vec<u32>>,
}

impl CountingObserver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn seen(&self) -> Vec<u32> {
        self.steps.lock().clone()
    }
}

#[async_trait]
impl StepObserver for CountingObserver {
    async fn on_step(&self, record: &StepRecord, _snapshot: &BrowserStateSnapshot) {
        self.steps.lock().push(record.step);
    }
}
