//! The finite control loop: wait, extract, decide, dispatch, observe.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use action_dispatch::{validate_batch, ActionIntent, BatchError, Dispatcher};
use cdp_session::{ProtocolClient, SessionError};
use dom_perceiver::{BrowserStateSnapshot, Perceiver};
use helmsman_core_types::RunId;
use helmsman_event_bus::{BusEvent, EventBus, SignalKind, SubscriptionId, Topic};

use crate::config::LoopConfig;
use crate::engine::{Decision, DecisionContext, DecisionEngine};
use crate::error::LoopError;
use crate::history::{render_history, IntentOutcome, StepRecord};
use crate::observer::{NoopObserver, StepObserver};

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The engine declared completion, successfully or not.
    Done { success: bool },
    /// The run cannot make progress: repeated equivalent failures, an
    /// unanswerable escalation, or a run-fatal error.
    Blocked,
    /// The step ceiling was reached without completion.
    MaxStepsExceeded,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Done { success: true } => write!(f, "done"),
            RunStatus::Done { success: false } => write!(f, "done (unsuccessful)"),
            RunStatus::Blocked => write!(f, "blocked"),
            RunStatus::MaxStepsExceeded => write!(f, "max steps exceeded"),
        }
    }
}

/// Final result of one orchestration run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub message: String,
    pub steps_taken: u32,
    pub records: Vec<StepRecord>,
    pub total_time_ms: u64,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Done { success: true })
    }
}

/// What one step decided about the run's future.
enum StepVerdict {
    Continue,
    Done { success: bool, message: String },
    Blocked { reason: String },
}

/// Key identifying a failure for the consecutive-failure streak. Two
/// failures are equivalent when the same intent failed, or when the engine
/// itself failed to decide.
#[derive(Debug, PartialEq)]
enum FailureKey {
    Engine,
    Intent(ActionIntent),
}

#[derive(Default)]
struct FailureStreak {
    key: Option<FailureKey>,
    count: u32,
}

impl FailureStreak {
    /// Record a failure; returns the current streak length.
    fn note(&mut self, key: FailureKey) -> u32 {
        if self.key.as_ref() == Some(&key) {
            self.count += 1;
        } else {
            self.key = Some(key);
            self.count = 1;
        }
        self.count
    }

    fn clear(&mut self) {
        self.key = None;
        self.count = 0;
    }
}

/// A pending stability wait, armed when a step may have changed page
/// identity. Subscribing at arm time (not at wait time) means a signal
/// emitted between the two buffers in the channel instead of being missed.
struct StabilityGate {
    bus: Arc<EventBus>,
    subscription: SubscriptionId,
    rx: mpsc::Receiver<BusEvent>,
}

impl StabilityGate {
    fn arm(bus: Arc<EventBus>) -> Self {
        let (subscription, rx) = bus.subscribe_channel(Topic::Signals, 16);
        Self {
            bus,
            subscription,
            rx,
        }
    }

    /// Bounded race: the first settle signal wins, else the timeout. The
    /// signals are advisory, so timing out is a normal outcome.
    async fn wait(mut self, bound: Duration) {
        let outcome = tokio::time::timeout(bound, async {
            while let Some(event) = self.rx.recv().await {
                if let Some(signal) = event.as_signal() {
                    match signal.kind {
                        SignalKind::NavigationComplete | SignalKind::NetworkIdle => return true,
                        SignalKind::DomMutated | SignalKind::ErrorDetected => {}
                    }
                }
            }
            false
        })
        .await;
        match outcome {
            Ok(true) => debug!(target: "loop", "page settled"),
            Ok(false) => debug!(target: "loop", "signal channel closed during wait"),
            Err(_) => debug!(target: "loop", "stability wait timed out; proceeding"),
        }
    }
}

impl Drop for StabilityGate {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription);
    }
}

#[derive(Default)]
struct RunState {
    records: Vec<StepRecord>,
    streak: FailureStreak,
    gate: Option<StabilityGate>,
}

/// Everything one batch execution produced.
#[derive(Default)]
struct BatchRun {
    outcomes: Vec<IntentOutcome>,
    done: Option<(String, bool)>,
    escalation: Option<String>,
    url_changed: bool,
    fatal: Option<SessionError>,
}

/// Intents that are expected to change page identity when they succeed.
fn intent_navigates(intent: &ActionIntent) -> bool {
    matches!(
        intent,
        ActionIntent::Navigate { .. }
            | ActionIntent::GoBack
            | ActionIntent::GoForward
            | ActionIntent::RefreshPage
            | ActionIntent::NewTab { .. }
            | ActionIntent::SwitchTab { .. }
            | ActionIntent::CloseTab { .. }
    )
}

/// The orchestration loop. Strictly sequential: one step at a time, one
/// dispatcher call at a time, driven until a terminal [`RunStatus`].
pub struct OrchestrationLoop {
    perceiver: Box<dyn Perceiver>,
    engine: Arc<dyn DecisionEngine>,
    dispatcher: Arc<dyn Dispatcher>,
    client: Arc<dyn ProtocolClient>,
    bus: Arc<EventBus>,
    observer: Arc<dyn StepObserver>,
    config: LoopConfig,
}

impl OrchestrationLoop {
    pub fn new(
        perceiver: Box<dyn Perceiver>,
        engine: Arc<dyn DecisionEngine>,
        dispatcher: Arc<dyn Dispatcher>,
        client: Arc<dyn ProtocolClient>,
        bus: Arc<EventBus>,
        config: LoopConfig,
    ) -> Self {
        Self {
            perceiver,
            engine,
            dispatcher,
            client,
            bus,
            observer: Arc::new(NoopObserver),
            config,
        }
    }

    /// Install a step observer. The default does nothing.
    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Drive the task to a terminal status. Never panics and never returns
    /// early on recoverable trouble; every abnormal end is a definitive
    /// outcome with the full history attached.
    pub async fn run(&mut self, task: &str) -> RunOutcome {
        let run_id = RunId::new();
        let started = Instant::now();
        let mut state = RunState::default();
        let mut step = 0u32;
        info!(target: "loop", %run_id, task, "run started");

        loop {
            if step >= self.config.max_steps {
                let message = format!(
                    "reached the {} step ceiling without completion",
                    self.config.max_steps
                );
                warn!(target: "loop", %run_id, "{message}");
                return self.finish(run_id, RunStatus::MaxStepsExceeded, message, step, state, started);
            }
            step += 1;
            debug!(target: "loop", %run_id, step, "step started");

            match self.execute_step(task, step, &mut state).await {
                Ok(StepVerdict::Continue) => {}
                Ok(StepVerdict::Done { success, message }) => {
                    info!(target: "loop", %run_id, step, success, "run complete");
                    return self.finish(run_id, RunStatus::Done { success }, message, step, state, started);
                }
                Ok(StepVerdict::Blocked { reason }) => {
                    warn!(target: "loop", %run_id, step, %reason, "run blocked");
                    return self.finish(run_id, RunStatus::Blocked, reason, step, state, started);
                }
                Err(err) => {
                    error!(target: "loop", %run_id, step, %err, "run-fatal error");
                    return self.finish(run_id, RunStatus::Blocked, err.to_string(), step, state, started);
                }
            }
        }
    }

    fn finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        message: String,
        steps_taken: u32,
        state: RunState,
        started: Instant,
    ) -> RunOutcome {
        RunOutcome {
            run_id,
            status,
            message,
            steps_taken,
            records: state.records,
            total_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn execute_step(
        &mut self,
        task: &str,
        step: u32,
        state: &mut RunState,
    ) -> Result<StepVerdict, LoopError> {
        // A wait armed by the previous step runs before this snapshot so the
        // extraction sees the settled page.
        if let Some(gate) = state.gate.take() {
            gate.wait(self.config.stability_timeout()).await;
        }

        let snapshot = self.extract_with_retries().await?;

        let rendered = snapshot.render();
        let history = render_history(&state.records, self.config.history_window);
        let context = DecisionContext {
            task,
            step,
            state: &rendered,
            history: &history,
        };
        let decision = match self.engine.decide(context).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(target: "loop", step, %err, "decision engine failed");
                let record = StepRecord {
                    step,
                    url: snapshot.url.clone(),
                    evaluation: None,
                    memory: None,
                    next_goal: None,
                    outcomes: Vec::new(),
                    error: Some(format!("decision engine failed: {err}")),
                    completed_at: Utc::now(),
                };
                self.finish_step(record, &snapshot, state).await;
                let count = state.streak.note(FailureKey::Engine);
                if count >= self.config.max_consecutive_failures {
                    return Ok(StepVerdict::Blocked {
                        reason: format!("decision engine failed {count} consecutive steps: {err}"),
                    });
                }
                return Ok(StepVerdict::Continue);
            }
        };

        let Decision {
            evaluation,
            memory,
            next_goal,
            mut intents,
        } = decision;

        match validate_batch(&intents) {
            Ok(()) => {}
            Err(BatchError::DoneNotAlone) => {
                // Protocol violation by the engine, downgraded: only the
                // completion executes.
                warn!(
                    target: "loop",
                    step, "completion mixed with other intents; executing only the completion"
                );
                intents.retain(ActionIntent::is_done);
                intents.truncate(1);
            }
            Err(err) => {
                warn!(target: "loop", step, %err, "rejecting intent batch");
                let record = StepRecord {
                    step,
                    url: snapshot.url.clone(),
                    evaluation,
                    memory,
                    next_goal,
                    outcomes: Vec::new(),
                    error: Some(format!("batch rejected: {err}")),
                    completed_at: Utc::now(),
                };
                self.finish_step(record, &snapshot, state).await;
                let count = state.streak.note(FailureKey::Engine);
                if count >= self.config.max_consecutive_failures {
                    return Ok(StepVerdict::Blocked {
                        reason: format!("{count} consecutive unusable decisions: {err}"),
                    });
                }
                return Ok(StepVerdict::Continue);
            }
        }

        if intents.len() > self.config.max_actions_per_step {
            warn!(
                target: "loop",
                step,
                received = intents.len(),
                cap = self.config.max_actions_per_step,
                "truncating intent batch to the per-step cap"
            );
            intents.truncate(self.config.max_actions_per_step);
        }

        let batch = self.run_batch(&intents, &snapshot).await;
        let BatchRun {
            outcomes,
            done,
            escalation,
            url_changed,
            fatal,
        } = batch;

        let navigation_suspect = url_changed
            || outcomes
                .iter()
                .any(|outcome| outcome.result.is_success() && intent_navigates(&outcome.intent));

        let record = StepRecord {
            step,
            url: snapshot.url.clone(),
            evaluation,
            memory,
            next_goal,
            outcomes,
            error: fatal.as_ref().map(|err| format!("session lost: {err}")),
            completed_at: Utc::now(),
        };
        self.finish_step(record, &snapshot, state).await;

        if let Some(err) = fatal {
            return Err(LoopError::Session(err));
        }
        if let Some((message, success)) = done {
            return Ok(StepVerdict::Done { success, message });
        }
        if let Some(question) = escalation {
            return Ok(StepVerdict::Blocked {
                reason: format!("escalation requested with no human channel: {question}"),
            });
        }

        let failed_intent = state
            .records
            .last()
            .and_then(StepRecord::failed_outcome)
            .map(|outcome| outcome.intent.clone());
        match failed_intent {
            Some(intent) => {
                let description = intent.describe();
                let count = state.streak.note(FailureKey::Intent(intent));
                if count >= self.config.max_consecutive_failures {
                    return Ok(StepVerdict::Blocked {
                        reason: format!("{count} consecutive failures on {description}"),
                    });
                }
            }
            None => state.streak.clear(),
        }

        if navigation_suspect {
            state.gate = Some(StabilityGate::arm(self.bus.clone()));
        }
        Ok(StepVerdict::Continue)
    }

    async fn extract_with_retries(&mut self) -> Result<BrowserStateSnapshot, LoopError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.perceiver.extract().await {
                Ok(snapshot) => {
                    debug!(
                        target: "loop",
                        attempt,
                        elements = snapshot.element_count(),
                        url = %snapshot.url,
                        "extraction complete"
                    );
                    return Ok(snapshot);
                }
                Err(err) if err.retryable() && attempt <= self.config.extraction_retries => {
                    warn!(target: "loop", attempt, %err, "extraction timed out; retrying");
                }
                Err(err) => {
                    return Err(LoopError::Extraction {
                        attempts: attempt,
                        source: err,
                    })
                }
            }
        }
    }

    /// Execute a validated batch sequentially. Stops early on the first
    /// failed intent and on any page-identity change, because either can
    /// invalidate the indices the remaining intents reference.
    async fn run_batch(
        &self,
        intents: &[ActionIntent],
        snapshot: &BrowserStateSnapshot,
    ) -> BatchRun {
        let mut batch = BatchRun::default();
        let total = intents.len();

        for (position, intent) in intents.iter().enumerate() {
            if position > 0 {
                tokio::time::sleep(self.config.wait_between_actions()).await;
            }
            let result = match self.dispatcher.execute(intent, snapshot).await {
                Ok(result) => result,
                Err(err) => {
                    error!(target: "loop", %err, "transport lost mid-batch");
                    batch.fatal = Some(err);
                    return batch;
                }
            };
            debug!(
                target: "loop",
                intent = %intent.describe(),
                status = ?result.status,
                "intent executed"
            );

            if let ActionIntent::Done { message, success } = intent {
                batch.done = Some((message.clone(), *success));
            }
            if let ActionIntent::AskHuman { question } = intent {
                batch.escalation = Some(question.clone());
            }

            let failed = result.is_failure();
            batch.outcomes.push(IntentOutcome {
                intent: intent.clone(),
                result,
            });
            if failed {
                if position + 1 < total {
                    debug!(
                        target: "loop",
                        dropped = total - position - 1,
                        "intent failed; dropping the rest of the batch"
                    );
                }
                break;
            }

            match self.client.current_url().await {
                Ok(url) if url != snapshot.url => {
                    batch.url_changed = true;
                    if position + 1 < total {
                        info!(
                            target: "loop",
                            %url, "page identity changed; dropping the rest of the batch"
                        );
                    }
                    break;
                }
                Ok(_) => {}
                Err(err) if err.is_fatal() => {
                    batch.fatal = Some(err);
                    return batch;
                }
                Err(err) => debug!(target: "loop", %err, "page identity probe failed"),
            }
        }
        batch
    }

    async fn finish_step(
        &self,
        record: StepRecord,
        snapshot: &BrowserStateSnapshot,
        state: &mut RunState,
    ) {
        self.observer.on_step(&record, snapshot).await;
        state.records.push(record);
    }
}
