//! The stepwise control loop that turns a natural-language task into
//! browser actions.
//!
//! Each step runs the same pipeline: wait for any pending page settle,
//! extract a fresh [`dom_perceiver::BrowserStateSnapshot`], ask the
//! [`DecisionEngine`] for the next intent batch, validate and execute the
//! batch through the dispatcher, and record what happened. The loop is the
//! only writer of history and the only component that decides when a run
//! is over; engines and dispatchers stay stateless between steps.
//!
//! Terminal states are deliberate and few: the engine declares completion,
//! the run blocks (repeated equivalent failures, an unanswerable
//! escalation, or session loss), or the step ceiling is hit.

mod config;
mod engine;
mod error;
mod history;
mod observer;
mod runner;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::LoopConfig;
pub use engine::{Decision, DecisionContext, DecisionEngine, EngineError};
pub use error::LoopError;
pub use history::{render_history, IntentOutcome, StepRecord};
pub use observer::{NoopObserver, StepObserver};
pub use runner::{OrchestrationLoop, RunOutcome, RunStatus};
