//! The decision-engine seam.
//!
//! The engine is an external collaborator: it sees only rendered text (the
//! serialized snapshot and the formatted history) and answers with an intent
//! batch plus its own bookkeeping strings. LLM-backed implementations live
//! outside this workspace; the binary ships a scripted engine for demos and
//! integration tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use action_dispatch::ActionIntent;

/// Everything the loop hands the engine for one consultation.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub task: &'a str,
    /// 1-based step number of the step being decided.
    pub step: u32,
    /// Rendered [`BrowserStateSnapshot`](dom_perceiver::BrowserStateSnapshot).
    pub state: &'a str,
    /// Rendered recent history, empty on the first step.
    pub history: &'a str,
}

/// One engine reply: the intent batch plus the stateful strings that make
/// the engine's progress visible in history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// How the previous step went, in the engine's judgement.
    #[serde(default)]
    pub evaluation: Option<String>,
    /// Working memory the engine wants echoed back next step.
    #[serde(default)]
    pub memory: Option<String>,
    /// What the coming batch is trying to achieve.
    #[serde(default)]
    pub next_goal: Option<String>,
    pub intents: Vec<ActionIntent>,
}

/// An engine consultation that produced no usable decision.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

#[async_trait]
pub trait DecisionEngine: Send + Sync {
    async fn decide(&self, context: DecisionContext<'_>) -> Result<Decision, EngineError>;
}
