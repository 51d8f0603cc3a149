//! A decision engine that replays a fixed plan.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use action_dispatch::ActionIntent;
use agent_loop::{Decision, DecisionContext, DecisionEngine, EngineError};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse plan {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("plan {path} has no steps")]
    Empty { path: PathBuf },
}

/// A replayable plan: one decision per step, in order.
#[derive(Debug, Clone, Deserialize)]
pub struct Plan {
    pub steps: Vec<Decision>,
}

/// Replays a [`Plan`] one decision per step. When the plan runs out before
/// the task completes, the engine declares an unsuccessful completion
/// rather than spinning against the failure ceiling.
///
/// LLM-backed engines are external; this is the one engine the binary
/// ships, for demos and deterministic integration runs.
#[derive(Debug)]
pub struct ScriptedDecisionEngine {
    steps: Mutex<VecDeque<Decision>>,
}

impl ScriptedDecisionEngine {
    pub fn new(plan: Plan) -> Self {
        Self {
            steps: Mutex::new(plan.steps.into()),
        }
    }

    /// Load a plan from a YAML or JSON file.
    pub fn from_file(path: &Path) -> Result<Self, PlanError> {
        let content = fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let plan: Plan = serde_yaml::from_str(&content).map_err(|source| PlanError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if plan.steps.is_empty() {
            return Err(PlanError::Empty {
                path: path.to_path_buf(),
            });
        }
        debug!(target: "cli", steps = plan.steps.len(), path = %path.display(), "plan loaded");
        Ok(Self::new(plan))
    }
}

#[async_trait]
impl DecisionEngine for ScriptedDecisionEngine {
    async fn decide(&self, context: DecisionContext<'_>) -> Result<Decision, EngineError> {
        match self.steps.lock().pop_front() {
            Some(decision) => Ok(decision),
            None => {
                warn!(target: "cli", step = context.step, "plan exhausted before completion");
                Ok(Decision {
                    evaluation: None,
                    memory: None,
                    next_goal: None,
                    intents: vec![ActionIntent::Done {
                        message: "scripted plan exhausted without completing the task".to_string(),
                        success: false,
                    }],
                })
            }
        }
    }
}
