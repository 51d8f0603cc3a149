//! Per-intent execution outcome, as recorded in step history.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
    /// The action ran but its effect cannot be confirmed from here, e.g. a
    /// human escalation awaiting an answer.
    Uncertain,
}

/// Classification of a failed result, for callers that branch on cause.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The referenced index is absent from the snapshot. The browser was
    /// never touched.
    InvalidTarget,
    /// Every selector strategy and retry was exhausted.
    ActionFailed,
}

/// What one intent execution produced. Failures ride in here rather than in
/// an error type so the decision engine sees them in history and can adapt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    pub message: String,
    /// Selector strategy that resolved the target, for element actions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    /// Attempts consumed; 1 for a first-try outcome.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Success,
            message: message.into(),
            strategy: None,
            attempts: 1,
            failure: None,
        }
    }

    /// Success via a named selector strategy.
    pub fn ok_via(message: impl Into<String>, strategy: &str) -> Self {
        Self {
            strategy: Some(strategy.to_string()),
            ..Self::ok(message)
        }
    }

    pub fn uncertain(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Uncertain,
            ..Self::ok(message)
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failed,
            failure: Some(FailureKind::ActionFailed),
            ..Self::ok(message)
        }
    }

    pub fn invalid_target(message: impl Into<String>) -> Self {
        Self {
            failure: Some(FailureKind::InvalidTarget),
            ..Self::failed(message)
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }

    pub fn is_failure(&self) -> bool {
        self.status == ActionStatus::Failed
    }
}
