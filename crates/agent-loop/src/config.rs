use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the orchestration loop. Every field has a documented
/// default; a config file only needs the values it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Hard ceiling on steps before the run ends as `MaxStepsExceeded`.
    pub max_steps: u32,
    /// Per-step cap K on the intent batch; longer batches are truncated.
    pub max_actions_per_step: usize,
    /// Consecutive equivalent failures before the run ends as `Blocked`.
    pub max_consecutive_failures: u32,
    /// Extraction-timeout retries within one step before the run blocks.
    pub extraction_retries: u32,
    /// Most-recent StepRecords rendered for the decision engine.
    pub history_window: usize,
    /// Upper bound on the pre-snapshot stability wait.
    pub stability_timeout_ms: u64,
    /// Pause between intents within one batch.
    pub wait_between_actions_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            max_actions_per_step: 4,
            max_consecutive_failures: 3,
            extraction_retries: 3,
            history_window: 5,
            stability_timeout_ms: 10_000,
            wait_between_actions_ms: 200,
        }
    }
}

impl LoopConfig {
    pub(crate) fn stability_timeout(&self) -> Duration {
        Duration::from_millis(self.stability_timeout_ms)
    }

    pub(crate) fn wait_between_actions(&self) -> Duration {
        Duration::from_millis(self.wait_between_actions_ms)
    }
}
