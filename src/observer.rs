//! Step-by-step progress logging for interactive runs.

use async_trait::async_trait;
use tracing::{info, warn};

use action_dispatch::ActionStatus;
use agent_loop::{StepObserver, StepRecord};
use dom_perceiver::BrowserStateSnapshot;

/// Logs one summary line per completed step.
pub struct LoggingObserver;

#[async_trait]
impl StepObserver for LoggingObserver {
    async fn on_step(&self, record: &StepRecord, snapshot: &BrowserStateSnapshot) {
        let results = record
            .outcomes
            .iter()
            .map(|outcome| {
                let verdict = match outcome.result.status {
                    ActionStatus::Success => "ok",
                    ActionStatus::Failed => "failed",
                    ActionStatus::Uncertain => "uncertain",
                };
                format!("{} {verdict}", outcome.intent.describe())
            })
            .collect::<Vec<_>>()
            .join("; ");

        info!(
            target: "cli",
            step = record.step,
            url = %record.url,
            elements = snapshot.element_count(),
            results = %results,
            "step complete"
        );
        if let Some(goal) = &record.next_goal {
            info!(target: "cli", step = record.step, goal = %goal, "next goal");
        }
        if let Some(error) = &record.error {
            warn!(target: "cli", step = record.step, %error, "step error");
        }
    }
}
