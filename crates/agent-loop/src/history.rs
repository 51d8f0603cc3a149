//! Bounded step history and its rendering for the decision engine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use action_dispatch::{ActionIntent, ActionResult, ActionStatus};

/// One executed intent and what came of it.
#[derive(Debug, Clone, Serialize)]
pub struct IntentOutcome {
    pub intent: ActionIntent,
    pub result: ActionResult,
}

/// One entry in the run's history, appended after every step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: u32,
    /// URL of the snapshot this step acted on.
    pub url: String,
    pub evaluation: Option<String>,
    pub memory: Option<String>,
    pub next_goal: Option<String>,
    /// Outcomes in execution order; shorter than the issued batch when the
    /// loop dropped trailing intents after a failure or a page change.
    pub outcomes: Vec<IntentOutcome>,
    /// Step-level failure outside any single intent (engine error, rejected
    /// batch, lost session). Feeds back to the engine so it can adapt.
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn failed_outcome(&self) -> Option<&IntentOutcome> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.result.is_failure())
    }
}

/// Render the most recent `window` records as numbered step blocks.
///
/// Pure string assembly; the engine sees exactly this text.
pub fn render_history(records: &[StepRecord], window: usize) -> String {
    let start = records.len().saturating_sub(window);
    let mut out = String::new();
    for record in &records[start..] {
        out.push_str(&format!("<step_{}>\n", record.step));
        if let Some(evaluation) = &record.evaluation {
            out.push_str(&format!("Evaluation of Previous Step: {evaluation}\n"));
        }
        if let Some(memory) = &record.memory {
            out.push_str(&format!("Memory: {memory}\n"));
        }
        if let Some(goal) = &record.next_goal {
            out.push_str(&format!("Next Goal: {goal}\n"));
        }
        if !record.outcomes.is_empty() {
            let rendered: Vec<String> = record
                .outcomes
                .iter()
                .map(|outcome| {
                    format!(
                        "{} -> {}",
                        outcome.intent.describe(),
                        render_result(&outcome.result)
                    )
                })
                .collect();
            out.push_str(&format!("Action Results: {}\n", rendered.join("; ")));
        }
        if let Some(error) = &record.error {
            out.push_str(&format!("Error: {error}\n"));
        }
        out.push_str(&format!("</step_{}>\n", record.step));
    }
    out
}

fn render_result(result: &ActionResult) -> String {
    match result.status {
        ActionStatus::Success => "ok".to_string(),
        ActionStatus::Failed => format!("failed: {}", result.message),
        ActionStatus::Uncertain => format!("uncertain: {}", result.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: u32) -> StepRecord {
        StepRecord {
            step,
            url: "https://example.test/".to_string(),
            evaluation: Some(format!("step {step} looked fine")),
            memory: Some("cart has 2 items".to_string()),
            next_goal: Some("open checkout".to_string()),
            outcomes: vec![
                IntentOutcome {
                    intent: ActionIntent::Click { index: 5 },
                    result: ActionResult::ok("clicked element 5 at (10, 10)"),
                },
                IntentOutcome {
                    intent: ActionIntent::Scroll {
                        direction: action_dispatch::ScrollDirection::Down,
                    },
                    result: ActionResult::failed("scroll raised"),
                },
            ],
            error: None,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn blocks_carry_evaluation_memory_goal_and_results() {
        let rendered = render_history(&[record(3)], 5);
        assert!(rendered.starts_with("<step_3>\n"));
        assert!(rendered.contains("Evaluation of Previous Step: step 3 looked fine\n"));
        assert!(rendered.contains("Memory: cart has 2 items\n"));
        assert!(rendered.contains("Next Goal: open checkout\n"));
        assert!(rendered
            .contains("Action Results: click #5 -> ok; scroll down -> failed: scroll raised\n"));
        assert!(rendered.ends_with("</step_3>\n"));
    }

    #[test]
    fn window_keeps_only_the_most_recent_records() {
        let records: Vec<StepRecord> = (1..=7).map(record).collect();
        let rendered = render_history(&records, 5);
        assert!(!rendered.contains("<step_1>"));
        assert!(!rendered.contains("<step_2>"));
        assert!(rendered.contains("<step_3>"));
        assert!(rendered.contains("<step_7>"));
    }

    #[test]
    fn step_errors_render_for_the_engine() {
        let mut failed = record(1);
        failed.outcomes.clear();
        failed.error = Some("batch rejected: empty intent batch".to_string());
        let rendered = render_history(&[failed], 5);
        assert!(rendered.contains("Error: batch rejected: empty intent batch\n"));
        assert!(!rendered.contains("Action Results:"));
    }
}
