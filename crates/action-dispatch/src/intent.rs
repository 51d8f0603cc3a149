//! The closed intent set the decision engine may emit, and batch validation.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directions the `scroll` intent accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    /// `(dx, dy)` for a `window.scrollBy` of `amount` pixels.
    pub fn delta(self, amount: i64) -> (i64, i64) {
        match self {
            ScrollDirection::Up => (0, -amount),
            ScrollDirection::Down => (0, amount),
            ScrollDirection::Left => (-amount, 0),
            ScrollDirection::Right => (amount, 0),
        }
    }
}

impl fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
            ScrollDirection::Left => "left",
            ScrollDirection::Right => "right",
        };
        f.write_str(name)
    }
}

/// One decision-engine command.
///
/// The set is closed: a new capability means a new variant here, not a
/// stringly-typed action name. Element-targeted variants carry the display
/// index from the snapshot the engine saw; the dispatcher validates it
/// against that same snapshot before touching the browser.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionIntent {
    Click { index: u32 },
    TypeText { index: u32, text: String },
    Navigate { url: String },
    Scroll { direction: ScrollDirection },
    Wait { seconds: f64 },
    PressKey { key: String },
    AskHuman { question: String },
    Done { message: String, success: bool },
    GoBack,
    GoForward,
    RefreshPage,
    Hover { index: u32 },
    Focus { index: u32 },
    SelectOption { index: u32, value: String },
    NewTab { url: String },
    SwitchTab { tab_index: usize },
    CloseTab { tab_index: usize },
    GetTabs,
}

impl ActionIntent {
    /// Display index this intent operates on, for element-targeted kinds.
    pub fn target_index(&self) -> Option<u32> {
        match self {
            ActionIntent::Click { index }
            | ActionIntent::TypeText { index, .. }
            | ActionIntent::Hover { index }
            | ActionIntent::Focus { index }
            | ActionIntent::SelectOption { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ActionIntent::Done { .. })
    }

    pub fn is_ask_human(&self) -> bool {
        matches!(self, ActionIntent::AskHuman { .. })
    }

    /// Short human-readable form for logs and history entries.
    pub fn describe(&self) -> String {
        match self {
            ActionIntent::Click { index } => format!("click #{index}"),
            ActionIntent::TypeText { index, text } => {
                format!("type {:?} into #{index}", preview(text))
            }
            ActionIntent::Navigate { url } => format!("navigate to {url}"),
            ActionIntent::Scroll { direction } => format!("scroll {direction}"),
            ActionIntent::Wait { seconds } => format!("wait {seconds}s"),
            ActionIntent::PressKey { key } => format!("press {key}"),
            ActionIntent::AskHuman { question } => format!("ask human: {}", preview(question)),
            ActionIntent::Done { success, .. } => {
                format!("done ({})", if *success { "success" } else { "failure" })
            }
            ActionIntent::GoBack => "go back".to_string(),
            ActionIntent::GoForward => "go forward".to_string(),
            ActionIntent::RefreshPage => "refresh page".to_string(),
            ActionIntent::Hover { index } => format!("hover #{index}"),
            ActionIntent::Focus { index } => format!("focus #{index}"),
            ActionIntent::SelectOption { index, value } => {
                format!("select {:?} in #{index}", preview(value))
            }
            ActionIntent::NewTab { url } => format!("new tab at {url}"),
            ActionIntent::SwitchTab { tab_index } => format!("switch to tab {tab_index}"),
            ActionIntent::CloseTab { tab_index } => format!("close tab {tab_index}"),
            ActionIntent::GetTabs => "list tabs".to_string(),
        }
    }
}

/// First characters of `text`, elided for display.
pub(crate) fn preview(text: &str) -> String {
    const LIMIT: usize = 20;
    if text.chars().count() <= LIMIT {
        text.to_string()
    } else {
        let head: String = text.chars().take(LIMIT).collect();
        format!("{head}...")
    }
}

/// A malformed batch, detected before anything executes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("empty intent batch")]
    Empty,
    #[error("done must be the only intent in its batch")]
    DoneNotAlone,
    /// The first action may mutate the element the second would touch, so a
    /// repeated target is a usage violation, not a sequencing hint.
    #[error("intents {first} and {second} both target index {index}")]
    DuplicateTarget {
        index: u32,
        first: usize,
        second: usize,
    },
}

/// Check a batch against the protocol the decision engine agreed to:
/// non-empty, `done` alone, and no display index targeted twice.
pub fn validate_batch(intents: &[ActionIntent]) -> Result<(), BatchError> {
    if intents.is_empty() {
        return Err(BatchError::Empty);
    }
    if intents.len() > 1 && intents.iter().any(ActionIntent::is_done) {
        return Err(BatchError::DoneNotAlone);
    }
    let mut seen: HashMap<u32, usize> = HashMap::new();
    for (position, intent) in intents.iter().enumerate() {
        if let Some(index) = intent.target_index() {
            if let Some(&first) = seen.get(&index) {
                return Err(BatchError::DuplicateTarget {
                    index,
                    first,
                    second: position,
                });
            }
            seen.insert(index, position);
        }
    }
    Ok(())
}
