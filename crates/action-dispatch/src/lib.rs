//! Intent validation and execution against a live page.
//!
//! The decision engine emits [`ActionIntent`] values naming elements by
//! snapshot index. [`ActionDispatcher::execute`] re-validates each index
//! against the snapshot that produced it, resolves the element through its
//! ranked selector fallback chain, performs the gesture with real input
//! events, and folds every per-action failure into the returned
//! [`ActionResult`] so the loop can surface it as history rather than
//! aborting the run. Only transport loss escapes as an error.

mod dispatch;
mod input;
mod intent;
mod resolve;
mod result;

pub use dispatch::{ActionDispatcher, DispatchConfig, Dispatcher};
pub use intent::{validate_batch, ActionIntent, BatchError, ScrollDirection};
pub use result::{ActionResult, ActionStatus, FailureKind};
