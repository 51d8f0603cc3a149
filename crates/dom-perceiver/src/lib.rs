//! Browser state perception: structural snapshot, accessibility tree and
//! layout metrics unified into an indexed element tree.
//!
//! One [`Perceiver::extract`] pass issues the three protocol queries
//! concurrently, joins them by backend node id, classifies interactivity
//! and visibility, and hands back an immutable [`BrowserStateSnapshot`]
//! whose indexed nodes each carry a ranked [`SelectorSet`] for the
//! dispatcher's fallback chain.

mod error;
mod extract;
mod merge;
mod model;
mod selectors;
mod serialize;

pub use error::PerceiveError;
pub use extract::{DomPerceiver, Perceiver, PerceiverConfig};
pub use model::{
    BBox, BrowserStateSnapshot, ElementNode, IndexedNode, ScrollPosition, ViewportSize,
};
pub use selectors::{build_selector_set, Selector, SelectorSet};
