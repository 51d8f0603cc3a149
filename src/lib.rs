//! Wiring for the `helmsman` binary.
//!
//! Everything substantive lives in the workspace crates; this crate only
//! loads configuration, replays scripted plans as a decision engine, logs
//! step progress, and assembles the components for one run.

pub mod app;
pub mod config;
pub mod engine;
pub mod observer;
