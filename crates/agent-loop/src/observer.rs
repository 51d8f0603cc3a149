use async_trait::async_trait;

use dom_perceiver::BrowserStateSnapshot;

use crate::history::StepRecord;

/// Read-only hook invoked after each StepRecord is appended, with the
/// snapshot that step acted on. Persistence and export live behind this
/// seam; the loop makes no assumption about what observers do.
#[async_trait]
pub trait StepObserver: Send + Sync {
    async fn on_step(&self, record: &StepRecord, snapshot: &BrowserStateSnapshot);
}

/// Default observer: does nothing.
pub struct NoopObserver;

#[async_trait]
impl StepObserver for NoopObserver {
    async fn on_step(&self, _record: &StepRecord, _snapshot: &BrowserStateSnapshot) {}
}
