use thiserror::Error;

use cdp_session::SessionError;
use dom_perceiver::PerceiveError;

/// Run-fatal failures. Anything recoverable stays inside StepRecords; when
/// one of these surfaces the loop terminates with a definitive outcome.
#[derive(Debug, Error)]
pub enum LoopError {
    /// Extraction could not produce a snapshot, retries included.
    #[error("extraction failed after {attempts} attempt(s): {source}")]
    Extraction {
        attempts: u32,
        source: PerceiveError,
    },

    /// The protocol connection is gone.
    #[error("session lost: {0}")]
    Session(#[from] SessionError),
}
