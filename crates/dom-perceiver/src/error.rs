use thiserror::Error;

use cdp_session::SessionError;

/// Failure modes of one extraction pass.
#[derive(Debug, Error)]
pub enum PerceiveError {
    /// A protocol query blew its deadline. Retryable by the caller.
    #[error("{query} timed out after {timeout_ms}ms")]
    ExtractionTimeout { query: String, timeout_ms: u64 },

    /// A query failed outright or returned a payload that could not be
    /// decoded. Not retried automatically.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The underlying connection is gone. Fatal to the run.
    #[error(transparent)]
    Transport(SessionError),
}

impl PerceiveError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        PerceiveError::Extraction(detail.into())
    }

    /// Map a session-level failure of one named query.
    pub(crate) fn from_query(query: &str, err: SessionError) -> Self {
        match err {
            SessionError::CommandTimeout { timeout_ms, .. } => PerceiveError::ExtractionTimeout {
                query: query.to_string(),
                timeout_ms,
            },
            err if err.is_fatal() => PerceiveError::Transport(err),
            err => PerceiveError::Extraction(format!("{query}: {err}")),
        }
    }

    /// Whether the caller may retry the pass.
    pub fn retryable(&self) -> bool {
        matches!(self, PerceiveError::ExtractionTimeout { .. })
    }

    /// Whether the run can continue at all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PerceiveError::Transport(_))
    }
}
