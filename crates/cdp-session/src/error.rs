use thiserror::Error;

/// Errors surfaced by the protocol session.
///
/// Only [`SessionError::Transport`] is fatal to a run: the connection is
/// gone and reconnection is a caller concern. Everything else describes one
/// failed command and leaves the session usable.
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    /// Connection-level failure (socket closed, pump dead, launch lost).
    #[error("protocol transport failure: {0}")]
    Transport(String),

    /// A command did not answer within its deadline.
    #[error("command {method} timed out after {timeout_ms}ms")]
    CommandTimeout { method: String, timeout_ms: u64 },

    /// The browser answered with a protocol-level error object.
    #[error("protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// Browser binary missing, failed to spawn, or never exposed an endpoint.
    #[error("browser launch failed: {0}")]
    Launch(String),

    /// Navigation rejected by the browser or no history entry to move to.
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// Script evaluation raised in the page.
    #[error("script exception: {0}")]
    Script(String),

    /// Tab index outside the registry.
    #[error("no tab at index {0}")]
    NoSuchTab(usize),

    /// Closing the only remaining tab is refused.
    #[error("refusing to close the last tab")]
    LastTab,

    #[error("{0}")]
    Internal(String),
}

impl SessionError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// True when the whole run must stop: the connection itself is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }

    /// True when retrying the same command may succeed.
    pub fn retryable(&self) -> bool {
        match self {
            SessionError::CommandTimeout { .. } => true,
            // Server-side protocol errors are transient; client-side are not.
            SessionError::Protocol { code, .. } => *code >= 500,
            _ => false,
        }
    }
}
