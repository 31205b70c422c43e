/// Classified termination of a reverse connection, consumed by the
/// supervisor to decide the next step.
///
/// One constructor per outcome; the combination "fatal and refresh" is
/// unrepresentable.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    /// Unrecoverable. The supervisor propagates this and exits.
    #[error("Reverse: fatal: {0}")]
    Fatal(String),

    /// The broker set for this check looks stale. The supervisor discards
    /// the current configurations and reloads from the management API
    /// before the next dial.
    #[error("Reverse: check configuration stale: {0}")]
    RefreshCheck(String),

    /// Transient. The connection has already consumed its own backoff; the
    /// supervisor reconnects immediately.
    #[error("Reverse: retryable: {0}")]
    Retry(String),
}

impl OpError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, OpError::Fatal(_))
    }

    pub fn wants_refresh(&self) -> bool {
        matches!(self, OpError::RefreshCheck(_))
    }
}
