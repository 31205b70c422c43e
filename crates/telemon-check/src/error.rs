/// Errors surfaced by check/broker resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// No broker currently owns the check. Transient: the supervisor reacts
    /// by refreshing the check bundle, not by aborting.
    #[error("Resolver: no broker currently owns check {check_uuid}")]
    NoOwnerFound { check_uuid: String },

    /// The bundle has not been loaded yet.
    #[error("Resolver: check bundle not loaded")]
    NotLoaded,

    /// An HTTP request to the management API failed outright.
    #[error("Resolver: management API request failed: {0}")]
    Api(#[from] reqwest::Error),

    /// The management API answered with a non-success status.
    #[error("Resolver: management API returned {status} for {path}")]
    ApiStatus { status: u16, path: String },

    /// A broker record in the bundle could not be used.
    #[error("Resolver: invalid broker record: {0}")]
    InvalidBroker(String),

    /// Building TLS client material from configured CA input failed.
    #[error("Resolver: TLS configuration: {0}")]
    Tls(String),

    /// JSON body from the management API did not match the expected shape.
    #[error("Resolver: JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ResolverError {
    /// True for the no-owner outcome, which the supervisor treats as a
    /// refresh hint rather than an error.
    pub fn is_no_owner(&self) -> bool {
        matches!(self, ResolverError::NoOwnerFound { .. })
    }
}

/// Convenience `Result` alias for resolver operations.
pub type Result<T> = std::result::Result<T, ResolverError>;
