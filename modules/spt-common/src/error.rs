/// Result type alias for on-demand metric operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed request: {0}")]
    ClientInput(String),

    #[error("Unknown study: {0}")]
    UnknownStudy(String),

    #[error("Unknown channel \"{channel}\" in study {study}")]
    UnknownChannel { study: String, channel: String },

    #[error("Request exceeds the {limit} byte limit")]
    RequestTooLarge { limit: usize },

    #[error("Metrics service error: {0}")]
    Remote(String),

    #[error("Corrupt expression data: {0}")]
    Corrupt(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Errors caused by the caller's request. These are reported back over
    /// the wire verbatim and never mutate the database.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::ClientInput(_)
                | Error::UnknownStudy(_)
                | Error::UnknownChannel { .. }
                | Error::RequestTooLarge { .. }
        )
    }

    /// Connection-level failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Protocol(_)
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    pub fn client(message: impl Into<String>) -> Self {
        Error::ClientInput(message.into())
    }
}
