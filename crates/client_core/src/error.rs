use thiserror::Error;

/// Failure of a single round-trip to the chat server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("server responded with {status}: {message}")]
    ServerError { status: u16, message: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl SyncError {
    /// Transient failures are worth retrying on the next poll.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::NetworkFailure(_) => true,
            SyncError::ServerError { status, .. } => *status >= 500,
            SyncError::MalformedResponse(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("message text is required")]
    EmptyMessage,
    #[error("not logged in")]
    NotLoggedIn,
    #[error(transparent)]
    Sync(#[from] SyncError),
}
