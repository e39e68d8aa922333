/// Core error type for the gateway.
///
/// Adapter crates should map their specific errors into this type so callers
/// can tell a caller mistake from a dead connection from a retryable failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("tenant {0} is not connected")]
    NotConnected(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("timed out waiting for an authentication challenge")]
    ChallengeTimeout,

    #[error("timed out waiting for a connection slot")]
    LimiterTimeout,

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
