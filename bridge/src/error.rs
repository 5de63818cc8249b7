#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("no streaming state for session {0}")]
    NoState(String),
    #[error("surface: {0}")]
    Surface(String),
    #[error("rate limited, retry after {0:?}")]
    RateLimited(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
