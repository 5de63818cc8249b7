//! Error kinds for `AgentClient` (spec.md §4.4, §7).

#[derive(Debug, thiserror::Error)]
pub enum AgentClientError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("not found")]
    NotFound,
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("subscription cancelled")]
    Cancelled,
}

impl AgentClientError {
    /// 404 and 4xx-parse conditions are not retried (spec.md §4.4).
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AgentClientError::NotFound | AgentClientError::Http { status: 400..=499, .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentClientError>;
