#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no instance for topic {0}")]
    NotFound(i64),
    #[error("port pool exhausted")]
    PortExhausted,
    #[error("port {0} already allocated")]
    PortConflict(u16),
    #[error("port {0} out of range")]
    PortOutOfRange(u16),
    #[error("startup timed out after {0:?}")]
    StartupTimeout(std::time::Duration),
    #[error("agent exited during startup with status {0:?}")]
    ExitedDuringStartup(Option<i32>),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("store: {0}")]
    Store(#[from] store::StoreError),
    #[error("agent client: {0}")]
    AgentClient(#[from] agent_client::AgentClientError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
