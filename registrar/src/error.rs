#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("already registered: {0}")]
    AlreadyRegistered(String),
    #[error("not registered: {0}")]
    NotRegistered(String),
    #[error("agent unhealthy at port {0}")]
    AgentUnhealthy(u16),
    #[error("store: {0}")]
    Store(#[from] store::StoreError),
    #[error("agent client: {0}")]
    AgentClient(#[from] agent_client::AgentClientError),
    #[error("surface: {0}")]
    Surface(String),
}

pub type Result<T> = std::result::Result<T, RegistrarError>;
