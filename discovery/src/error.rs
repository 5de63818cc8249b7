#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("agent client: {0}")]
    AgentClient(#[from] agent_client::AgentClientError),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
