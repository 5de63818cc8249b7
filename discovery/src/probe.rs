//! Inexpensive liveness probes (spec.md §4.7).

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

pub async fn is_port_alive(port: u16) -> bool {
    let addr = format!("127.0.0.1:{port}");
    matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

pub async fn is_session_alive(port: u16, session_id: &str) -> bool {
    let Ok(client) = agent_client::AgentClient::new(format!("http://127.0.0.1:{port}")) else {
        return false;
    };
    matches!(timeout(PROBE_TIMEOUT, client.get_session(session_id)).await, Ok(Ok(_)))
}
