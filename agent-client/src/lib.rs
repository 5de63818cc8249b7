//! HTTP + SSE client to a single attached agent endpoint (spec.md §4.4, §6).

mod client;
mod error;
mod retry;
mod sse;
mod types;

pub use client::{AgentClient, Subscription};
pub use error::{AgentClientError, Result};
pub use types::{
    AgentEvent, CreateSessionOptions, HealthResponse, PermissionResponse, SendOptions, Session,
    SessionTime,
};
