//! Wire types for the agent's HTTP API (spec.md §6 "Agent HTTP (consumed)").

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One of the agent's conversational sessions, as returned by `GET /session`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub directory: String,
    #[serde(default, rename = "projectID")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub time: Option<SessionTime>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionTime {
    pub updated: i64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CreateSessionOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SendOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Outcome of a permission prompt (spec.md §4.5, §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionResponse {
    Once,
    Always,
    Reject,
}

impl PermissionResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionResponse::Once => "once",
            PermissionResponse::Always => "always",
            PermissionResponse::Reject => "reject",
        }
    }
}

#[derive(Serialize)]
pub(crate) struct PermissionResponseBody<'a> {
    pub response: &'a str,
}

#[derive(Serialize)]
pub(crate) struct SendAsyncBody<'a> {
    pub text: &'a str,
    #[serde(flatten)]
    pub opts: SendOptions,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    #[serde(default)]
    pub version: Option<String>,
}

/// A parsed SSE event from `/event`: `type` (from the `event:` field or the payload's own
/// `type` key) and `properties` (the payload's `properties` field, or the whole payload if
/// it has none) — spec.md §4.4.
#[derive(Clone, Debug)]
pub struct AgentEvent {
    pub event_type: String,
    pub properties: Value,
}

impl AgentEvent {
    /// `sessionID` may live at several places in the payload depending on event type
    /// (spec.md §4.5 "keyed by sessionID extracted from multiple possible locations").
    pub fn session_id(&self) -> Option<&str> {
        self.properties
            .get("sessionID")
            .or_else(|| self.properties.get("sessionId"))
            .or_else(|| self.properties.get("session_id"))
            .or_else(|| {
                self.properties
                    .get("info")
                    .and_then(|v| v.get("sessionID"))
            })
            .or_else(|| {
                self.properties
                    .get("part")
                    .and_then(|v| v.get("sessionID"))
            })
            .and_then(|v| v.as_str())
    }
}
