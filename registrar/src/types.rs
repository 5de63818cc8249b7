//! JSON bodies for the registration API (spec.md §4.9, §6).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub project_path: String,
    pub project_name: String,
    pub opencode_port: u16,
    pub session_id: String,
    #[serde(default)]
    pub enable_streaming: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged, rename_all = "camelCase")]
pub enum RegisterResponse {
    Ok { success: bool, topic_id: i64, topic_url: String },
    Err { error: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterRequest {
    pub project_path: String,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub project_path: String,
    pub project_name: String,
    pub session_id: String,
    pub topic_id: i64,
    pub chat_id: i64,
    pub registered_at: i64,
    pub last_activity_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstancesResponse {
    pub instances: Vec<InstanceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub external_instances: usize,
    pub timestamp: i64,
}
