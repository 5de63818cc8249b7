//! Row types shared by `instance_store` and `topic_store` (spec.md §3).

use serde::{Deserialize, Serialize};

/// Instance lifecycle state (spec.md §3 state set). Legal transitions are enforced by
/// `orchestrator`, not by the store — the store is a dumb durable record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Failed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Crashed => "crashed",
            InstanceState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for InstanceState {
    type Err = crate::error::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "starting" => InstanceState::Starting,
            "running" => InstanceState::Running,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            "crashed" => InstanceState::Crashed,
            "failed" => InstanceState::Failed,
            other => {
                return Err(crate::error::StoreError::Storage(format!(
                    "unknown instance state: {other}"
                )))
            }
        })
    }
}

/// `instances` table row (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub topic_id: i64,
    pub port: u16,
    pub work_dir: String,
    pub name: Option<String>,
    pub session_id: Option<String>,
    pub state: InstanceState,
    pub pid: Option<i32>,
    pub started_at: Option<i64>,
    pub last_activity_at: Option<i64>,
    pub restart_count: i64,
    pub env_json: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// `port_allocations` table row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortAllocation {
    pub port: u16,
    pub instance_id: String,
    pub allocated_at: i64,
}

/// Topic mapping status (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    Active,
    Closed,
    Deleted,
}

impl TopicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicStatus::Active => "active",
            TopicStatus::Closed => "closed",
            TopicStatus::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for TopicStatus {
    type Err = crate::error::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "active" => TopicStatus::Active,
            "closed" => TopicStatus::Closed,
            "deleted" => TopicStatus::Deleted,
            other => {
                return Err(crate::error::StoreError::Storage(format!(
                    "unknown topic status: {other}"
                )))
            }
        })
    }
}

/// `topic_mappings` table row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopicMapping {
    pub chat_id: i64,
    pub topic_id: i64,
    pub topic_name: String,
    pub session_id: String,
    pub work_dir: Option<String>,
    pub streaming_enabled: bool,
    pub status: TopicStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub closed_at: Option<i64>,
    pub creator_user_id: Option<i64>,
    pub icon_color: Option<i32>,
    pub icon_emoji_id: Option<String>,
}

impl TopicMapping {
    /// Placeholder session ids are assigned while a topic is being created but the agent
    /// hasn't reached `instance:ready` yet (spec.md §4.2, §9 "placeholder sessionIDs").
    pub fn is_placeholder_session(&self) -> bool {
        self.session_id.starts_with("pending_")
    }
}

/// `topic_stats` table row.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TopicStats {
    pub chat_id: i64,
    pub topic_id: i64,
    pub message_count: i64,
    pub last_message_at: Option<i64>,
    pub tool_calls: i64,
    pub error_count: i64,
}

/// `topic_events` event kind (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicEventType {
    Created,
    Closed,
    Reopened,
    Renamed,
    Deleted,
    Message,
    Linked,
}

impl TopicEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicEventType::Created => "created",
            TopicEventType::Closed => "closed",
            TopicEventType::Reopened => "reopened",
            TopicEventType::Renamed => "renamed",
            TopicEventType::Deleted => "deleted",
            TopicEventType::Message => "message",
            TopicEventType::Linked => "linked",
        }
    }
}

impl std::str::FromStr for TopicEventType {
    type Err = crate::error::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => TopicEventType::Created,
            "closed" => TopicEventType::Closed,
            "reopened" => TopicEventType::Reopened,
            "renamed" => TopicEventType::Renamed,
            "deleted" => TopicEventType::Deleted,
            "message" => TopicEventType::Message,
            "linked" => TopicEventType::Linked,
            other => {
                return Err(crate::error::StoreError::Storage(format!(
                    "unknown topic event type: {other}"
                )))
            }
        })
    }
}

/// `topic_events` table row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopicEvent {
    pub id: i64,
    pub chat_id: i64,
    pub topic_id: i64,
    pub event_type: TopicEventType,
    pub timestamp: i64,
    pub user_id: Option<i64>,
    pub metadata_json: Option<String>,
}

/// Current Unix-epoch milliseconds. Centralized so stores don't each reimplement it.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
