//! Ephemeral, per-generation streaming state (spec.md §3 "StreamingState").

use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct Tokens {
    pub input: u64,
    pub output: u64,
    pub reasoning: Option<u64>,
    pub cache: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub call_id: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub title: Option<String>,
}

impl ToolCall {
    pub fn is_running(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// One active generation within one session. Destroyed on `session.idle` / `session.error`
/// (spec.md §3).
#[derive(Debug, Clone)]
pub struct StreamingState {
    pub session_id: String,
    pub message_id: Option<String>,
    pub surface_message_id: Option<i32>,
    pub current_text: String,
    pub tools: Vec<ToolCall>,
    pub started_at: Instant,
    pub last_surface_update_at: Instant,
    pub is_processing: bool,
    pub error: Option<String>,
    pub tokens: Tokens,
    pub model: Option<String>,
    /// Guards against concurrent first-send duplication (spec.md §5).
    pub pending_send: bool,
}

impl StreamingState {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            session_id: session_id.into(),
            message_id: None,
            surface_message_id: None,
            current_text: String::new(),
            tools: Vec::new(),
            started_at: now,
            last_surface_update_at: now - std::time::Duration::from_secs(3600),
            is_processing: false,
            error: None,
            tokens: Tokens::default(),
            model: None,
            pending_send: false,
        }
    }

    pub fn running_tools(&self) -> impl Iterator<Item = &ToolCall> {
        self.tools.iter().filter(|t| t.is_running())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_is_immediately_eligible_for_a_refresh() {
        let state = StreamingState::new("s1");
        assert!(state.last_surface_update_at.elapsed() >= std::time::Duration::from_secs(1));
    }

    #[test]
    fn running_tools_excludes_completed() {
        let mut state = StreamingState::new("s1");
        state.tools.push(ToolCall {
            name: "bash".into(),
            call_id: "c1".into(),
            started_at: 0,
            completed_at: None,
            title: None,
        });
        state.tools.push(ToolCall {
            name: "read".into(),
            call_id: "c2".into(),
            started_at: 0,
            completed_at: Some(1),
            title: None,
        });
        assert_eq!(state.running_tools().count(), 1);
    }
}
