//! Local HTTP surface letting externally-started agents register themselves into a chat
//! topic without going through the bot's own spawn path (spec.md §4.9).

mod error;
mod http;
mod service;
mod types;

pub use error::{RegistrarError, Result};
pub use http::router;
pub use service::Registrar;
pub use types::{
    HealthResponse, InstanceSummary, InstancesResponse, RegisterRequest, RegisterResponse,
    StatusResponse, UnregisterRequest,
};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge::{ChatSurface, MessageOptions, StreamingBridge, SurfaceResult};
    use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
    use std::sync::Arc;
    use store::TopicStore;

    struct FakeSurface {
        next_message_id: AtomicI32,
        next_topic_id: AtomicI64,
    }

    impl FakeSurface {
        fn new() -> Self {
            Self { next_message_id: AtomicI32::new(1), next_topic_id: AtomicI64::new(100) }
        }
    }

    #[async_trait]
    impl ChatSurface for FakeSurface {
        async fn send_message(&self, _chat_id: i64, _topic_id: Option<i64>, _text: &str, _opts: &MessageOptions) -> SurfaceResult<i32> {
            Ok(self.next_message_id.fetch_add(1, Ordering::SeqCst))
        }
        async fn edit_message_text(&self, _chat_id: i64, _message_id: i32, _text: &str, _opts: &MessageOptions) -> SurfaceResult<()> {
            Ok(())
        }
        async fn delete_message(&self, _chat_id: i64, _message_id: i32) -> SurfaceResult<()> {
            Ok(())
        }
        async fn create_forum_topic(&self, _chat_id: i64, _name: &str) -> SurfaceResult<i64> {
            Ok(self.next_topic_id.fetch_add(1, Ordering::SeqCst))
        }
        async fn delete_forum_topic(&self, _chat_id: i64, _topic_id: i64) -> SurfaceResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn register_without_a_live_agent_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TopicStore::new(dir.path().join("topics.db")).unwrap());
        let surface = Arc::new(FakeSurface::new());
        let bridge = Arc::new(StreamingBridge::new(surface.clone()));
        let registrar = Registrar::new(store, bridge, surface, 1, None);

        let req = RegisterRequest {
            project_path: "/tmp/proj".into(),
            project_name: "proj".into(),
            opencode_port: 1, // nothing listens here
            session_id: "sess-1".into(),
            enable_streaming: None,
        };
        let err = registrar.register(req).await.unwrap_err();
        assert!(matches!(err, RegistrarError::AgentUnhealthy(1)));
    }

    #[tokio::test]
    async fn unregister_unknown_project_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TopicStore::new(dir.path().join("topics.db")).unwrap());
        let surface = Arc::new(FakeSurface::new());
        let bridge = Arc::new(StreamingBridge::new(surface.clone()));
        let registrar = Registrar::new(store, bridge, surface, 1, None);

        let err = registrar.unregister(UnregisterRequest { project_path: "/nope".into() }).await.unwrap_err();
        assert!(matches!(err, RegistrarError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn health_reports_zero_external_instances_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TopicStore::new(dir.path().join("topics.db")).unwrap());
        let surface = Arc::new(FakeSurface::new());
        let bridge = Arc::new(StreamingBridge::new(surface.clone()));
        let registrar = Registrar::new(store, bridge, surface, 1, None);

        let health = registrar.health().await;
        assert_eq!(health.external_instances, 0);
        assert_eq!(health.status, "ok");
    }
}
