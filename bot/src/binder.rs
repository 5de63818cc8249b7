//! Binds a real sessionID to a freshly-started managed instance once it reports
//! `instance:ready`, replacing whatever placeholder the topic mapping held
//! (spec.md §4.6 "SessionID binding (subtlety)").
//!
//! The supervisor deliberately never binds a session itself — the first session an agent
//! lists after boot may belong to the wrong directory if the process was reused. Binding is
//! the job of this single subscriber, which lists sessions, matches by `directory`, and
//! creates one if nothing matches.

use std::sync::Arc;

use agent_client::{AgentClient, CreateSessionOptions};
use orchestrator::InstanceEvent;
use store::TopicEventType;
use tracing::{error, warn};

use crate::app_state::AppState;

pub fn spawn(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut events = state.orchestrator.subscribe().await;
        while let Some(event) = events.recv().await {
            if let InstanceEvent::Ready { instance_id, topic_id, port, .. } = event {
                if let Err(e) = bind(&state, &instance_id, topic_id, port).await {
                    error!(instance_id, topic_id, error = %e, "session binding failed");
                }
            }
        }
    });
}

async fn bind(state: &Arc<AppState>, instance_id: &str, topic_id: i64, port: u16) -> anyhow::Result<()> {
    let Some(info) = state.orchestrator.get_by_topic(topic_id).await else {
        return Ok(());
    };
    let client = AgentClient::new(format!("http://127.0.0.1:{port}"))?;
    let sessions = client.list_sessions().await?;
    let session_id = match sessions.into_iter().find(|s| s.directory == info.work_dir) {
        Some(s) => s.id,
        None => {
            client
                .create_session(CreateSessionOptions { title: Some(info.work_dir.clone()) })
                .await?
                .id
        }
    };

    let chat_id = state.config.chat_id;
    let Some(mapping) = state.topic_store.get_mapping(chat_id, topic_id)? else {
        return Ok(());
    };

    if mapping.is_placeholder_session() {
        state.topic_store.update_session_id(chat_id, topic_id, &session_id)?;
        state.bridge.unregister_session(&mapping.session_id).await;
        state
            .bridge
            .register_session(session_id.clone(), chat_id, topic_id, mapping.streaming_enabled)
            .await;
        state
            .topic_store
            .append_event(chat_id, topic_id, TopicEventType::Linked, None, None)?;
    } else if mapping.session_id != session_id {
        warn!(instance_id, topic_id, "instance reported a different session than the mapping holds");
    }

    let client = Arc::new(client);
    let consumer = state.spawn_consumer(session_id.clone(), client.clone());
    if let Some(previous) = state.managed.lock().await.insert(
        topic_id,
        crate::app_state::ManagedSession { session_id, client, consumer },
    ) {
        previous.consumer.abort();
    }
    Ok(())
}
