//! `Registrar`: onboards and offboards externally-started agents (spec.md §4.9).

use std::collections::HashMap;
use std::sync::Arc;

use agent_client::AgentClient;
use bridge::{ChatSurface, MessageOptions, StreamingBridge};
use store::{now_ms, TopicEventType, TopicMapping, TopicStatus, TopicStore};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{RegistrarError, Result};
use crate::types::{HealthResponse, InstanceSummary, InstancesResponse, RegisterRequest, RegisterResponse, StatusResponse, UnregisterRequest};

#[derive(Debug, Clone)]
struct RegisteredExternal {
    project_path: String,
    project_name: String,
    session_id: String,
    chat_id: i64,
    topic_id: i64,
    port: u16,
    registered_at: i64,
    last_activity_at: i64,
}

struct ExternalHandle {
    info: RegisteredExternal,
    client: Arc<AgentClient>,
    consumer: JoinHandle<()>,
}

/// Owns the set of externally-registered agents, the chat surface used to manage their
/// forum topics, and the bridge they feed events into.
pub struct Registrar<S: ChatSurface + 'static> {
    store: Arc<TopicStore>,
    bridge: Arc<StreamingBridge<S>>,
    surface: Arc<S>,
    chat_id: i64,
    pub(crate) api_key: Option<String>,
    externals: Mutex<HashMap<String, ExternalHandle>>,
}

impl<S: ChatSurface + 'static> Registrar<S> {
    pub fn new(store: Arc<TopicStore>, bridge: Arc<StreamingBridge<S>>, surface: Arc<S>, chat_id: i64, api_key: Option<String>) -> Self {
        Self { store, bridge, surface, chat_id, api_key, externals: Mutex::new(HashMap::new()) }
    }

    pub async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse> {
        let mut externals = self.externals.lock().await;
        if externals.contains_key(&req.project_path) {
            return Err(RegistrarError::AlreadyRegistered(req.project_path));
        }

        let client = AgentClient::new(format!("http://127.0.0.1:{}", req.opencode_port))?;
        match client.health().await {
            Ok(h) if h.healthy => {}
            _ => return Err(RegistrarError::AgentUnhealthy(req.opencode_port)),
        }

        let topic_id = self
            .surface
            .create_forum_topic(self.chat_id, &req.project_name)
            .await
            .map_err(|e| RegistrarError::Surface(e.to_string()))?;

        let now = now_ms();
        let mapping = TopicMapping {
            chat_id: self.chat_id,
            topic_id,
            topic_name: req.project_name.clone(),
            session_id: req.session_id.clone(),
            work_dir: Some(req.project_path.clone()),
            streaming_enabled: req.enable_streaming.unwrap_or(false),
            status: TopicStatus::Active,
            created_at: now,
            updated_at: now,
            closed_at: None,
            creator_user_id: None,
            icon_color: None,
            icon_emoji_id: None,
        };
        self.store.create_mapping(&mapping)?;
        self.store.append_event(self.chat_id, topic_id, TopicEventType::Created, None, None)?;

        self.bridge
            .register_session(req.session_id.clone(), self.chat_id, topic_id, mapping.streaming_enabled)
            .await;

        let client = Arc::new(client);
        let sub = client.subscribe();
        let bridge = self.bridge.clone();
        let session_id_for_task = req.session_id.clone();
        let consumer = tokio::spawn(async move {
            let mut events = sub.events;
            while let Some(event) = events.recv().await {
                match event {
                    Ok(event) => {
                        if let Err(e) = bridge.dispatch(event).await {
                            warn!(session_id = %session_id_for_task, error = %e, "bridge dispatch failed");
                        }
                    }
                    Err(e) => {
                        warn!(session_id = %session_id_for_task, error = %e, "external agent event stream error");
                    }
                }
            }
        });

        let welcome = format!("🔌 Connected external agent for <b>{}</b>", req.project_name);
        let opts = MessageOptions { parse_mode_html: true, ..Default::default() };
        let _ = self.surface.send_message(self.chat_id, Some(topic_id), &welcome, &opts).await;

        let topic_url = self.surface.topic_url(self.chat_id, topic_id);
        externals.insert(
            req.project_path.clone(),
            ExternalHandle {
                info: RegisteredExternal {
                    project_path: req.project_path,
                    project_name: req.project_name,
                    session_id: req.session_id,
                    chat_id: self.chat_id,
                    topic_id,
                    port: req.opencode_port,
                    registered_at: now,
                    last_activity_at: now,
                },
                client,
                consumer,
            },
        );

        info!(topic_id, "registered external agent");
        Ok(RegisterResponse::Ok { success: true, topic_id, topic_url })
    }

    pub async fn unregister(&self, req: UnregisterRequest) -> Result<()> {
        let mut externals = self.externals.lock().await;
        let Some(handle) = externals.remove(&req.project_path) else {
            return Err(RegistrarError::NotRegistered(req.project_path));
        };

        // Dropping the join handle's task tears down the subscription's receiver, which in
        // turn makes the producer task's sends fail and it exits (spec.md §5 "closing a
        // session... cancels deterministically").
        handle.consumer.abort();
        self.bridge.unregister_session(&handle.info.session_id).await;
        self.store.update_status(handle.info.chat_id, handle.info.topic_id, TopicStatus::Closed)?;
        self.store
            .append_event(handle.info.chat_id, handle.info.topic_id, TopicEventType::Closed, None, None)?;

        let goodbye = format!("👋 Disconnected external agent for <b>{}</b>", handle.info.project_name);
        let opts = MessageOptions { parse_mode_html: true, ..Default::default() };
        let _ = self.surface.send_message(handle.info.chat_id, Some(handle.info.topic_id), &goodbye, &opts).await;

        Ok(())
    }

    /// Looks up the external agent bound to `topic_id`, if any, and forwards `text` to it
    /// (spec.md §4.6 Router step 1: "external" topics bypass the orchestrator entirely).
    pub async fn forward_to_external(&self, topic_id: i64, text: &str) -> Option<Result<()>> {
        let mut externals = self.externals.lock().await;
        let handle = externals.values_mut().find(|h| h.info.topic_id == topic_id)?;
        handle.info.last_activity_at = now_ms();
        let client = handle.client.clone();
        let session_id = handle.info.session_id.clone();
        let text = text.to_string();
        drop(externals);
        Some(
            client
                .send_async(&session_id, &text, Default::default())
                .await
                .map_err(RegistrarError::from),
        )
    }

    /// Whether `topic_id` belongs to an externally-registered agent (spec.md §4.6 step 1).
    pub async fn is_external_topic(&self, topic_id: i64) -> bool {
        let externals = self.externals.lock().await;
        externals.values().any(|h| h.info.topic_id == topic_id)
    }

    /// The agent client for an externally-registered topic, along with its sessionID, if any.
    pub async fn client_for_topic(&self, topic_id: i64) -> Option<(String, Arc<AgentClient>)> {
        let externals = self.externals.lock().await;
        externals
            .values()
            .find(|h| h.info.topic_id == topic_id)
            .map(|h| (h.info.session_id.clone(), h.client.clone()))
    }

    pub async fn status(&self, project_path: &str) -> StatusResponse {
        let externals = self.externals.lock().await;
        match externals.get(project_path) {
            Some(handle) => StatusResponse {
                registered: true,
                project_name: Some(handle.info.project_name.clone()),
                topic_id: Some(handle.info.topic_id),
                topic_url: Some(self.surface.topic_url(handle.info.chat_id, handle.info.topic_id)),
                registered_at: Some(handle.info.registered_at),
                last_activity_at: Some(handle.info.last_activity_at),
            },
            None => StatusResponse::default(),
        }
    }

    pub async fn list_instances(&self) -> InstancesResponse {
        let externals = self.externals.lock().await;
        let instances = externals
            .values()
            .map(|handle| InstanceSummary {
                project_path: handle.info.project_path.clone(),
                project_name: handle.info.project_name.clone(),
                session_id: handle.info.session_id.clone(),
                topic_id: handle.info.topic_id,
                chat_id: handle.info.chat_id,
                registered_at: handle.info.registered_at,
                last_activity_at: handle.info.last_activity_at,
            })
            .collect();
        InstancesResponse { instances }
    }

    pub async fn health(&self) -> HealthResponse {
        let externals = self.externals.lock().await;
        HealthResponse { status: "ok", external_instances: externals.len(), timestamp: now_ms() }
    }
}
