//! Shared state tying the orchestrator, both stores, the bridge, discovery, and the
//! registration API together behind the concrete Telegram surface (spec.md §2, §5).

use std::collections::HashMap;
use std::sync::Arc;

use agent_client::AgentClient;
use bridge::StreamingBridge;
use discovery::{LocalProcessScanner, SysinfoScanner};
use orchestrator::OrchestratorManager;
use registrar::Registrar;
use store::TopicStore;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::surface::TelegramSurface;

/// A session the router has attached to outside the orchestrator's own spawn path: either
/// discovered at a TUI process or reconnected to after that process restarted
/// (spec.md §4.6 steps 2-3, §4.7).
pub struct AttachedSession {
    pub session_id: String,
    pub pid: i32,
    pub port: u16,
    pub work_dir: String,
    pub client: Arc<AgentClient>,
    pub consumer: JoinHandle<()>,
}

/// A session bound to a managed (orchestrator-spawned) instance, populated by the
/// `instance:ready` binder once the real sessionID is known (spec.md §4.6 subtlety).
pub struct ManagedSession {
    pub session_id: String,
    pub client: Arc<AgentClient>,
    pub consumer: JoinHandle<()>,
}

pub struct AppState {
    pub config: AppConfig,
    pub orchestrator: OrchestratorManager,
    pub topic_store: Arc<TopicStore>,
    pub bridge: Arc<StreamingBridge<TelegramSurface>>,
    pub surface: Arc<TelegramSurface>,
    pub registrar: Arc<Registrar<TelegramSurface>>,
    pub scanner: Arc<dyn LocalProcessScanner>,
    /// `topicID -> discovered/reconnected session`, consulted before falling back to the
    /// orchestrator (spec.md §4.6 steps 2-3).
    pub discovered: Mutex<HashMap<i64, AttachedSession>>,
    /// `topicID -> managed session`, populated once the binder resolves a real sessionID
    /// for an orchestrator-spawned instance (spec.md §4.6 step 4-5).
    pub managed: Mutex<HashMap<i64, ManagedSession>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        orchestrator: OrchestratorManager,
        topic_store: Arc<TopicStore>,
        bridge: Arc<StreamingBridge<TelegramSurface>>,
        surface: Arc<TelegramSurface>,
        registrar: Arc<Registrar<TelegramSurface>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            orchestrator,
            topic_store,
            bridge,
            surface,
            registrar,
            scanner: Arc::new(SysinfoScanner),
            discovered: Mutex::new(HashMap::new()),
            managed: Mutex::new(HashMap::new()),
        })
    }

    /// Locates the agent client and sessionID serving `topic_id`, across all three places a
    /// session can live: an externally-registered agent, an orchestrator-managed instance, or
    /// a discovered/reconnected local TUI (spec.md §4.5 permission responses need this same
    /// lookup the router performs per-message).
    pub async fn client_for_topic(&self, topic_id: i64) -> Option<(String, Arc<AgentClient>)> {
        if let Some(found) = self.registrar.client_for_topic(topic_id).await {
            return Some(found);
        }
        if let Some(entry) = self.managed.lock().await.get(&topic_id) {
            return Some((entry.session_id.clone(), entry.client.clone()));
        }
        if let Some(entry) = self.discovered.lock().await.get(&topic_id) {
            return Some((entry.session_id.clone(), entry.client.clone()));
        }
        None
    }

    /// Subscribes the bridge to `client`'s event stream and spawns the consumer task that
    /// drives it, returning its handle so the caller can abort it on teardown
    /// (grounded on `registrar::service::register`'s identical pattern).
    pub fn spawn_consumer(&self, session_id: String, client: Arc<AgentClient>) -> JoinHandle<()> {
        let sub = client.subscribe();
        let bridge = self.bridge.clone();
        tokio::spawn(async move {
            let mut events = sub.events;
            while let Some(event) = events.recv().await {
                match event {
                    Ok(event) => {
                        if let Err(e) = bridge.dispatch(event).await {
                            tracing::warn!(session_id = %session_id, error = %e, "bridge dispatch failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "agent event stream error");
                    }
                }
            }
        })
    }
}
