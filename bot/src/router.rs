//! The single entry point for an inbound chat message (spec.md §4.6).
//!
//! Precedence: external registration, then an already-discovered/reconnected session, then
//! a not-yet-attached local TUI in the same `workDir`, then the orchestrator's own managed
//! instance. Every branch marks the text as having come from the surface before forwarding,
//! so the bridge's echo-suppression set (populated via `suppress_next_echo`) swallows the
//! agent's own echo of the same text instead of re-posting it.

use std::sync::Arc;
use std::time::Duration;

use agent_client::AgentClient;
use bridge::MessageOptions;
use orchestrator::{instance_id_for_topic, GetOrCreateOptions};
use tracing::warn;

use crate::app_state::{AppState, AttachedSession};

const MANAGED_READY_TIMEOUT: Duration = Duration::from_secs(30);
const MANAGED_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub async fn route_message(state: &Arc<AppState>, topic_id: i64, text: &str) {
    let chat_id = state.config.chat_id;

    // 1. External registration owns this topic outright.
    if let Some(result) = state.registrar.forward_to_external(topic_id, text).await {
        if let Err(e) = result {
            notify(state, topic_id, &format!("⚠️ failed to forward to external agent: {e}")).await;
        }
        return;
    }

    // 2. A session already discovered or reconnected for this topic.
    if let Some(handled) = try_discovered(state, topic_id, text).await {
        if let Err(e) = handled {
            notify(state, topic_id, &format!("⚠️ {e}")).await;
        }
        return;
    }

    let Ok(mapping) = state.topic_store.get_mapping(chat_id, topic_id) else {
        notify(state, topic_id, "⚠️ internal error reading topic mapping").await;
        return;
    };
    let Some(mapping) = mapping else {
        notify(state, topic_id, "⚠️ this topic isn't bound to a project").await;
        return;
    };
    let Some(work_dir) = mapping.work_dir.clone() else {
        notify(state, topic_id, "⚠️ this topic has no working directory configured").await;
        return;
    };

    // 3. Probe for a local TUI already running in workDir before spawning a new instance.
    if let Some(instance) = find_tui_instance(state, &work_dir).await {
        match attach_discovered(state, topic_id, &work_dir, instance).await {
            Ok(session_id) => forward_via_discovered(state, topic_id, &session_id, text).await,
            Err(e) => notify(state, topic_id, &format!("⚠️ failed to attach to local agent: {e}")).await,
        }
        return;
    }

    // 4. Fall back to the orchestrator's own managed instance.
    let options = GetOrCreateOptions { name: Some(mapping.topic_name.clone()), ..Default::default() };
    if let Err(e) = state.orchestrator.get_or_create(topic_id, work_dir, options).await {
        notify(state, topic_id, &format!("⚠️ failed to start instance: {e}")).await;
        return;
    }

    match wait_for_managed_session(state, topic_id).await {
        Some(session_id) => {
            // 5. Record activity, mark as from-surface, forward.
            state.orchestrator.record_activity(instance_id_for_topic(topic_id)).await;
            let _ = state.topic_store.record_message(chat_id, topic_id);
            forward_via_managed(state, topic_id, &session_id, text).await;
        }
        None => {
            notify(state, topic_id, "⚠️ instance didn't become ready within 30s").await;
        }
    }
}

async fn try_discovered(state: &Arc<AppState>, topic_id: i64, text: &str) -> Option<Result<(), String>> {
    let (session_id, port, work_dir, client) = {
        let discovered = state.discovered.lock().await;
        let entry = discovered.get(&topic_id)?;
        (entry.session_id.clone(), entry.port, entry.work_dir.clone(), entry.client.clone())
    };

    state.bridge.suppress_next_echo(&session_id, text).await;
    if client.send_async(&session_id, text, Default::default()).await.is_ok() {
        return Some(Ok(()));
    }

    // Send failed: the process behind this session may have died. Probe and, if so,
    // reconnect to whatever TUI now owns this workDir (spec.md §4.6 step 2).
    if discovery::is_session_alive(port, &session_id).await {
        return Some(Err("failed to send to attached session".into()));
    }

    if let Some(prev) = state.discovered.lock().await.remove(&topic_id) {
        prev.consumer.abort();
        state.bridge.unregister_session(&prev.session_id).await;
    }

    let Some(instance) = find_tui_instance(state, &work_dir).await else {
        return Some(Err("attached session died and no replacement was found".into()));
    };
    match attach_discovered(state, topic_id, &work_dir, instance).await {
        Ok(new_session_id) => {
            notify(state, topic_id, "🔄 Reconnected").await;
            state.bridge.suppress_next_echo(&new_session_id, text).await;
            match state.discovered.lock().await.get(&topic_id) {
                Some(entry) => Some(
                    entry
                        .client
                        .send_async(&new_session_id, text, Default::default())
                        .await
                        .map_err(|e| e.to_string()),
                ),
                None => Some(Err("reconnect raced with teardown".into())),
            }
        }
        Err(e) => Some(Err(format!("reconnect failed: {e}"))),
    }
}

async fn forward_via_discovered(state: &Arc<AppState>, topic_id: i64, session_id: &str, text: &str) {
    let client = {
        let discovered = state.discovered.lock().await;
        discovered.get(&topic_id).map(|e| e.client.clone())
    };
    if let Some(client) = client {
        state.bridge.suppress_next_echo(session_id, text).await;
        if let Err(e) = client.send_async(session_id, text, Default::default()).await {
            notify(state, topic_id, &format!("⚠️ failed to send: {e}")).await;
        }
    }
}

async fn forward_via_managed(state: &Arc<AppState>, topic_id: i64, session_id: &str, text: &str) {
    let client = {
        let managed = state.managed.lock().await;
        managed.get(&topic_id).map(|e| e.client.clone())
    };
    if let Some(client) = client {
        state.bridge.suppress_next_echo(session_id, text).await;
        if let Err(e) = client.send_async(session_id, text, Default::default()).await {
            notify(state, topic_id, &format!("⚠️ failed to send: {e}")).await;
        }
    }
}

async fn wait_for_managed_session(state: &Arc<AppState>, topic_id: i64) -> Option<String> {
    let deadline = tokio::time::Instant::now() + MANAGED_READY_TIMEOUT;
    loop {
        if let Some(entry) = state.managed.lock().await.get(&topic_id) {
            return Some(entry.session_id.clone());
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(MANAGED_POLL_INTERVAL).await;
    }
}

async fn find_tui_instance(state: &Arc<AppState>, work_dir: &str) -> Option<discovery::DiscoveredInstance> {
    let instances = discovery::discover_instances(state.scanner.as_ref(), &state.config.agent_binary).await;
    instances.into_iter().find(|i| i.is_tui && i.work_dir.as_deref() == Some(work_dir))
}

/// Attaches the bridge to `instance` (a discovered or reconnected local TUI), updating the
/// topic mapping's sessionID and returning the bound sessionID (spec.md §4.6 steps 2-3,
/// shared by the reconnect path).
async fn attach_discovered(
    state: &Arc<AppState>,
    topic_id: i64,
    work_dir: &str,
    instance: discovery::DiscoveredInstance,
) -> Result<String, String> {
    let port = instance.port.ok_or("discovered instance has no known port")?;
    let session = instance
        .sessions
        .into_iter()
        .find(|s| s.directory == work_dir)
        .ok_or("discovered instance has no session for this workDir")?;

    let client = AgentClient::new(format!("http://127.0.0.1:{port}")).map_err(|e| e.to_string())?;
    let chat_id = state.config.chat_id;
    let streaming_enabled = state
        .topic_store
        .get_mapping(chat_id, topic_id)
        .ok()
        .flatten()
        .map(|m| m.streaming_enabled)
        .unwrap_or(false);

    if let Err(e) = state.topic_store.update_session_id(chat_id, topic_id, &session.id) {
        warn!(topic_id, error = %e, "failed to persist discovered sessionID");
    }
    state.bridge.register_session(session.id.clone(), chat_id, topic_id, streaming_enabled).await;

    let client = Arc::new(client);
    let consumer = state.spawn_consumer(session.id.clone(), client.clone());
    let attached = AttachedSession {
        session_id: session.id.clone(),
        pid: instance.pid,
        port,
        work_dir: work_dir.to_string(),
        client,
        consumer,
    };
    if let Some(previous) = state.discovered.lock().await.insert(topic_id, attached) {
        previous.consumer.abort();
    }
    Ok(session.id)
}

async fn notify(state: &Arc<AppState>, topic_id: i64, text: &str) {
    let opts = MessageOptions::default();
    let _ = state.surface.send_message(state.config.chat_id, Some(topic_id), text, &opts).await;
}
