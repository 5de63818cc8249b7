//! ControlPlane: chat commands executed in the designated control topic (spec.md §4.8).
//!
//! Each handler returns a single formatted message, sent back into the control topic.

use std::sync::Arc;

use agent_client::AgentClient;
use bridge::MessageOptions;
use discovery::DiscoverOptions;
use orchestrator::GetOrCreateOptions;
use store::{now_ms, TopicEventType, TopicMapping, TopicStatus};

use crate::app_state::{AppState, AttachedSession};

pub async fn handle(state: &Arc<AppState>, text: &str) {
    let reply = dispatch(state, text.trim()).await;
    let opts = MessageOptions { parse_mode_html: true, ..Default::default() };
    let _ = state
        .surface
        .send_message(state.config.chat_id, Some(state.config.control_topic_id), &reply, &opts)
        .await;
}

async fn dispatch(state: &Arc<AppState>, text: &str) -> String {
    let mut parts = text.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or("");
    let arg = parts.next().unwrap_or("").trim();

    match command {
        "/list" => list_sessions(state).await,
        "/status" => status(state).await,
        "/projects" => list_projects(state),
        "/new" => new_project(state, arg).await,
        "/connect" => connect(state, arg).await,
        "/disconnect" => disconnect(state, arg).await,
        "/streaming" => toggle_streaming(state, arg).await,
        "" => "Commands: /list /status /projects /new /connect /disconnect /streaming".to_string(),
        other => format!("unknown command: {other}"),
    }
}

async fn list_sessions(state: &Arc<AppState>) -> String {
    let mut lines = vec!["<b>Active sessions</b>".to_string()];

    if let Ok(mappings) = state.topic_store.list_active() {
        for m in mappings {
            let kind = if state.registrar.is_external_topic(m.topic_id).await {
                "external"
            } else if state.managed.lock().await.contains_key(&m.topic_id) {
                "managed"
            } else if state.discovered.lock().await.contains_key(&m.topic_id) {
                "discovered"
            } else {
                "pending"
            };
            lines.push(format!("#{} {} — {} ({})", m.topic_id, m.topic_name, m.session_id, kind));
        }
    }
    if lines.len() == 1 {
        lines.push("(none)".to_string());
    }
    lines.join("\n")
}

async fn status(state: &Arc<AppState>) -> String {
    let managed_running = state.orchestrator.get_running_count().await;
    let external = state.registrar.health().await.external_instances;
    let discovered = state.discovered.lock().await.len();
    let pool = state.orchestrator.port_pool_status().await;
    format!(
        "<b>Status</b>\nmanaged running: {managed_running}\nexternal: {external}\ndiscovered: {discovered}\nports in use: {}/{}",
        pool.allocated, pool.total
    )
}

fn list_projects(state: &Arc<AppState>) -> String {
    let entries = std::fs::read_dir(&state.config.project_base_dir);
    let Ok(entries) = entries else {
        return format!("could not read {}", state.config.project_base_dir);
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    if names.is_empty() {
        return "(no managed projects)".to_string();
    }
    format!("<b>Managed projects</b>\n{}", names.join("\n"))
}

async fn new_project(state: &Arc<AppState>, arg: &str) -> String {
    if arg.is_empty() {
        return "usage: /new <project-path> [name]".to_string();
    }
    let mut parts = arg.splitn(2, char::is_whitespace);
    let path = parts.next().unwrap_or("").to_string();
    let name = parts
        .next()
        .map(str::to_string)
        .unwrap_or_else(|| std::path::Path::new(&path).file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| path.clone()));

    let chat_id = state.config.chat_id;
    let topic_id = match state.surface.create_forum_topic(chat_id, &name).await {
        Ok(id) => id,
        Err(e) => return format!("failed to create topic: {e}"),
    };

    let now = now_ms();
    let mapping = TopicMapping {
        chat_id,
        topic_id,
        topic_name: name.clone(),
        session_id: format!("pending_{topic_id}"),
        work_dir: Some(path.clone()),
        streaming_enabled: false,
        status: TopicStatus::Active,
        created_at: now,
        updated_at: now,
        closed_at: None,
        creator_user_id: None,
        icon_color: None,
        icon_emoji_id: None,
    };
    if let Err(e) = state.topic_store.create_mapping(&mapping) {
        return format!("failed to persist mapping: {e}");
    }
    let _ = state.topic_store.append_event(chat_id, topic_id, TopicEventType::Created, None, None);

    let options = GetOrCreateOptions { name: Some(name.clone()), ..Default::default() };
    if let Err(e) = state.orchestrator.get_or_create(topic_id, path, options).await {
        return format!("topic #{topic_id} created but instance failed to start: {e}");
    }
    format!("created <b>{name}</b> as topic #{topic_id}; starting instance…")
}

async fn connect(state: &Arc<AppState>, query: &str) -> String {
    if query.is_empty() {
        return "usage: /connect <name-or-prefix-or-workdir>".to_string();
    }
    let sessions = discovery::discover_sessions(state.scanner.as_ref(), &state.config.agent_binary, DiscoverOptions { only_active: true }).await;
    let query_lower = query.to_lowercase();
    let candidate = sessions.into_iter().find(|s| {
        s.work_dir.as_deref().unwrap_or("").to_lowercase().contains(&query_lower)
            || s.session.title.as_deref().unwrap_or("").to_lowercase().contains(&query_lower)
    });
    let Some(candidate) = candidate else {
        return format!("no discoverable session matches '{query}'");
    };
    let Some(port) = candidate.port else {
        return "matched session has no known port".to_string();
    };
    let Some(work_dir) = candidate.work_dir.clone() else {
        return "matched session has no known workDir".to_string();
    };
    if let Ok(Some(_)) = state.topic_store.get_by_session(&candidate.session.id) {
        return format!("session {} is already bound to a topic", candidate.session.id);
    }

    let chat_id = state.config.chat_id;
    let name = std::path::Path::new(&work_dir).file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| work_dir.clone());
    let topic_id = match state.surface.create_forum_topic(chat_id, &name).await {
        Ok(id) => id,
        Err(e) => return format!("failed to create topic: {e}"),
    };

    let now = now_ms();
    let mapping = TopicMapping {
        chat_id,
        topic_id,
        topic_name: name.clone(),
        session_id: candidate.session.id.clone(),
        work_dir: Some(work_dir.clone()),
        streaming_enabled: false,
        status: TopicStatus::Active,
        created_at: now,
        updated_at: now,
        closed_at: None,
        creator_user_id: None,
        icon_color: None,
        icon_emoji_id: None,
    };
    if let Err(e) = state.topic_store.create_mapping(&mapping) {
        return format!("failed to persist mapping: {e}");
    }

    let client = match AgentClient::new(format!("http://127.0.0.1:{port}")) {
        Ok(c) => Arc::new(c),
        Err(e) => return format!("failed to build agent client: {e}"),
    };
    state.bridge.register_session(candidate.session.id.clone(), chat_id, topic_id, false).await;
    let consumer = state.spawn_consumer(candidate.session.id.clone(), client.clone());
    state.discovered.lock().await.insert(
        topic_id,
        AttachedSession {
            session_id: candidate.session.id.clone(),
            pid: candidate.pid,
            port,
            work_dir,
            client,
            consumer,
        },
    );
    format!("connected <b>{name}</b> as topic #{topic_id}")
}

async fn disconnect(state: &Arc<AppState>, query: &str) -> String {
    let Some(mapping) = find_mapping(state, query).await else {
        return format!("no active topic matches '{query}'");
    };
    let chat_id = state.config.chat_id;
    let topic_id = mapping.topic_id;

    if let Some(handle) = state.discovered.lock().await.remove(&topic_id) {
        handle.consumer.abort();
    }
    if let Some(handle) = state.managed.lock().await.remove(&topic_id) {
        handle.consumer.abort();
    }
    state.bridge.unregister_session(&mapping.session_id).await;
    let _ = state.topic_store.update_status(chat_id, topic_id, TopicStatus::Closed);
    let _ = state.topic_store.append_event(chat_id, topic_id, TopicEventType::Closed, None, None);
    let _ = state.surface.delete_forum_topic(chat_id, topic_id).await;

    format!("disconnected <b>{}</b> (topic #{topic_id})", mapping.topic_name)
}

async fn toggle_streaming(state: &Arc<AppState>, arg: &str) -> String {
    let mut parts = arg.splitn(2, char::is_whitespace);
    let query = parts.next().unwrap_or("");
    let mode = parts.next().unwrap_or("").trim();
    let Some(mapping) = find_mapping(state, query).await else {
        return format!("no active topic matches '{query}'");
    };
    let enabled = match mode {
        "on" => true,
        "off" => false,
        _ => !mapping.streaming_enabled,
    };
    if let Err(e) = state.topic_store.update_streaming_enabled(mapping.chat_id, mapping.topic_id, enabled) {
        return format!("failed to update: {e}");
    }
    format!("streaming for <b>{}</b> is now {}", mapping.topic_name, if enabled { "on" } else { "off" })
}

async fn find_mapping(state: &Arc<AppState>, query: &str) -> Option<TopicMapping> {
    if query.is_empty() {
        return None;
    }
    let query_lower = query.to_lowercase();
    let mappings = state.topic_store.list_active().ok()?;
    mappings.into_iter().find(|m| {
        m.topic_name.to_lowercase().contains(&query_lower)
            || m.work_dir.as_deref().unwrap_or("").to_lowercase().contains(&query_lower)
    })
}
