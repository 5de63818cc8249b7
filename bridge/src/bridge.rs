//! Consumes parsed agent events and issues throttled chat-surface updates
//! (spec.md §4.5, §9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_client::AgentEvent;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::caches::{normalize, EchoSuppressionSet, SessionBoundCache};
use crate::error::{BridgeError, Result};
use crate::format::{format_final_text, format_progress_bubble, format_streaming_update};
use crate::permission::{PendingPermission, PendingPermissions};
use crate::state::{StreamingState, ToolCall, Tokens};
use crate::surface::{ChatSurface, InlineKeyboard, MessageOptions, SurfaceError};

const STREAMING_UPDATE_INTERVAL: Duration = Duration::from_millis(3000);
const NON_STREAMING_UPDATE_INTERVAL: Duration = Duration::from_millis(2000);
const RATE_LIMIT_CUSHION: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct SessionBinding {
    pub chat_id: i64,
    pub topic_id: i64,
}

struct Inner<S: ChatSurface> {
    surface: Arc<S>,
    sessions: HashMap<String, SessionBinding>,
    streaming_enabled: HashMap<String, bool>,
    states: HashMap<String, StreamingState>,
    pending_permissions: PendingPermissions,
    message_roles: SessionBoundCache<String>,
    sent_user_messages: SessionBoundCache<()>,
    messages_from_surface: EchoSuppressionSet,
}

/// One bridge instance serves every attached agent; event dispatch is the only mutator of
/// its maps (spec.md §5 "streaming-bridge state is mutated only by the event-dispatch path").
pub struct StreamingBridge<S: ChatSurface> {
    inner: Mutex<Inner<S>>,
}

impl<S: ChatSurface> StreamingBridge<S> {
    pub fn new(surface: Arc<S>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                surface,
                sessions: HashMap::new(),
                streaming_enabled: HashMap::new(),
                states: HashMap::new(),
                pending_permissions: PendingPermissions::new(),
                message_roles: SessionBoundCache::new(),
                sent_user_messages: SessionBoundCache::new(),
                messages_from_surface: EchoSuppressionSet::new(),
            }),
        }
    }

    pub async fn register_session(&self, session_id: String, chat_id: i64, topic_id: i64, streaming_enabled: bool) {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(session_id.clone(), SessionBinding { chat_id, topic_id });
        inner.streaming_enabled.insert(session_id, streaming_enabled);
    }

    pub async fn unregister_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.sessions.remove(session_id);
        inner.streaming_enabled.remove(session_id);
        inner.states.remove(session_id);
        inner.message_roles.evict_session(session_id);
        inner.sent_user_messages.evict_session(session_id);
        inner.messages_from_surface.evict_session(session_id);
    }

    /// Deposited by the router before forwarding a chat-originated message, so the
    /// subsequent echo of the same text is suppressed (spec.md §4.5, §8 "No echo").
    pub async fn suppress_next_echo(&self, session_id: &str, text: &str) {
        let mut inner = self.inner.lock().await;
        inner.messages_from_surface.mark_sent(session_id, &normalize(text));
    }

    pub async fn dispatch(&self, event: AgentEvent) -> Result<()> {
        let Some(session_id) = event.session_id().map(str::to_string) else {
            return Ok(());
        };
        let mut inner = self.inner.lock().await;
        if !inner.sessions.contains_key(&session_id) {
            return Ok(());
        }
        match event.event_type.as_str() {
            "message.updated" => handle_message_updated(&mut inner, &session_id, &event.properties).await,
            "message.part.updated" => handle_part_updated(&mut inner, &session_id, &event.properties).await,
            "tool.execute" => handle_tool_execute(&mut inner, &session_id, &event.properties).await,
            "tool.result" => handle_tool_result(&mut inner, &session_id, &event.properties).await,
            "session.idle" => finalize(&mut inner, &session_id).await,
            "session.error" => handle_session_error(&mut inner, &session_id, &event.properties).await,
            "session.updated" => handle_session_updated(&mut inner, &session_id, &event.properties),
            "permission.updated" => handle_permission_updated(&mut inner, &session_id, &event.properties).await,
            "permission.replied" => handle_permission_replied(&mut inner, &event.properties).await,
            other => {
                tracing::debug!(event_type = other, "unhandled agent event");
                Ok(())
            }
        }
    }

    pub async fn respond_to_permission_click(&self, permission_id: &str) -> Option<PendingPermission> {
        let mut inner = self.inner.lock().await;
        inner.pending_permissions.take(permission_id)
    }
}

fn is_user_role(props: &Value) -> bool {
    props.get("role").and_then(|v| v.as_str()) == Some("user")
        || props.get("info").and_then(|i| i.get("role")).and_then(|v| v.as_str()) == Some("user")
}

/// Extracts the parent message's id, present on both `message.updated`'s `info` object and
/// `message.part.updated`'s `part` object (spec.md §4.5).
fn message_id(props: &Value) -> Option<&str> {
    props
        .get("info")
        .and_then(|i| i.get("id"))
        .or_else(|| props.get("part").and_then(|p| p.get("messageID")))
        .and_then(Value::as_str)
}

async fn handle_message_updated<S: ChatSurface>(inner: &mut Inner<S>, session_id: &str, props: &Value) -> Result<()> {
    let is_user = is_user_role(props);
    if let Some(id) = message_id(props) {
        let role = if is_user { "user" } else { "assistant" };
        inner.message_roles.insert(session_id, id.to_string(), role.to_string());
    }
    if is_user {
        return Ok(());
    }
    let state = inner.states.entry(session_id.to_string()).or_insert_with(|| StreamingState::new(session_id));
    if let Some(tokens) = props.get("tokens") {
        state.tokens = Tokens {
            input: tokens.get("input").and_then(Value::as_u64).unwrap_or(0),
            output: tokens.get("output").and_then(Value::as_u64).unwrap_or(0),
            reasoning: tokens.get("reasoning").and_then(Value::as_u64),
            cache: tokens.get("cache").and_then(Value::as_u64),
        };
    }
    if let Some(model) = props.get("model").and_then(Value::as_str) {
        state.model = Some(model.to_string());
    }
    maybe_refresh(inner, session_id).await
}

async fn handle_part_updated<S: ChatSurface>(inner: &mut Inner<S>, session_id: &str, props: &Value) -> Result<()> {
    let part_type = props.get("part").and_then(|p| p.get("type")).and_then(Value::as_str).unwrap_or("");
    let is_user = message_id(props)
        .and_then(|id| inner.message_roles.get(session_id, id))
        .map(|role| role.as_str() == "user")
        .unwrap_or_else(|| is_user_role(props));
    match part_type {
        "text" if is_user => {
            let text = props.get("part").and_then(|p| p.get("text")).and_then(Value::as_str).unwrap_or("");
            let norm = normalize(text);
            let already_sent_by_router = inner.messages_from_surface.should_suppress(session_id, &norm);
            let already_echoed = inner.sent_user_messages.contains(session_id, &norm);
            if !already_sent_by_router && !already_echoed {
                inner.sent_user_messages.insert(session_id, norm, ());
                if let Some(binding) = inner.sessions.get(session_id).copied() {
                    let opts = MessageOptions { parse_mode_html: true, ..Default::default() };
                    let _ = inner
                        .surface
                        .send_message(binding.chat_id, Some(binding.topic_id), &format!("💬 from agent UI: {text}"), &opts)
                        .await;
                }
            }
            Ok(())
        }
        "text" => {
            let text = props.get("part").and_then(|p| p.get("text")).and_then(Value::as_str).unwrap_or("");
            let state = inner.states.entry(session_id.to_string()).or_insert_with(|| StreamingState::new(session_id));
            state.current_text = text.to_string();
            maybe_refresh(inner, session_id).await
        }
        "tool" | "tool-invocation" | "step-finish" => {
            maybe_refresh(inner, session_id).await
        }
        _ => Ok(()),
    }
}

async fn handle_tool_execute<S: ChatSurface>(inner: &mut Inner<S>, session_id: &str, props: &Value) -> Result<()> {
    let state = inner.states.entry(session_id.to_string()).or_insert_with(|| StreamingState::new(session_id));
    state.tools.push(ToolCall {
        name: props.get("tool").and_then(Value::as_str).unwrap_or("tool").to_string(),
        call_id: props.get("callID").and_then(Value::as_str).unwrap_or_default().to_string(),
        started_at: store_now_ms(),
        completed_at: None,
        title: props.get("title").and_then(Value::as_str).map(str::to_string),
    });
    force_refresh(inner, session_id).await
}

async fn handle_tool_result<S: ChatSurface>(inner: &mut Inner<S>, session_id: &str, props: &Value) -> Result<()> {
    let call_id = props.get("callID").and_then(Value::as_str).unwrap_or_default();
    let title = props.get("title").and_then(Value::as_str).map(str::to_string);
    if let Some(state) = inner.states.get_mut(session_id) {
        if let Some(tool) = state.tools.iter_mut().find(|t| t.call_id == call_id) {
            tool.completed_at = Some(store_now_ms());
            if title.is_some() {
                tool.title = title;
            }
        }
    }
    maybe_refresh(inner, session_id).await
}

fn handle_session_updated<S: ChatSurface>(inner: &mut Inner<S>, session_id: &str, props: &Value) -> Result<()> {
    if props.get("status").and_then(Value::as_str) == Some("running") {
        let state = inner.states.entry(session_id.to_string()).or_insert_with(|| StreamingState::new(session_id));
        state.is_processing = true;
    }
    Ok(())
}

async fn handle_session_error<S: ChatSurface>(inner: &mut Inner<S>, session_id: &str, props: &Value) -> Result<()> {
    let message = props.get("message").and_then(Value::as_str).unwrap_or("agent error");
    if let Some(state) = inner.states.remove(session_id) {
        if let Some(binding) = inner.sessions.get(session_id).copied() {
            if let Some(message_id) = state.surface_message_id {
                let _ = inner.surface.delete_message(binding.chat_id, message_id).await;
            }
            let opts = MessageOptions { parse_mode_html: true, reply_to: None, ..Default::default() };
            let _ = inner
                .surface
                .send_message(binding.chat_id, Some(binding.topic_id), &format!("⚠️ {message}"), &opts)
                .await;
        }
    }
    inner.message_roles.evict_session(session_id);
    inner.sent_user_messages.evict_session(session_id);
    inner.messages_from_surface.evict_session(session_id);
    Ok(())
}

async fn handle_permission_updated<S: ChatSurface>(inner: &mut Inner<S>, session_id: &str, props: &Value) -> Result<()> {
    let Some(binding) = inner.sessions.get(session_id).copied() else { return Ok(()) };
    let permission_id = props.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
    let kind = props.get("type").and_then(Value::as_str).unwrap_or("unknown").to_string();
    let title = props.get("title").and_then(Value::as_str).unwrap_or("").to_string();

    let keyboard = InlineKeyboard {
        rows: vec![vec![
            ("Once".into(), format!("perm:{permission_id}:once")),
            ("Always".into(), format!("perm:{permission_id}:always")),
            ("Reject".into(), format!("perm:{permission_id}:reject")),
        ]],
    };
    let opts = MessageOptions { parse_mode_html: true, reply_markup: Some(keyboard), ..Default::default() };
    let text = format!("Permission requested: <b>{kind}</b>\n{title}");
    let message_id = inner
        .surface
        .send_message(binding.chat_id, Some(binding.topic_id), &text, &opts)
        .await
        .map_err(surface_err)?;

    inner.pending_permissions.insert(PendingPermission {
        session_id: session_id.to_string(),
        permission_id,
        chat_id: binding.chat_id,
        topic_id: binding.topic_id,
        message_id,
        kind,
        title,
    });
    Ok(())
}

async fn handle_permission_replied<S: ChatSurface>(inner: &mut Inner<S>, props: &Value) -> Result<()> {
    let permission_id = props.get("id").and_then(Value::as_str).unwrap_or_default();
    if let Some(pending) = inner.pending_permissions.take(permission_id) {
        let outcome = props.get("response").and_then(Value::as_str).unwrap_or("unknown");
        let opts = MessageOptions { parse_mode_html: true, ..Default::default() };
        let _ = inner
            .surface
            .edit_message_text(pending.chat_id, pending.message_id, &format!("Permission {outcome}"), &opts)
            .await;
    }
    Ok(())
}

/// Throttled refresh: issued only once `updateInterval` has elapsed since the last edit
/// (spec.md §4.5 "Throttling").
async fn maybe_refresh<S: ChatSurface>(inner: &mut Inner<S>, session_id: &str) -> Result<()> {
    let streaming = inner.streaming_enabled.get(session_id).copied().unwrap_or(false);
    let interval = if streaming { STREAMING_UPDATE_INTERVAL } else { NON_STREAMING_UPDATE_INTERVAL };
    let due = inner
        .states
        .get(session_id)
        .map(|s| s.last_surface_update_at.elapsed() >= interval)
        .unwrap_or(false);
    if due {
        force_refresh(inner, session_id).await
    } else {
        Ok(())
    }
}

async fn force_refresh<S: ChatSurface>(inner: &mut Inner<S>, session_id: &str) -> Result<()> {
    let Some(binding) = inner.sessions.get(session_id).copied() else { return Ok(()) };
    let streaming = inner.streaming_enabled.get(session_id).copied().unwrap_or(false);
    let Some(state) = inner.states.get(session_id).cloned() else { return Ok(()) };
    if state.pending_send {
        return Ok(());
    }

    let text = if streaming { format_streaming_update(&state) } else { format_progress_bubble(&state) };
    let opts = MessageOptions { parse_mode_html: true, ..Default::default() };

    let mut new_message_id = None;
    match state.surface_message_id {
        Some(message_id) => match inner.surface.edit_message_text(binding.chat_id, message_id, &text, &opts).await {
            Ok(()) | Err(SurfaceError::NotModified) => {}
            Err(SurfaceError::RateLimited(retry_after)) => {
                warn!(session_id, ?retry_after, "surface rate-limited, pausing edits");
                if let Some(state) = inner.states.get_mut(session_id) {
                    state.last_surface_update_at = tokio::time::Instant::now() + retry_after + RATE_LIMIT_CUSHION;
                }
                return Ok(());
            }
            Err(SurfaceError::MessageNotFound) => {
                match inner.surface.send_message(binding.chat_id, Some(binding.topic_id), &text, &opts).await {
                    Ok(id) => new_message_id = Some(id),
                    Err(e) => warn!(session_id, error = %e, "surface re-send after MessageNotFound failed"),
                }
            }
            Err(e) => warn!(session_id, error = %e, "surface edit failed"),
        },
        None => match inner.surface.send_message(binding.chat_id, Some(binding.topic_id), &text, &opts).await {
            Ok(id) => new_message_id = Some(id),
            Err(e) => warn!(session_id, error = %e, "surface send failed"),
        },
    }

    if let Some(state) = inner.states.get_mut(session_id) {
        if new_message_id.is_some() {
            state.surface_message_id = new_message_id;
        }
        state.last_surface_update_at = tokio::time::Instant::now();
    }
    Ok(())
}

/// Finalization is the only update that must succeed; it retries on rate limit, drops rich
/// formatting on parse failure, and posts fresh if the bubble was lost (spec.md §4.5, §7).
async fn finalize<S: ChatSurface>(inner: &mut Inner<S>, session_id: &str) -> Result<()> {
    let Some(state) = inner.states.remove(session_id) else {
        // Idempotent: replaying session.idle after teardown is a no-op (spec.md §8).
        return Ok(());
    };
    let Some(binding) = inner.sessions.get(session_id).copied() else { return Ok(()) };
    let final_text = format_final_text(&state);
    let opts = MessageOptions { parse_mode_html: true, ..Default::default() };

    let mut attempt_text = final_text.clone();
    let mut plain_fallback_used = false;
    for _ in 0..3 {
        let result = match state.surface_message_id {
            Some(message_id) => inner.surface.edit_message_text(binding.chat_id, message_id, &attempt_text, &opts).await,
            None => inner
                .surface
                .send_message(binding.chat_id, Some(binding.topic_id), &attempt_text, &opts)
                .await
                .map(|_| ()),
        };
        match result {
            Ok(()) | Err(SurfaceError::NotModified) => break,
            Err(SurfaceError::RateLimited(retry_after)) => {
                tokio::time::sleep(retry_after + RATE_LIMIT_CUSHION).await;
            }
            Err(SurfaceError::MessageNotFound) => {
                let _ = inner
                    .surface
                    .send_message(binding.chat_id, Some(binding.topic_id), &attempt_text, &opts)
                    .await;
                break;
            }
            Err(SurfaceError::ParseError(_)) if !plain_fallback_used => {
                plain_fallback_used = true;
                attempt_text = strip_tags(&final_text);
            }
            Err(e) => {
                warn!(session_id, error = %e, "finalize: giving up after non-retryable error");
                break;
            }
        }
    }

    info!(session_id, "session finalized");
    inner.message_roles.evict_session(session_id);
    inner.sent_user_messages.evict_session(session_id);
    inner.messages_from_surface.evict_session(session_id);
    Ok(())
}

fn strip_tags(html: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn surface_err(e: SurfaceError) -> BridgeError {
    BridgeError::Surface(e.to_string())
}

fn store_now_ms() -> i64 {
    store::now_ms()
}
