//! teloxide endpoint wiring: one branch for inbound chat messages, one for permission-prompt
//! callback button presses (spec.md §4.5, §4.6, §4.8).

use std::sync::Arc;

use agent_client::PermissionResponse;
use bridge::MessageOptions;
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, Message};
use tracing::warn;

use crate::app_state::AppState;
use crate::{control, router};

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let _ = &bot;
    let Some(text) = msg.text() else { return Ok(()) };
    let Some(topic_id) = msg.thread_id.map(|t| t.0 .0 as i64) else { return Ok(()) };

    if topic_id == state.config.control_topic_id {
        control::handle(&state, text).await;
    } else {
        router::route_message(&state, topic_id, text).await;
    }
    Ok(())
}

pub async fn handle_callback_query(bot: Bot, query: CallbackQuery, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(data) = query.data.as_deref() else {
        let _ = bot.answer_callback_query(query.id).await;
        return Ok(());
    };

    let Some(response) = parse_permission_callback(data) else {
        let _ = bot.answer_callback_query(query.id).await;
        return Ok(());
    };
    let (permission_id, response) = response;

    let Some(pending) = state.bridge.respond_to_permission_click(&permission_id).await else {
        let _ = bot.answer_callback_query(query.id).text("this prompt has already been answered").await;
        return Ok(());
    };

    let Some((_, client)) = state.client_for_topic(pending.topic_id).await else {
        warn!(topic_id = pending.topic_id, "no agent client for permission response");
        let _ = bot.answer_callback_query(query.id).text("couldn't reach the agent").await;
        return Ok(());
    };

    if let Err(e) = client.respond_to_permission(&pending.session_id, &pending.permission_id, response).await {
        warn!(permission_id = %pending.permission_id, error = %e, "permission response failed");
        let _ = bot.answer_callback_query(query.id).text("failed to send response").await;
        return Ok(());
    }

    let verdict = match response {
        PermissionResponse::Once => "allowed once",
        PermissionResponse::Always => "always allowed",
        PermissionResponse::Reject => "rejected",
    };
    let resolved = format!("{} — {}", pending.title, verdict);
    let opts = MessageOptions::default();
    let _ = state
        .surface
        .edit_message_text(pending.chat_id, pending.message_id, &resolved, &opts)
        .await;
    let _ = bot.answer_callback_query(query.id).text(verdict).await;
    Ok(())
}

/// Parses `perm:{id}:once|always|reject` callback data built by `bridge` when a permission
/// prompt is posted (spec.md §4.5).
fn parse_permission_callback(data: &str) -> Option<(String, PermissionResponse)> {
    let mut parts = data.splitn(3, ':');
    if parts.next()? != "perm" {
        return None;
    }
    let permission_id = parts.next()?.to_string();
    let response = match parts.next()? {
        "once" => PermissionResponse::Once,
        "always" => PermissionResponse::Always,
        "reject" => PermissionResponse::Reject,
        _ => return None,
    };
    Some((permission_id, response))
}
