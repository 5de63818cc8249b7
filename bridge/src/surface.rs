//! Chat-platform contract the bridge drives (spec.md §6 "Chat platform (consumed)").

use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    pub parse_mode_html: bool,
    pub reply_markup: Option<InlineKeyboard>,
    pub reply_to: Option<i32>,
    pub edit_message_id: Option<i32>,
}

/// 2-D array of `{text, callbackData}` buttons (spec.md §6).
#[derive(Debug, Clone, Default)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<(String, String)>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("rate limited, retry after {0:?}")]
    RateLimited(std::time::Duration),
    #[error("message not found")]
    MessageNotFound,
    #[error("not modified")]
    NotModified,
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("other: {0}")]
    Other(String),
}

pub type SurfaceResult<T> = std::result::Result<T, SurfaceError>;

/// Abstracts the chat platform so the bridge, router, and control plane never depend on a
/// specific SDK type (spec.md §9 "monkey-patched router" guidance generalized to every
/// outward-facing dependency, not just routing).
#[async_trait]
pub trait ChatSurface: Send + Sync {
    async fn send_message(
        &self,
        chat_id: i64,
        topic_id: Option<i64>,
        text: &str,
        opts: &MessageOptions,
    ) -> SurfaceResult<i32>;

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
        opts: &MessageOptions,
    ) -> SurfaceResult<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> SurfaceResult<()>;

    async fn create_forum_topic(&self, chat_id: i64, name: &str) -> SurfaceResult<i64>;

    async fn delete_forum_topic(&self, chat_id: i64, topic_id: i64) -> SurfaceResult<()>;

    /// A human-followable link to a forum topic. Telegram's `t.me/c/<chat>/<topic>` form is
    /// used as the default; other surfaces can override it.
    fn topic_url(&self, chat_id: i64, topic_id: i64) -> String {
        format!("https://t.me/c/{chat_id}/{topic_id}")
    }
}
