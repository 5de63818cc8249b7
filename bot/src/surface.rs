//! `TelegramSurface`: the production `ChatSurface` backed by `teloxide` (spec.md §6 "Chat
//! platform (consumed)").

use async_trait::async_trait;
use bridge::{ChatSurface, InlineKeyboard, MessageOptions, SurfaceError, SurfaceResult};
use teloxide::payloads::{
    CreateForumTopicSetters, DeleteForumTopicSetters, EditMessageTextSetters, SendMessageSetters,
};
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode, ThreadId};
use teloxide::ApiError;
use teloxide::RequestError;

pub struct TelegramSurface {
    bot: Bot,
}

impl TelegramSurface {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }
}

fn to_markup(kb: &InlineKeyboard) -> InlineKeyboardMarkup {
    let rows = kb
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|(text, data)| InlineKeyboardButton::callback(text.clone(), data.clone()))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

/// Maps teloxide's error surface onto the bridge's platform-neutral one (spec.md §7
/// "Send-to-surface failures").
fn map_request_error(e: RequestError) -> SurfaceError {
    match e {
        RequestError::RetryAfter(d) => SurfaceError::RateLimited(d.duration()),
        RequestError::Api(ApiError::MessageNotModified) => SurfaceError::NotModified,
        RequestError::Api(ApiError::MessageIdInvalid) | RequestError::Api(ApiError::MessageToEditNotFound) => {
            SurfaceError::MessageNotFound
        }
        RequestError::Api(ApiError::CantParseEntities(msg)) => SurfaceError::ParseError(msg),
        other => SurfaceError::Other(other.to_string()),
    }
}

#[async_trait]
impl ChatSurface for TelegramSurface {
    async fn send_message(
        &self,
        chat_id: i64,
        topic_id: Option<i64>,
        text: &str,
        opts: &MessageOptions,
    ) -> SurfaceResult<i32> {
        let mut req = self.bot.send_message(ChatId(chat_id), text);
        if opts.parse_mode_html {
            req = req.parse_mode(ParseMode::Html);
        }
        if let Some(topic_id) = topic_id {
            req = req.message_thread_id(ThreadId(MessageId(topic_id as i32)));
        }
        if let Some(reply_to) = opts.reply_to {
            req = req.reply_to_message_id(MessageId(reply_to));
        }
        if let Some(markup) = &opts.reply_markup {
            req = req.reply_markup(to_markup(markup));
        }
        let message = req.await.map_err(map_request_error)?;
        Ok(message.id.0)
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
        opts: &MessageOptions,
    ) -> SurfaceResult<()> {
        let mut req = self.bot.edit_message_text(ChatId(chat_id), MessageId(message_id), text);
        if opts.parse_mode_html {
            req = req.parse_mode(ParseMode::Html);
        }
        if let Some(markup) = &opts.reply_markup {
            req = req.reply_markup(to_markup(markup));
        }
        req.await.map_err(map_request_error)?;
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> SurfaceResult<()> {
        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id))
            .await
            .map_err(map_request_error)?;
        Ok(())
    }

    async fn create_forum_topic(&self, chat_id: i64, name: &str) -> SurfaceResult<i64> {
        let topic = self
            .bot
            .create_forum_topic(ChatId(chat_id), name, 0x6FB9F0, "")
            .await
            .map_err(map_request_error)?;
        Ok(topic.thread_id.0 .0 as i64)
    }

    async fn delete_forum_topic(&self, chat_id: i64, topic_id: i64) -> SurfaceResult<()> {
        self.bot
            .delete_forum_topic(ChatId(chat_id), ThreadId(MessageId(topic_id as i32)))
            .await
            .map_err(map_request_error)?;
        Ok(())
    }
}
