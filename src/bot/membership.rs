//! Access gate: channel membership, with a premium bypass.

use async_trait::async_trait;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{ChatMemberStatus, Recipient, UserId as TgUserId};
use tracing::warn;

use crate::db::UserDb;
use crate::dialogue::UserId;
use crate::flow::AccessGate;

pub struct TelegramGate {
    bot: Bot,
    channel: Option<Recipient>,
    users: Arc<UserDb>,
}

impl TelegramGate {
    /// `channel_id` accepts either a numeric chat id or an `@username`.
    /// Without one the gate is open for everybody.
    pub fn new(bot: Bot, channel_id: Option<String>, users: Arc<UserDb>) -> Self {
        let channel = channel_id.map(|raw| match raw.parse::<i64>() {
            Ok(id) => Recipient::Id(ChatId(id)),
            Err(_) => Recipient::ChannelUsername(raw),
        });
        Self { bot, channel, users }
    }

    /// Premium users keep access without joining the channel. The lookup also
    /// downgrades an expired premium flag as a side effect.
    async fn is_premium(&self, user: UserId) -> bool {
        match self.users.get_user(user).await {
            Ok(Some(record)) => record.is_premium,
            Ok(None) => false,
            Err(e) => {
                warn!(user_id = user, error = %e, "premium lookup failed");
                false
            }
        }
    }
}

#[async_trait]
impl AccessGate for TelegramGate {
    async fn is_member(&self, user: UserId) -> bool {
        let Some(channel) = &self.channel else {
            return true;
        };
        if self.is_premium(user).await {
            return true;
        }
        match self
            .bot
            .get_chat_member(channel.clone(), TgUserId(user as u64))
            .await
        {
            Ok(member) => matches!(
                member.status(),
                ChatMemberStatus::Owner | ChatMemberStatus::Administrator | ChatMemberStatus::Member
            ),
            Err(e) => {
                warn!(user_id = user, error = %e, "membership check failed");
                false
            }
        }
    }
}
