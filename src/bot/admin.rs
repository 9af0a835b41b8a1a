//! Admin stats panel and the grant-premium mini-dialogue.
//!
//! Admin conversation state is glue-local and deliberately separate from the
//! task flow's state store; granting premium must not collide with an admin's
//! own in-progress swap task.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::MessageId;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db::{UserDb, UserRef};
use crate::dialogue::UserId;
use crate::localization::{t, t_args};

use super::ui_builder::{
    admin_panel_keyboard, cancel_grant_keyboard, format_admin_stats, premium_duration_keyboard,
};

#[derive(Clone, Debug)]
enum AdminDialogue {
    AwaitingUserId,
    AwaitingDuration { target: UserRef },
    AwaitingCustomDays { target: UserRef },
}

pub struct AdminPanel {
    admin_id: Option<i64>,
    db: Arc<UserDb>,
    sessions: Mutex<HashMap<UserId, AdminDialogue>>,
}

impl AdminPanel {
    pub fn new(admin_id: Option<i64>, db: Arc<UserDb>) -> Self {
        Self {
            admin_id,
            db,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.admin_id == Some(user)
    }

    pub async fn send_panel(&self, bot: &Bot, chat: ChatId) -> Result<()> {
        let stats = self.db.admin_stats().await?;
        bot.send_message(chat, format_admin_stats(&stats))
            .reply_markup(admin_panel_keyboard())
            .await?;
        Ok(())
    }

    pub async fn refresh(&self, bot: &Bot, chat: ChatId, message: MessageId) -> Result<()> {
        let stats = self.db.admin_stats().await?;
        // Telegram rejects edits that change nothing; not worth surfacing.
        if let Err(e) = bot
            .edit_message_text(chat, message, format_admin_stats(&stats))
            .reply_markup(admin_panel_keyboard())
            .await
        {
            debug!(error = %e, "admin panel refresh edit failed");
        }
        Ok(())
    }

    pub async fn begin_grant(&self, bot: &Bot, chat: ChatId, message: MessageId) -> Result<()> {
        self.sessions
            .lock()
            .await
            .insert(chat.0, AdminDialogue::AwaitingUserId);
        bot.edit_message_text(chat, message, t("admin-grant-ask-user"))
            .reply_markup(cancel_grant_keyboard())
            .await?;
        Ok(())
    }

    pub async fn cancel_grant(&self, bot: &Bot, chat: ChatId, message: MessageId) -> Result<()> {
        self.sessions.lock().await.remove(&chat.0);
        let _ = bot
            .edit_message_text(chat, message, t("admin-grant-cancelled"))
            .await;
        self.send_panel(bot, chat).await
    }

    pub async fn choose_custom_days(
        &self,
        bot: &Bot,
        chat: ChatId,
        message: MessageId,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let Some(AdminDialogue::AwaitingDuration { target }) = sessions.get(&chat.0).cloned()
        else {
            return Ok(());
        };
        sessions.insert(chat.0, AdminDialogue::AwaitingCustomDays { target });
        drop(sessions);

        bot.edit_message_text(chat, message, t("admin-grant-custom-days"))
            .reply_markup(cancel_grant_keyboard())
            .await?;
        Ok(())
    }

    /// Grant `days` of premium to the dialogue's target, notify them, and
    /// confirm to the admin.
    pub async fn grant_days(
        &self,
        bot: &Bot,
        chat: ChatId,
        message: Option<MessageId>,
        days: i64,
    ) -> Result<()> {
        let target = {
            let mut sessions = self.sessions.lock().await;
            match sessions.remove(&chat.0) {
                Some(
                    AdminDialogue::AwaitingDuration { target }
                    | AdminDialogue::AwaitingCustomDays { target },
                ) => target,
                other => {
                    if let Some(state) = other {
                        sessions.insert(chat.0, state);
                    }
                    return Ok(());
                }
            }
        };

        let (start, end) = self.db.set_premium_status(target.id, days).await?;

        let note = t_args(
            "premium-activated",
            &[
                ("start", &format_grant_date(start)),
                ("end", &format_grant_date(end)),
            ],
        );
        if let Err(e) = bot.send_message(ChatId(target.id), note).await {
            // The user may have blocked the bot; the grant still stands.
            warn!(user_id = target.id, error = %e, "failed to notify premium grant");
            let _ = bot.send_message(chat, t("premium-notify-failed")).await;
        }

        let days_text = days.to_string();
        let confirmation = t_args(
            "admin-grant-success",
            &[("name", &target.first_name), ("days", &days_text)],
        );
        match message {
            Some(id) => {
                if bot
                    .edit_message_text(chat, id, confirmation.clone())
                    .await
                    .is_err()
                {
                    bot.send_message(chat, confirmation).await?;
                }
            }
            None => {
                bot.send_message(chat, confirmation).await?;
            }
        }
        Ok(())
    }

    /// Feed a text message into the grant dialogue. Returns true when the
    /// message was consumed by it.
    pub async fn handle_text(
        &self,
        bot: &Bot,
        chat: ChatId,
        user: UserId,
        text: &str,
    ) -> Result<bool> {
        if !self.is_admin(user) {
            return Ok(false);
        }
        let session = self.sessions.lock().await.get(&chat.0).cloned();
        match session {
            Some(AdminDialogue::AwaitingUserId) => {
                match self.db.find_user_by_id_or_username(text).await? {
                    Some(target) => {
                        let prompt = t_args(
                            "admin-grant-ask-duration",
                            &[("name", &target.first_name)],
                        );
                        self.sessions
                            .lock()
                            .await
                            .insert(chat.0, AdminDialogue::AwaitingDuration { target });
                        bot.send_message(chat, prompt)
                            .reply_markup(premium_duration_keyboard())
                            .await?;
                    }
                    None => {
                        bot.send_message(
                            chat,
                            t_args("admin-grant-user-not-found", &[("identifier", text)]),
                        )
                        .await?;
                    }
                }
                Ok(true)
            }
            Some(AdminDialogue::AwaitingCustomDays { .. }) => {
                match text.trim().parse::<i64>() {
                    Ok(days) if days > 0 => self.grant_days(bot, chat, None, days).await?,
                    _ => {
                        bot.send_message(chat, t("admin-grant-invalid-days")).await?;
                    }
                }
                Ok(true)
            }
            Some(AdminDialogue::AwaitingDuration { .. }) | None => Ok(false),
        }
    }
}

fn format_grant_date(when: DateTime<Utc>) -> String {
    when.format("%B %-d, %Y %H:%M UTC").to_string()
}
