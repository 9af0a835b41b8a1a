//! Routes inline keyboard callback queries.

use anyhow::Result;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::debug;

use crate::dialogue::UserId;
use crate::flow::InboundEvent;
use crate::localization::t;

use super::message_handler::task_kind_for_callback;
use super::ui_builder::main_menu_keyboard;
use super::AppDeps;

pub async fn callback_handler(bot: Bot, q: CallbackQuery, deps: Arc<AppDeps>) -> Result<()> {
    let user: UserId = q.from.id.0 as i64;
    let data = q.data.clone().unwrap_or_default();
    debug!(user_id = user, data = %data, "received callback query");

    let mut alert: Option<String> = None;

    if let Some(kind) = task_kind_for_callback(&data) {
        deps.flow
            .handle_event(user, InboundEvent::TaskStart { kind })
            .await?;
    } else if data == "check_membership" {
        if deps.gate.is_member(user).await {
            if let Some(message) = q.message.as_ref() {
                // The prompt becomes the menu in place; stale-message edit
                // failures are not worth surfacing.
                let _ = bot
                    .edit_message_text(message.chat().id, message.id(), t("membership-verified"))
                    .reply_markup(main_menu_keyboard())
                    .await;
            }
        } else {
            alert = Some(t("membership-failed"));
        }
    } else if data.starts_with("admin_") || data.starts_with("premium_days_") {
        if deps.admin.is_admin(user) {
            if let Some(message) = q.message.as_ref() {
                let chat = message.chat().id;
                let message_id = message.id();
                match data.as_str() {
                    "admin_refresh" => deps.admin.refresh(&bot, chat, message_id).await?,
                    "admin_grant_premium" => {
                        deps.admin.begin_grant(&bot, chat, message_id).await?
                    }
                    "admin_cancel_grant" => {
                        deps.admin.cancel_grant(&bot, chat, message_id).await?
                    }
                    "premium_days_custom" => {
                        deps.admin.choose_custom_days(&bot, chat, message_id).await?
                    }
                    other => {
                        if let Some(days) = other
                            .strip_prefix("premium_days_")
                            .and_then(|raw| raw.parse::<i64>().ok())
                        {
                            deps.admin
                                .grant_days(&bot, chat, Some(message_id), days)
                                .await?;
                        }
                    }
                }
            }
        } else {
            alert = Some(t("not-authorized"));
        }
    }

    // Always answer so the button stops spinning.
    match alert {
        Some(text) => {
            bot.answer_callback_query(q.id)
                .text(text)
                .show_alert(true)
                .await?;
        }
        None => {
            bot.answer_callback_query(q.id).await?;
        }
    }
    Ok(())
}
