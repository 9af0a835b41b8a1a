//! Routes incoming Telegram messages into the task flow.

use anyhow::Result;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::User;
use tracing::{debug, warn};

use crate::dialogue::{MediaClass, TaskKind, UserId};
use crate::flow::InboundEvent;
use crate::localization::t;

use super::ui_builder::{join_group_keyboard, main_menu_keyboard};
use super::AppDeps;

pub async fn message_handler(bot: Bot, msg: Message, deps: Arc<AppDeps>) -> Result<()> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let user: UserId = from.id.0 as i64;

    if let Some(text) = msg.text() {
        return handle_text_message(&bot, &msg, from, user, text, &deps).await;
    }

    if let Some(photos) = msg.photo() {
        if let Some(largest) = photos.last() {
            debug!(user_id = user, "received photo message");
            let event = InboundEvent::MediaReceived {
                class: MediaClass::Photo,
                file_ref: largest.file.id.0.clone(),
                mime_type: None,
                duration_secs: None,
            };
            return deps.flow.handle_event(user, event).await;
        }
        return Ok(());
    }

    if let Some(video) = msg.video() {
        debug!(user_id = user, "received video message");
        let event = InboundEvent::MediaReceived {
            class: MediaClass::Video,
            file_ref: video.file.id.0.clone(),
            mime_type: video.mime_type.as_ref().map(|m| m.to_string()),
            duration_secs: Some(video.duration.seconds()),
        };
        return deps.flow.handle_event(user, event).await;
    }

    if let Some(document) = msg.document() {
        // Image documents count as photos, same as the inline variant.
        if let Some(mime) = &document.mime_type {
            if mime.to_string().starts_with("image/") {
                debug!(user_id = user, mime_type = %mime, "received image document");
                let event = InboundEvent::MediaReceived {
                    class: MediaClass::Photo,
                    file_ref: document.file.id.0.clone(),
                    mime_type: Some(mime.to_string()),
                    duration_secs: None,
                };
                return deps.flow.handle_event(user, event).await;
            }
        }
        debug!(user_id = user, "ignoring non-image document");
    }

    Ok(())
}

async fn handle_text_message(
    bot: &Bot,
    msg: &Message,
    from: &User,
    user: UserId,
    text: &str,
    deps: &AppDeps,
) -> Result<()> {
    debug!(user_id = user, "received text message");

    if text == "/start" {
        if let Err(e) = deps
            .users
            .upsert_user(
                user,
                &from.first_name,
                from.last_name.as_deref(),
                from.username.as_deref(),
            )
            .await
        {
            warn!(user_id = user, error = %e, "failed to upsert user");
        }
        deps.flow.reset(user).await;

        if deps.gate.is_member(user).await {
            bot.send_message(msg.chat.id, t("welcome"))
                .reply_markup(main_menu_keyboard())
                .await?;
        } else {
            bot.send_message(msg.chat.id, t("membership-required"))
                .reply_markup(join_group_keyboard(deps.invite_link.as_deref()))
                .await?;
        }
        return Ok(());
    }

    if text == "/cancel" {
        return deps.flow.handle_event(user, InboundEvent::Cancel).await;
    }

    if text == "/admin" {
        if deps.admin.is_admin(user) {
            deps.admin.send_panel(bot, msg.chat.id).await?;
        } else {
            bot.send_message(msg.chat.id, t("not-authorized")).await?;
        }
        return Ok(());
    }

    if deps.admin.handle_text(bot, msg.chat.id, user, text).await? {
        return Ok(());
    }

    deps.flow
        .handle_event(
            user,
            InboundEvent::TextReceived {
                text: text.to_string(),
            },
        )
        .await
}

/// Map a task-start button payload to its kind.
pub fn task_kind_for_callback(data: &str) -> Option<TaskKind> {
    match data {
        "start_video_swap" => Some(TaskKind::VideoSwap),
        "start_photo_swap" => Some(TaskKind::PhotoSwap),
        "start_image_enhance" => Some(TaskKind::ImageEnhance),
        _ => None,
    }
}
