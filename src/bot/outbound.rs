//! Telegram implementation of the flow's outbound transport.

use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{FileId, InputFile, MessageId};

use crate::dialogue::{MediaClass, UserId};
use crate::flow::{MessageRef, Outbound, OutputPayload};

pub struct TelegramOutbound {
    bot: Bot,
}

impl TelegramOutbound {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Outbound for TelegramOutbound {
    async fn send_text(&self, user: UserId, text: &str) -> Result<MessageRef> {
        let message = self.bot.send_message(ChatId(user), text).await?;
        Ok(message.id.0)
    }

    async fn send_media(
        &self,
        user: UserId,
        class: MediaClass,
        payload: &OutputPayload,
        caption: &str,
    ) -> Result<MessageRef> {
        let input = match payload {
            OutputPayload::File(handle) => InputFile::file(handle.path().to_path_buf()),
            OutputPayload::Url(raw) => InputFile::url(url::Url::parse(raw)?),
        };
        let message = match class {
            MediaClass::Photo => {
                self.bot
                    .send_photo(ChatId(user), input)
                    .caption(caption.to_string())
                    .await?
            }
            MediaClass::Video => {
                self.bot
                    .send_video(ChatId(user), input)
                    .caption(caption.to_string())
                    .await?
            }
        };
        Ok(message.id.0)
    }

    async fn edit_text(&self, user: UserId, message: MessageRef, text: &str) -> Result<()> {
        self.bot
            .edit_message_text(ChatId(user), MessageId(message), text)
            .await?;
        Ok(())
    }

    async fn delete_message(&self, user: UserId, message: MessageRef) -> Result<()> {
        self.bot
            .delete_message(ChatId(user), MessageId(message))
            .await?;
        Ok(())
    }

    async fn download(&self, file_ref: &str) -> Result<Vec<u8>> {
        let file = self.bot.get_file(FileId(file_ref.to_string())).await?;
        let url = format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.bot.token(),
            file.path
        );
        let response = reqwest::get(&url).await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}
