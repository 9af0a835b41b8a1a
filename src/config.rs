use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::flow::DeliveryMode;
use crate::swap_api::{PollPolicy, SwapApiConfig};

/// Runtime configuration, loaded from the environment (`.env` supported).
#[derive(Clone, Debug)]
pub struct Config {
    pub bot_token: String,
    pub database_url: String,
    /// Channel the user must join before starting tasks. `@username` or a
    /// numeric chat id; unset disables the gate.
    pub channel_id: Option<String>,
    pub channel_invite_link: Option<String>,
    pub admin_id: Option<i64>,
    pub swap_api_base: String,
    pub temp_dir: PathBuf,
    pub state_ttl_secs: u64,
    pub poll_interval_secs: u64,
    pub photo_poll_attempts: u32,
    pub video_poll_attempts: u32,
    pub pre_submit_delay_ms: u64,
    /// Pull results locally before forwarding (default), or hand the remote
    /// url straight to Telegram.
    pub download_results: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bot_token: env::var("BOT_TOKEN").context("BOT_TOKEN must be set")?,
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            channel_id: optional("CHANNEL_ID"),
            channel_invite_link: optional("CHANNEL_INVITE_LINK"),
            admin_id: parsed_optional("ADMIN_ID")?,
            swap_api_base: optional("SWAP_API_BASE")
                .unwrap_or_else(|| "https://api.arting.ai".to_string()),
            temp_dir: optional("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./temp")),
            state_ttl_secs: parsed_or("STATE_TTL_SECS", 3600)?,
            poll_interval_secs: parsed_or("POLL_INTERVAL_SECS", 5)?,
            photo_poll_attempts: parsed_or("PHOTO_POLL_ATTEMPTS", 60)?,
            video_poll_attempts: parsed_or("VIDEO_POLL_ATTEMPTS", 120)?,
            pre_submit_delay_ms: parsed_or("PRE_SUBMIT_DELAY_MS", 100)?,
            download_results: parsed_or("DOWNLOAD_RESULTS", true)?,
        })
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        if self.download_results {
            DeliveryMode::DownloadFirst
        } else {
            DeliveryMode::RemoteUrl
        }
    }

    pub fn swap_api_config(&self) -> SwapApiConfig {
        let interval = Duration::from_secs(self.poll_interval_secs);
        SwapApiConfig {
            base_url: self.swap_api_base.clone(),
            pre_submit_delay: Duration::from_millis(self.pre_submit_delay_ms),
            video_poll: PollPolicy::new(interval, self.video_poll_attempts),
            photo_poll: PollPolicy::new(interval, self.photo_poll_attempts)
                .with_initial_delay(interval),
            enhance_poll: PollPolicy::new(interval, self.photo_poll_attempts)
                .with_initial_delay(interval),
        }
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn parsed_optional<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => Ok(Some(
            raw.parse()
                .with_context(|| format!("invalid value for {key}"))?,
        )),
        None => Ok(None),
    }
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parsed_optional(key)?.unwrap_or(default))
}
