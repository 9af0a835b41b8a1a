use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use faceswap_bot::bot::{self, admin::AdminPanel, membership::TelegramGate, outbound::TelegramOutbound, AppDeps};
use faceswap_bot::config::Config;
use faceswap_bot::db::UserDb;
use faceswap_bot::flow::{AccessGate, FlowOptions, TaskFlow};
use faceswap_bot::localization::init_localization;
use faceswap_bot::media::MediaStore;
use faceswap_bot::state_store::InMemoryStateStore;
use faceswap_bot::swap_api::SwapClient;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting face swap bot");

    let config = Config::from_env()?;

    if let Err(e) = init_localization() {
        warn!(error = %e, "localization unavailable, falling back to message keys");
    }

    let users = Arc::new(UserDb::connect(&config.database_url).await?);
    users.init_schema().await?;

    let media = Arc::new(MediaStore::new(config.temp_dir.clone())?);
    let store = Arc::new(InMemoryStateStore::new(Duration::from_secs(
        config.state_ttl_secs,
    )));
    let _sweeper = Arc::clone(&store).spawn_sweeper(Duration::from_secs(60));

    let bot = Bot::new(&config.bot_token);
    let outbound = Arc::new(TelegramOutbound::new(bot.clone()));
    let gate: Arc<dyn AccessGate> = Arc::new(TelegramGate::new(
        bot.clone(),
        config.channel_id.clone(),
        Arc::clone(&users),
    ));
    let jobs = Arc::new(SwapClient::new(config.swap_api_config()));

    let flow = TaskFlow::new(
        store,
        media,
        jobs,
        outbound,
        users.clone(),
        Arc::clone(&gate),
        FlowOptions {
            delivery: config.delivery_mode(),
            invite_link: config.channel_invite_link.clone(),
        },
    );

    let deps = Arc::new(AppDeps {
        flow,
        admin: AdminPanel::new(config.admin_id, Arc::clone(&users)),
        users,
        gate,
        invite_link: config.channel_invite_link.clone(),
    });

    info!(admin_id = ?config.admin_id, "bot initialized, starting dispatcher");

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint({
            let deps = Arc::clone(&deps);
            move |bot: Bot, msg: Message| {
                let deps = Arc::clone(&deps);
                async move { bot::message_handler(bot, msg, deps).await }
            }
        }))
        .branch(Update::filter_callback_query().endpoint({
            let deps = Arc::clone(&deps);
            move |bot: Bot, q: CallbackQuery| {
                let deps = Arc::clone(&deps);
                async move { bot::callback_handler(bot, q, deps).await }
            }
        }));

    Dispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
