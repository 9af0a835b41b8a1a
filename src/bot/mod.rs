//! Telegram glue around the task flow core.
//!
//! This module is split into several submodules:
//! - `message_handler`: routes incoming text, photo, video and document messages
//! - `callback_handler`: routes inline keyboard callback queries
//! - `outbound`: the [`crate::flow::Outbound`] transport implementation
//! - `membership`: the channel-membership [`crate::flow::AccessGate`]
//! - `admin`: the admin stats panel and grant-premium dialogue
//! - `ui_builder`: inline keyboards and formatted panel text

pub mod admin;
pub mod callback_handler;
pub mod membership;
pub mod message_handler;
pub mod outbound;
pub mod ui_builder;

pub use callback_handler::callback_handler;
pub use message_handler::message_handler;

use std::sync::Arc;

use crate::db::UserDb;
use crate::flow::{AccessGate, TaskFlow};

/// Shared dependencies captured by the dispatcher closures in `main`.
pub struct AppDeps {
    pub flow: TaskFlow,
    pub admin: admin::AdminPanel,
    pub users: Arc<UserDb>,
    pub gate: Arc<dyn AccessGate>,
    pub invite_link: Option<String>,
}
