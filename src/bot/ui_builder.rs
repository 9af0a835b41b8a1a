//! Inline keyboards and formatted panel text.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::db::AdminStats;
use crate::localization::{t, t_args};

/// The three task-start buttons shown after /start.
pub fn main_menu_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback(t("menu-video-swap"), "start_video_swap"),
            InlineKeyboardButton::callback(t("menu-photo-swap"), "start_photo_swap"),
        ],
        vec![InlineKeyboardButton::callback(
            t("menu-image-enhance"),
            "start_image_enhance",
        )],
    ])
}

/// Join-the-channel prompt with a recheck button.
pub fn join_group_keyboard(invite_link: Option<&str>) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    if let Some(link) = invite_link.and_then(|raw| url::Url::parse(raw).ok()) {
        rows.push(vec![InlineKeyboardButton::url(t("join-community"), link)]);
    }
    rows.push(vec![InlineKeyboardButton::callback(
        t("joined-check"),
        "check_membership",
    )]);
    InlineKeyboardMarkup::new(rows)
}

pub fn admin_panel_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback(t("admin-refresh"), "admin_refresh"),
        InlineKeyboardButton::callback(t("admin-grant"), "admin_grant_premium"),
    ]])
}

pub fn premium_duration_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback(t_args("admin-days", &[("days", "7")]), "premium_days_7"),
            InlineKeyboardButton::callback(
                t_args("admin-days", &[("days", "30")]),
                "premium_days_30",
            ),
            InlineKeyboardButton::callback(
                t_args("admin-days", &[("days", "365")]),
                "premium_days_365",
            ),
        ],
        vec![
            InlineKeyboardButton::callback(t("admin-days-custom"), "premium_days_custom"),
            InlineKeyboardButton::callback(t("cancel"), "admin_cancel_grant"),
        ],
    ])
}

pub fn cancel_grant_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        t("cancel"),
        "admin_cancel_grant",
    )]])
}

pub fn format_admin_stats(stats: &AdminStats) -> String {
    let total_users = stats.total_users.to_string();
    let photo_swaps = stats.total_photo_swaps.to_string();
    let video_swaps = stats.total_video_swaps.to_string();
    let enhances = stats.total_image_enhances.to_string();
    let new_today = stats.new_users_today.to_string();
    let repeated_today = stats.repeated_users_today().to_string();

    t_args(
        "admin-stats",
        &[
            ("total_users", &total_users),
            ("photo_swaps", &photo_swaps),
            ("video_swaps", &video_swaps),
            ("image_enhances", &enhances),
            ("new_today", &new_today),
            ("repeated_today", &repeated_today),
        ],
    )
}
