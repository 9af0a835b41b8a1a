//! User accounts and usage counters, backed by PostgreSQL.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;

use crate::dialogue::{TaskKind, UserId};
use crate::flow::UsageRecorder;

/// One row of the `users` table.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub is_premium: bool,
    pub photo_swaps_used: i32,
    pub video_swaps_used: i32,
    pub image_enhances_used: i32,
    pub premium_end_date: Option<DateTime<Utc>>,
}

/// Minimal identity used by the admin grant dialogue.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct UserRef {
    pub id: i64,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Clone, Debug, Default, sqlx::FromRow)]
pub struct AdminStats {
    pub total_users: i64,
    pub total_photo_swaps: i64,
    pub total_video_swaps: i64,
    pub total_image_enhances: i64,
    pub new_users_today: i64,
    pub active_users_today: i64,
}

impl AdminStats {
    pub fn repeated_users_today(&self) -> i64 {
        self.active_users_today - self.new_users_today
    }
}

pub struct UserDb {
    pool: PgPool,
}

impl UserDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("failed to connect to database")?;
        Ok(Self { pool })
    }

    pub async fn init_schema(&self) -> Result<()> {
        info!("initializing database schema");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id BIGINT PRIMARY KEY,
                first_name VARCHAR(255) NOT NULL,
                last_name VARCHAR(255),
                username VARCHAR(255),
                is_premium BOOLEAN DEFAULT FALSE,
                created_at TIMESTAMPTZ DEFAULT NOW(),
                last_seen TIMESTAMPTZ DEFAULT NOW(),
                photo_swaps_used INT DEFAULT 0,
                video_swaps_used INT DEFAULT 0,
                image_enhances_used INT DEFAULT 0,
                premium_start_date TIMESTAMPTZ,
                premium_end_date TIMESTAMPTZ,
                daily_photo_swaps INT DEFAULT 0,
                daily_video_swaps INT DEFAULT 0,
                daily_image_enhances INT DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create users table")?;
        Ok(())
    }

    pub async fn upsert_user(
        &self,
        id: UserId,
        first_name: &str,
        last_name: Option<&str>,
        username: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, first_name, last_name, username)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id)
            DO UPDATE SET
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                username = EXCLUDED.username,
                last_seen = NOW()
            "#,
        )
        .bind(id)
        .bind(first_name)
        .bind(last_name)
        .bind(username)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert user {id}"))?;
        Ok(())
    }

    pub async fn increment_usage(&self, id: UserId, kind: TaskKind) -> Result<()> {
        let (total_column, daily_column) = usage_columns(kind);
        // Column names come from the closed TaskKind set above, never from input.
        let query = format!(
            "UPDATE users SET {total_column} = {total_column} + 1, \
             {daily_column} = {daily_column} + 1 WHERE id = $1"
        );
        sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to increment usage for user {id}"))?;
        Ok(())
    }

    /// Fetch a user, downgrading an expired premium flag on the way out.
    pub async fn get_user(&self, id: UserId) -> Result<Option<UserRecord>> {
        let record = sqlx::query_as::<_, UserRecord>(
            "SELECT id, first_name, last_name, username, is_premium, \
             photo_swaps_used, video_swaps_used, image_enhances_used, premium_end_date \
             FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to fetch user {id}"))?;

        let Some(mut user) = record else {
            return Ok(None);
        };

        if user.is_premium && premium_expired(user.premium_end_date, Utc::now()) {
            sqlx::query("UPDATE users SET is_premium = FALSE WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to downgrade expired premium for {id}"))?;
            user.is_premium = false;
            info!(user_id = id, "deactivated expired premium");
        }

        Ok(Some(user))
    }

    /// Mark a user premium for `days` days and return the granted window.
    pub async fn set_premium_status(
        &self,
        id: UserId,
        days: i64,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let (start, end) = premium_window(Utc::now(), days)?;
        sqlx::query(
            "UPDATE users SET is_premium = TRUE, premium_start_date = $2, \
             premium_end_date = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to set premium status for {id}"))?;
        info!(user_id = id, days, "premium granted");
        Ok((start, end))
    }

    /// Look a user up by numeric id or by @username (case-insensitive).
    pub async fn find_user_by_id_or_username(&self, identifier: &str) -> Result<Option<UserRef>> {
        if let Ok(id) = identifier.trim().parse::<i64>() {
            let user = sqlx::query_as::<_, UserRef>(
                "SELECT id, first_name, username FROM users WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to look up user by id")?;
            return Ok(user);
        }

        let username = identifier.trim().trim_start_matches('@');
        let user = sqlx::query_as::<_, UserRef>(
            "SELECT id, first_name, username FROM users WHERE lower(username) = lower($1)",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up user by username")?;
        Ok(user)
    }

    pub async fn admin_stats(&self) -> Result<AdminStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_users,
                COALESCE(SUM(photo_swaps_used), 0)::BIGINT AS total_photo_swaps,
                COALESCE(SUM(video_swaps_used), 0)::BIGINT AS total_video_swaps,
                COALESCE(SUM(image_enhances_used), 0)::BIGINT AS total_image_enhances,
                COUNT(*) FILTER (WHERE created_at >= date_trunc('day', NOW())) AS new_users_today,
                COUNT(*) FILTER (WHERE last_seen >= date_trunc('day', NOW())) AS active_users_today
            FROM users
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to fetch admin stats")?;

        Ok(AdminStats {
            total_users: row.try_get("total_users")?,
            total_photo_swaps: row.try_get("total_photo_swaps")?,
            total_video_swaps: row.try_get("total_video_swaps")?,
            total_image_enhances: row.try_get("total_image_enhances")?,
            new_users_today: row.try_get("new_users_today")?,
            active_users_today: row.try_get("active_users_today")?,
        })
    }
}

#[async_trait]
impl UsageRecorder for UserDb {
    async fn record_usage(&self, user: UserId, kind: TaskKind) -> Result<()> {
        self.increment_usage(user, kind).await
    }
}

fn usage_columns(kind: TaskKind) -> (&'static str, &'static str) {
    match kind {
        TaskKind::VideoSwap => ("video_swaps_used", "daily_video_swaps"),
        TaskKind::PhotoSwap => ("photo_swaps_used", "daily_photo_swaps"),
        TaskKind::ImageEnhance => ("image_enhances_used", "daily_image_enhances"),
    }
}

fn premium_expired(end: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(end, Some(end) if end < now)
}

/// Premium runs from now until the end of the final day.
fn premium_window(
    start: DateTime<Utc>,
    days: i64,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let end = (start + ChronoDuration::days(days))
        .date_naive()
        .and_hms_opt(23, 59, 59)
        .context("invalid end-of-day timestamp")?
        .and_utc();
    Ok((start, end))
}
