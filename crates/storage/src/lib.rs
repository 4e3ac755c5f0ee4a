use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::Username;

/// User and relationship store backing the presence and delivery core.
///
/// The core addresses everything by username; this crate owns the durable
/// side of that contract: friend sets, block sets, delivery tokens, online
/// flags and the received-Yo counter. Counter increments happen in the
/// database so concurrent sends to one recipient stay monotonic.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub username: Username,
    pub delivery_token: Option<String>,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub total_yos_received: i64,
}

#[derive(Debug, Clone)]
pub struct ReceivedYo {
    pub sender: Username,
    pub received_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Idempotent user creation; re-creating an existing username is a no-op.
    pub async fn create_user(&self, username: &Username) -> Result<()> {
        sqlx::query("INSERT INTO users (username) VALUES (?) ON CONFLICT(username) DO NOTHING")
            .bind(username.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn find_user(&self, username: &Username) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT username, delivery_token, is_online, last_seen, total_yos_received
             FROM users WHERE username = ?",
        )
        .bind(username.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(stored_user_from_row))
    }

    pub async fn list_users(&self) -> Result<Vec<StoredUser>> {
        let rows = sqlx::query(
            "SELECT username, delivery_token, is_online, last_seen, total_yos_received
             FROM users ORDER BY username",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(stored_user_from_row).collect())
    }

    /// Asymmetric check against `owner`'s own friend list.
    pub async fn is_friend(&self, owner: &Username, other: &Username) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM friendships WHERE owner = ? AND friend = ?")
            .bind(owner.as_str())
            .bind(other.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Whether `target` appears in `owner`'s block set.
    pub async fn has_blocked(&self, owner: &Username, target: &Username) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM blocks WHERE owner = ? AND blocked = ?")
            .bind(owner.as_str())
            .bind(target.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Instant mutual add: both users list each other after this call.
    pub async fn add_friend(&self, a: &Username, b: &Username) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO friendships (owner, friend) VALUES (?, ?) ON CONFLICT DO NOTHING")
            .bind(a.as_str())
            .bind(b.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO friendships (owner, friend) VALUES (?, ?) ON CONFLICT DO NOTHING")
            .bind(b.as_str())
            .bind(a.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_friend(&self, a: &Username, b: &Username) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM friendships WHERE owner = ? AND friend = ?")
            .bind(a.as_str())
            .bind(b.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM friendships WHERE owner = ? AND friend = ?")
            .bind(b.as_str())
            .bind(a.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Blocking also severs friendship in both directions, so a stale friend
    /// entry cannot resurrect delivery eligibility.
    pub async fn block_user(&self, owner: &Username, target: &Username) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO blocks (owner, blocked) VALUES (?, ?) ON CONFLICT DO NOTHING")
            .bind(owner.as_str())
            .bind(target.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM friendships WHERE owner = ? AND friend = ?")
            .bind(owner.as_str())
            .bind(target.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM friendships WHERE owner = ? AND friend = ?")
            .bind(target.as_str())
            .bind(owner.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn unblock_user(&self, owner: &Username, target: &Username) -> Result<()> {
        sqlx::query("DELETE FROM blocks WHERE owner = ? AND blocked = ?")
            .bind(owner.as_str())
            .bind(target.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn friends_of(&self, owner: &Username) -> Result<Vec<Username>> {
        let rows = sqlx::query("SELECT friend FROM friendships WHERE owner = ? ORDER BY friend")
            .bind(owner.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Username(r.get::<String, _>(0)))
            .collect())
    }

    pub async fn blocked_by(&self, owner: &Username) -> Result<Vec<Username>> {
        let rows = sqlx::query("SELECT blocked FROM blocks WHERE owner = ? ORDER BY blocked")
            .bind(owner.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Username(r.get::<String, _>(0)))
            .collect())
    }

    pub async fn set_online(
        &self,
        username: &Username,
        online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET is_online = ?, last_seen = ? WHERE username = ?")
            .bind(online)
            .bind(last_seen)
            .bind(username.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_delivery_token(&self, username: &Username, token: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE users SET delivery_token = ? WHERE username = ?")
            .bind(token)
            .bind(username.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_delivery_token(&self, username: &Username) -> Result<()> {
        self.set_delivery_token(username, None).await
    }

    /// Appends to the received-Yo log and returns the post-increment total.
    /// The increment is atomic at the row level; callers never compute totals.
    pub async fn record_yo(
        &self,
        recipient: &Username,
        sender: &Username,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO yos_received (recipient, sender, received_at) VALUES (?, ?, ?)")
            .bind(recipient.as_str())
            .bind(sender.as_str())
            .bind(at)
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query(
            "UPDATE users SET total_yos_received = total_yos_received + 1
             WHERE username = ? RETURNING total_yos_received",
        )
        .bind(recipient.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .with_context(|| format!("recipient '{recipient}' has no user record"))?;
        tx.commit().await?;
        Ok(row.get::<i64, _>(0))
    }

    pub async fn recent_yos(&self, recipient: &Username, limit: u32) -> Result<Vec<ReceivedYo>> {
        let rows = sqlx::query(
            "SELECT sender, received_at FROM yos_received
             WHERE recipient = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(recipient.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ReceivedYo {
                sender: Username(r.get::<String, _>(0)),
                received_at: r.get::<DateTime<Utc>, _>(1),
            })
            .collect())
    }
}

fn stored_user_from_row(row: sqlx::sqlite::SqliteRow) -> StoredUser {
    StoredUser {
        username: Username(row.get::<String, _>(0)),
        delivery_token: row.get::<Option<String>, _>(1),
        is_online: row.get::<bool, _>(2),
        last_seen: row.get::<DateTime<Utc>, _>(3),
        total_yos_received: row.get::<i64, _>(4),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
