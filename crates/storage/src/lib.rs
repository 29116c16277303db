use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{DeliveryStatus, GroupId, MessageId, Role, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub user_id: UserId,
    pub name: String,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredMember {
    pub user_id: UserId,
    pub name: String,
    pub avatar_url: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

/// A message joined with its author's display fields.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub user_id: UserId,
    pub text: String,
    pub is_anonymous: bool,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub user_name: String,
    pub avatar_url: String,
}

const MESSAGE_COLUMNS: &str = "m.id, m.group_id, m.user_id, m.text, m.is_anonymous, m.status, m.created_at, u.name, u.avatar_url";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Each in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
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

    /// Returns the user named `name`, creating it when missing.
    pub async fn find_or_create_user(
        &self,
        name: &str,
        avatar_url: &str,
        now: DateTime<Utc>,
    ) -> Result<StoredUser> {
        sqlx::query(
            "INSERT INTO users (name, avatar_url, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(avatar_url)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, name, avatar_url, created_at, last_seen FROM users WHERE name = ?",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("user '{name}' missing after insert"))?;
        Ok(user_from_row(&row))
    }

    pub async fn user_by_id(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, name, avatar_url, created_at, last_seen FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    /// Records a heartbeat. Returns `false` when the user does not exist.
    pub async fn touch_last_seen(&self, user_id: UserId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET last_seen = ? WHERE id = ?")
            .bind(at.timestamp_millis())
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn create_group(&self, name: &str, now: DateTime<Utc>) -> Result<GroupId> {
        let rec = sqlx::query("INSERT INTO chat_groups (name, created_at) VALUES (?, ?) RETURNING id")
            .bind(name)
            .bind(now.timestamp_millis())
            .fetch_one(&self.pool)
            .await?;
        Ok(GroupId(rec.get::<i64, _>(0)))
    }

    pub async fn group_exists(&self, group_id: GroupId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM chat_groups WHERE id = ?")
            .bind(group_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Joins `user_id` to the group. Existing memberships are left untouched.
    pub async fn add_membership(
        &self,
        group_id: GroupId,
        user_id: UserId,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_members (group_id, user_id, role, joined_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(group_id, user_id) DO NOTHING",
        )
        .bind(group_id.0)
        .bind(user_id.0)
        .bind(role.as_str())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_members_for_group(&self, group_id: GroupId) -> Result<Vec<StoredMember>> {
        let rows = sqlx::query(
            "SELECT u.id, u.name, u.avatar_url, u.last_seen, gm.role, gm.joined_at
             FROM group_members gm
             INNER JOIN users u ON u.id = gm.user_id
             WHERE gm.group_id = ?
             ORDER BY u.name ASC",
        )
        .bind(group_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredMember {
                user_id: UserId(r.get::<i64, _>(0)),
                name: r.get::<String, _>(1),
                avatar_url: r.get::<String, _>(2),
                last_seen: r.get::<Option<i64>, _>(3).map(from_millis),
                role: Role::parse(&r.get::<String, _>(4)),
                joined_at: from_millis(r.get::<i64, _>(5)),
            })
            .collect())
    }

    /// Inserts a message with status `sent`.
    ///
    /// `created_at` is bumped past the newest message of the group when needed,
    /// so timestamps within a group are strictly increasing alongside ids and a
    /// `since` cursor never skips a message.
    pub async fn insert_message(
        &self,
        group_id: GroupId,
        user_id: UserId,
        text: &str,
        is_anonymous: bool,
        at: DateTime<Utc>,
    ) -> Result<MessageId> {
        let rec = sqlx::query(
            "INSERT INTO messages (group_id, user_id, text, is_anonymous, status, created_at)
             SELECT ?1, ?2, ?3, ?4, 'sent', max(?5, COALESCE(MAX(created_at) + 1, ?5))
             FROM messages WHERE group_id = ?1
             RETURNING id",
        )
        .bind(group_id.0)
        .bind(user_id.0)
        .bind(text)
        .bind(is_anonymous)
        .bind(at.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageId(rec.get::<i64, _>(0)))
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             INNER JOIN users u ON u.id = m.user_id
             WHERE m.id = ?"
        );
        let row = sqlx::query(&sql)
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// Lists messages in ascending creation order.
    ///
    /// With `since`, returns the oldest `limit` messages created strictly after
    /// it. Without, returns the newest `limit` messages.
    pub async fn list_group_messages(
        &self,
        group_id: GroupId,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = if let Some(since) = since {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages m
                 INNER JOIN users u ON u.id = m.user_id
                 WHERE m.group_id = ? AND m.created_at > ?
                 ORDER BY m.created_at ASC, m.id ASC
                 LIMIT ?"
            );
            sqlx::query(&sql)
                .bind(group_id.0)
                .bind(since.timestamp_millis())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        } else {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages m
                 INNER JOIN users u ON u.id = m.user_id
                 WHERE m.group_id = ?
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?"
            );
            let mut newest = sqlx::query(&sql)
                .bind(group_id.0)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
            newest.reverse();
            newest
        };

        rows.iter().map(message_from_row).collect()
    }

    /// Marks the given messages of `group_id` as read. Ids from other groups
    /// are ignored. Returns the number of rows touched.
    pub async fn mark_read(&self, group_id: GroupId, message_ids: &[MessageId]) -> Result<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE messages SET status = 'read' WHERE group_id = ");
        builder.push_bind(group_id.0);
        builder.push(" AND id IN (");
        let mut ids = builder.separated(", ");
        for id in message_ids {
            ids.push_bind(id.0);
        }
        ids.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

fn user_from_row(r: &SqliteRow) -> StoredUser {
    StoredUser {
        user_id: UserId(r.get::<i64, _>(0)),
        name: r.get::<String, _>(1),
        avatar_url: r.get::<String, _>(2),
        created_at: from_millis(r.get::<i64, _>(3)),
        last_seen: r.get::<Option<i64>, _>(4).map(from_millis),
    }
}

fn message_from_row(r: &SqliteRow) -> Result<StoredMessage> {
    let raw_status = r.get::<String, _>(5);
    let status = DeliveryStatus::parse(&raw_status)
        .with_context(|| format!("unknown message status '{raw_status}'"))?;
    Ok(StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        group_id: GroupId(r.get::<i64, _>(1)),
        user_id: UserId(r.get::<i64, _>(2)),
        text: r.get::<String, _>(3),
        is_anonymous: r.get::<bool, _>(4),
        status,
        created_at: from_millis(r.get::<i64, _>(6)),
        user_name: r.get::<String, _>(7),
        avatar_url: r.get::<String, _>(8),
    })
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
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
