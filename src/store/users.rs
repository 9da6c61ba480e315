use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::{
    error::{RelayError, RelayResult, is_unique_violation},
    models::User,
};

/// Account and mute-relationship lookups the relay depends on.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> RelayResult<User>;

    async fn find_by_username(&self, username: &str) -> RelayResult<User>;

    /// Whether `muter` has muted `muted`.
    async fn has_muted(&self, muter: Uuid, muted: Uuid) -> RelayResult<bool>;
}

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SqliteUserDirectory {
    pool: SqlitePool,
}

impl SqliteUserDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn register(&self, username: &str) -> RelayResult<User> {
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_lowercase(),
        };

        sqlx::query("INSERT INTO users (id, username, created_at) VALUES (?, ?, ?)")
            .bind(user.id)
            .bind(&user.username)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    RelayError::conflict("duplicate-username", "Username is already taken.")
                } else {
                    e.into()
                }
            })?;

        Ok(user)
    }

    pub async fn mute(&self, muter: Uuid, muted: Uuid) -> RelayResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO user_mutes (muter_id, muted_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(muter)
        .bind(muted)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for SqliteUserDirectory {
    async fn find_by_id(&self, id: Uuid) -> RelayResult<User> {
        sqlx::query_as::<_, UserRow>("SELECT id, username FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(User::from)
            .ok_or_else(|| RelayError::missing("user-not-found", "User not found."))
    }

    async fn find_by_username(&self, username: &str) -> RelayResult<User> {
        sqlx::query_as::<_, UserRow>("SELECT id, username FROM users WHERE username = ?")
            .bind(username.to_lowercase())
            .fetch_optional(&self.pool)
            .await?
            .map(User::from)
            .ok_or_else(|| RelayError::missing("user-not-found", "User not found."))
    }

    async fn has_muted(&self, muter: Uuid, muted: Uuid) -> RelayResult<bool> {
        let row: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM user_mutes WHERE muter_id = ? AND muted_id = ? LIMIT 1",
        )
        .bind(muter)
        .bind(muted)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}
