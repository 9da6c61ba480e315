use tracing::{debug, info};

use super::Database;
use crate::error::RelayResult;

impl Database {
    pub async fn run_migrations(&self) -> RelayResult<()> {
        info!("Starting database migrations...");

        self.create_users_tables().await?;
        self.create_convs_table().await?;
        self.create_msgs_table().await?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    async fn execute(&self, name: &str, query: &str) -> RelayResult<()> {
        debug!("Creating '{}'...", name);
        sqlx::query(query).execute(self.pool()).await?;
        Ok(())
    }

    async fn create_users_tables(&self) -> RelayResult<()> {
        self.execute(
            "users",
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id BLOB PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .await?;

        self.execute(
            "user_mutes",
            r#"
            CREATE TABLE IF NOT EXISTS user_mutes (
                muter_id BLOB NOT NULL REFERENCES users(id),
                muted_id BLOB NOT NULL REFERENCES users(id),
                created_at INTEGER NOT NULL,
                PRIMARY KEY (muter_id, muted_id)
            )
            "#,
        )
        .await
    }

    async fn create_convs_table(&self) -> RelayResult<()> {
        // pair_key is the sorted participant pair; UNIQUE makes (A, B) and
        // (B, A) the same conversation.
        self.execute(
            "convs",
            r#"
            CREATE TABLE IF NOT EXISTS convs (
                id BLOB PRIMARY KEY,
                user1_id BLOB NOT NULL REFERENCES users(id),
                user2_id BLOB NOT NULL REFERENCES users(id),
                pair_key TEXT NOT NULL UNIQUE,
                started_at INTEGER NOT NULL,
                last_message BLOB,
                last_updated INTEGER,
                last_seen_by_user1 INTEGER,
                last_seen_by_user2 INTEGER,
                num_msgs INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .await
    }

    async fn create_msgs_table(&self) -> RelayResult<()> {
        self.execute(
            "msgs",
            r#"
            CREATE TABLE IF NOT EXISTS msgs (
                id BLOB PRIMARY KEY,
                conv_id BLOB NOT NULL REFERENCES convs(id),
                sender_id BLOB NOT NULL REFERENCES users(id),
                receiver_id BLOB NOT NULL REFERENCES users(id),
                sent_at INTEGER NOT NULL,
                seen INTEGER NOT NULL DEFAULT 0,
                body TEXT NOT NULL
            )
            "#,
        )
        .await?;

        self.execute(
            "msgs_conv_sent_at",
            "CREATE INDEX IF NOT EXISTS msgs_conv_sent_at ON msgs (conv_id, sent_at)",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();

        assert_eq!(tables, vec!["convs", "msgs", "user_mutes", "users"]);
    }
}
