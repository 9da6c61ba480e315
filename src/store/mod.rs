//! Durable conversation and message records.
//!
//! Every store operation is a single statement (or a single transaction)
//! against SQLite. Appending a message and advancing the owning
//! conversation's aggregate fields happen in one transaction, see
//! [`Database::append_message`].

use std::{str::FromStr, time::Duration};

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{error::RelayResult, metrics::Metrics, models::Message};

pub mod conversations;
pub mod messages;
pub mod migrations;
pub mod users;

pub use conversations::ConversationStore;
pub use messages::MessageStore;
pub use users::{SqliteUserDirectory, UserDirectory};

#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

/// How long a writer waits for the database lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl Database {
    /// Opens a file database in WAL mode. Writers queue on the lock for up to
    /// [`BUSY_TIMEOUT`] instead of failing.
    pub async fn connect(url: &str) -> RelayResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        info!("Connected to database at {}", url);
        Ok(Self { pool })
    }

    /// A private in-memory database with the schema applied.
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool is
    /// pinned to one connection that is never recycled.
    pub async fn in_memory() -> RelayResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn conversations(&self) -> ConversationStore<'_> {
        ConversationStore::new(&self.pool)
    }

    pub fn messages(&self) -> MessageStore<'_> {
        MessageStore::new(&self.pool)
    }

    pub fn users(&self) -> SqliteUserDirectory {
        SqliteUserDirectory::new(self.pool.clone())
    }

    /// Persists a new message and advances its conversation's
    /// `lastMessage`, `lastUpdated` and `numMessages` atomically.
    ///
    /// If the aggregate update fails the message insert is rolled back, so the
    /// conversation never under-reports its message log.
    pub async fn append_message(
        &self,
        conv_id: Uuid,
        sender_id: Uuid,
        receiver_id: Uuid,
        body: String,
    ) -> RelayResult<Message> {
        let start = std::time::Instant::now();
        // Take the write lock up front: a deferred transaction that reads
        // and then writes cannot wait out a concurrent writer.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let message =
            messages::insert_message(&mut tx, conv_id, sender_id, receiver_id, body).await?;
        let num_messages = messages::count_for_conversation(&mut tx, conv_id).await?;
        conversations::apply_message_appended(&mut tx, conv_id, message.id, num_messages).await?;

        tx.commit().await?;
        Metrics::observe_store_op("append_message", start.elapsed());

        debug!(
            conv_id = %conv_id,
            message_id = %message.id,
            num_messages,
            "Appended message"
        );
        Ok(message)
    }
}
