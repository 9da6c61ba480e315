use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::info;
use uuid::Uuid;

use super::users::UserDirectory;
use crate::{
    error::{RelayError, RelayResult, is_unique_violation},
    models::{Conversation, from_millis, now_millis, pair_key},
};

const SELECT_CONVS: &str = r#"
    SELECT
        c.id,
        c.user1_id,
        u1.username AS username1,
        c.user2_id,
        u2.username AS username2,
        c.started_at,
        c.last_message,
        c.last_updated,
        c.last_seen_by_user1,
        c.last_seen_by_user2,
        c.num_msgs
    FROM convs c
    INNER JOIN users u1 ON c.user1_id = u1.id
    INNER JOIN users u2 ON c.user2_id = u2.id
"#;

#[derive(FromRow)]
struct ConversationRow {
    id: Uuid,
    user1_id: Uuid,
    username1: String,
    user2_id: Uuid,
    username2: String,
    started_at: i64,
    last_message: Option<Uuid>,
    last_updated: Option<i64>,
    last_seen_by_user1: Option<i64>,
    last_seen_by_user2: Option<i64>,
    num_msgs: i64,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = RelayError;

    fn try_from(row: ConversationRow) -> RelayResult<Self> {
        Ok(Self {
            id: row.id,
            user1_id: row.user1_id,
            username1: row.username1,
            user2_id: row.user2_id,
            username2: row.username2,
            started_at: from_millis(row.started_at)?,
            last_message_id: row.last_message,
            last_updated: row.last_updated.map(from_millis).transpose()?,
            last_seen_by_user1: row.last_seen_by_user1.map(from_millis).transpose()?,
            last_seen_by_user2: row.last_seen_by_user2.map(from_millis).transpose()?,
            num_messages: row.num_msgs.max(0) as u64,
        })
    }
}

fn conv_not_found() -> RelayError {
    RelayError::missing("conv-not-found", "Conversation not found.")
}

pub struct ConversationStore<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ConversationStore<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Starts a conversation between `starter_id` and `target_id`.
    ///
    /// Rejected when the target has muted the starter, or when the pair
    /// already has a conversation in either order.
    pub async fn create(
        &self,
        users: &dyn UserDirectory,
        starter_id: Uuid,
        target_id: Uuid,
    ) -> RelayResult<Conversation> {
        if starter_id == target_id {
            return Err(RelayError::BadRequest(
                "cannot start a conversation with yourself".into(),
            ));
        }

        let starter = users.find_by_id(starter_id).await?;
        let target = users.find_by_id(target_id).await?;

        if users.has_muted(target.id, starter.id).await? {
            return Err(RelayError::forbidden("conv/user-muted", "User has muted you."));
        }

        let conv = Conversation {
            id: Uuid::new_v4(),
            user1_id: starter.id,
            username1: starter.username,
            user2_id: target.id,
            username2: target.username,
            started_at: now_millis(),
            last_message_id: None,
            last_updated: None,
            last_seen_by_user1: None,
            last_seen_by_user2: None,
            num_messages: 0,
        };

        sqlx::query(
            r#"
            INSERT INTO convs (id, user1_id, user2_id, pair_key, started_at, num_msgs)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(conv.id)
        .bind(conv.user1_id)
        .bind(conv.user2_id)
        .bind(pair_key(conv.user1_id, conv.user2_id))
        .bind(conv.started_at.timestamp_millis())
        .execute(self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RelayError::conflict(
                    "duplicate-conv",
                    "A conversation between these users already exists.",
                )
            } else {
                e.into()
            }
        })?;

        info!(conv_id = %conv.id, starter = %conv.user1_id, target = %conv.user2_id, "Conversation started");
        Ok(conv)
    }

    pub async fn get_by_id(&self, id: Uuid) -> RelayResult<Conversation> {
        let sql = format!("{SELECT_CONVS} WHERE c.id = ?");
        sqlx::query_as::<_, ConversationRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(conv_not_found)?
            .try_into()
    }

    /// Finds the conversation for a pair regardless of who started it.
    pub async fn get_by_participants(
        &self,
        user_a: Uuid,
        user_b: Uuid,
    ) -> RelayResult<Conversation> {
        let sql = format!("{SELECT_CONVS} WHERE c.pair_key = ?");
        sqlx::query_as::<_, ConversationRow>(&sql)
            .bind(pair_key(user_a, user_b))
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(conv_not_found)?
            .try_into()
    }

    /// Most recently updated first; never-updated conversations last, newest
    /// started first among them.
    ///
    /// A user with no conversations gets `NotFound` with
    /// [`NotFoundReason::EmptyResult`](crate::error::NotFoundReason::EmptyResult).
    pub async fn list_for_user(&self, user_id: Uuid) -> RelayResult<Vec<Conversation>> {
        let sql = format!(
            "{SELECT_CONVS} WHERE c.user1_id = ? OR c.user2_id = ? \
             ORDER BY c.last_updated IS NULL, c.last_updated DESC, c.started_at DESC"
        );
        let rows = sqlx::query_as::<_, ConversationRow>(&sql)
            .bind(user_id)
            .bind(user_id)
            .fetch_all(self.pool)
            .await?;

        if rows.is_empty() {
            return Err(RelayError::empty(
                "convs-not-found",
                "Conversations not found.",
            ));
        }
        rows.into_iter().map(Conversation::try_from).collect()
    }

    /// Advances the aggregate fields for an already persisted message.
    ///
    /// Prefer [`Database::append_message`](super::Database::append_message),
    /// which runs insert and update in one transaction.
    pub async fn apply_message_appended(
        &self,
        conv_id: Uuid,
        message_id: Uuid,
        num_messages: u64,
    ) -> RelayResult<()> {
        let mut conn = self.pool.acquire().await?;
        apply_message_appended(&mut conn, conv_id, message_id, num_messages).await
    }

    /// Sets only the viewer's own read marker.
    pub async fn mark_seen(
        &self,
        conv_id: Uuid,
        viewer_id: Uuid,
        at: DateTime<Utc>,
    ) -> RelayResult<Conversation> {
        let conv = self.get_by_id(conv_id).await?;

        let column = if conv.user1_id == viewer_id {
            "last_seen_by_user1"
        } else if conv.user2_id == viewer_id {
            "last_seen_by_user2"
        } else {
            return Err(RelayError::forbidden(
                "not-participant",
                "Not a participant of this conversation.",
            ));
        };

        let sql = format!("UPDATE convs SET {column} = ? WHERE id = ?");
        sqlx::query(&sql)
            .bind(at.timestamp_millis())
            .bind(conv_id)
            .execute(self.pool)
            .await?;

        self.get_by_id(conv_id).await
    }

    /// Rebuilds `numMessages`, `lastMessage` and `lastUpdated` from the
    /// message log.
    pub async fn recompute_aggregate(&self, conv_id: Uuid) -> RelayResult<Conversation> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let latest: Option<(Uuid, i64)> = sqlx::query_as(
            "SELECT id, sent_at FROM msgs WHERE conv_id = ? ORDER BY sent_at DESC, rowid DESC LIMIT 1",
        )
        .bind(conv_id)
        .fetch_optional(&mut *tx)
        .await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM msgs WHERE conv_id = ?")
            .bind(conv_id)
            .fetch_one(&mut *tx)
            .await?;

        let result = sqlx::query(
            "UPDATE convs SET last_message = ?, last_updated = ?, num_msgs = ? WHERE id = ?",
        )
        .bind(latest.map(|(id, _)| id))
        .bind(latest.map(|(_, sent_at)| sent_at))
        .bind(count)
        .bind(conv_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(conv_not_found());
        }
        tx.commit().await?;

        self.get_by_id(conv_id).await
    }
}

/// Aggregate update shared by the standalone operation and the append
/// transaction.
///
/// `num_messages` never lowers the stored counter, and `lastMessage` /
/// `lastUpdated` always name the newest message in the log, so a stale or
/// replayed call cannot rewind them.
pub(crate) async fn apply_message_appended(
    conn: &mut SqliteConnection,
    conv_id: Uuid,
    message_id: Uuid,
    num_messages: u64,
) -> RelayResult<()> {
    let known: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM msgs WHERE id = ? AND conv_id = ?")
            .bind(message_id)
            .bind(conv_id)
            .fetch_optional(&mut *conn)
            .await?;
    if known.is_none() {
        return Err(RelayError::missing("msg-not-found", "Message not found."));
    }

    let result = sqlx::query(
        r#"
        UPDATE convs SET
            last_message = (
                SELECT id FROM msgs WHERE conv_id = ?1
                ORDER BY sent_at DESC, rowid DESC LIMIT 1
            ),
            last_updated = (SELECT MAX(sent_at) FROM msgs WHERE conv_id = ?1),
            num_msgs = MAX(num_msgs, ?2)
        WHERE id = ?1
        "#,
    )
    .bind(conv_id)
    .bind(num_messages as i64)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(conv_not_found());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{ErrorKind, NotFoundReason},
        models::User,
        store::Database,
    };

    async fn setup() -> (Database, User, User, User) {
        let db = Database::in_memory().await.unwrap();
        let users = db.users();
        let alice = users.register("alice").await.unwrap();
        let bob = users.register("bob").await.unwrap();
        let carol = users.register("carol").await.unwrap();
        (db, alice, bob, carol)
    }

    #[tokio::test]
    async fn create_starts_empty() {
        let (db, alice, bob, _) = setup().await;

        let conv = db
            .conversations()
            .create(&db.users(), alice.id, bob.id)
            .await
            .unwrap();

        assert_eq!(conv.user1_id, alice.id);
        assert_eq!(conv.user2_id, bob.id);
        assert_eq!(conv.username1, "alice");
        assert_eq!(conv.num_messages, 0);
        assert!(conv.last_message_id.is_none());
        assert!(conv.last_updated.is_none());
        assert!(conv.last_seen_by_user1.is_none());

        assert_eq!(db.conversations().get_by_id(conv.id).await.unwrap(), conv);
    }

    #[tokio::test]
    async fn one_conversation_per_pair_in_either_order() {
        let (db, alice, bob, _) = setup().await;
        let users = db.users();
        let convs = db.conversations();

        convs.create(&users, alice.id, bob.id).await.unwrap();

        let same = convs.create(&users, alice.id, bob.id).await.unwrap_err();
        let reversed = convs.create(&users, bob.id, alice.id).await.unwrap_err();
        assert_eq!(same.code(), "duplicate-conv");
        assert_eq!(reversed.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn muted_starter_is_rejected_without_a_row() {
        let (db, alice, bob, carol) = setup().await;
        let users = db.users();
        users.mute(carol.id, alice.id).await.unwrap();

        let err = db
            .conversations()
            .create(&users, alice.id, carol.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(err.code(), "conv/user-muted");
        assert!(
            db.conversations()
                .get_by_participants(alice.id, carol.id)
                .await
                .is_err()
        );

        // Only the target's mutes count: Alice muting Bob does not block Alice.
        users.mute(alice.id, bob.id).await.unwrap();
        assert!(db.conversations().create(&users, alice.id, bob.id).await.is_ok());
    }

    #[tokio::test]
    async fn lookup_by_participants_is_symmetric() {
        let (db, alice, bob, carol) = setup().await;
        let conv = db
            .conversations()
            .create(&db.users(), bob.id, alice.id)
            .await
            .unwrap();

        let convs = db.conversations();
        assert_eq!(convs.get_by_participants(alice.id, bob.id).await.unwrap().id, conv.id);
        assert_eq!(convs.get_by_participants(bob.id, alice.id).await.unwrap().id, conv.id);
        assert_eq!(
            convs
                .get_by_participants(alice.id, carol.id)
                .await
                .unwrap_err()
                .not_found_reason(),
            Some(NotFoundReason::InvalidReference)
        );
    }

    #[tokio::test]
    async fn list_orders_by_last_update() {
        let (db, alice, bob, carol) = setup().await;
        let users = db.users();
        let with_bob = db.conversations().create(&users, alice.id, bob.id).await.unwrap();
        let with_carol = db.conversations().create(&users, carol.id, alice.id).await.unwrap();

        db.append_message(with_bob.id, alice.id, bob.id, "first".into())
            .await
            .unwrap();

        let listed = db.conversations().list_for_user(alice.id).await.unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![with_bob.id, with_carol.id]);

        let err = db.conversations().list_for_user(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.not_found_reason(), Some(NotFoundReason::EmptyResult));
        assert_eq!(err.code(), "convs-not-found");
    }

    #[tokio::test]
    async fn mark_seen_touches_only_the_viewer() {
        let (db, alice, bob, carol) = setup().await;
        let conv = db
            .conversations()
            .create(&db.users(), alice.id, bob.id)
            .await
            .unwrap();
        let at = from_millis(1_700_000_000_000).unwrap();

        let seen = db.conversations().mark_seen(conv.id, bob.id, at).await.unwrap();
        assert_eq!(seen.last_seen_by_user2, Some(at));
        assert!(seen.last_seen_by_user1.is_none());

        let err = db
            .conversations()
            .mark_seen(conv.id, carol.id, at)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn recompute_repairs_a_skipped_update() {
        let (db, alice, bob, _) = setup().await;
        let conv = db
            .conversations()
            .create(&db.users(), alice.id, bob.id)
            .await
            .unwrap();

        // Standalone create does not touch the aggregate.
        let msg = db
            .messages()
            .create(conv.id, alice.id, bob.id, "unaccounted".into())
            .await
            .unwrap();
        assert_eq!(db.conversations().get_by_id(conv.id).await.unwrap().num_messages, 0);

        let repaired = db.conversations().recompute_aggregate(conv.id).await.unwrap();
        assert_eq!(repaired.num_messages, 1);
        assert_eq!(repaired.last_message_id, Some(msg.id));
        assert_eq!(repaired.last_updated, Some(msg.sent_at));
    }

    #[tokio::test]
    async fn stale_apply_does_not_rewind_the_aggregate() {
        let (db, alice, bob, _) = setup().await;
        let conv = db
            .conversations()
            .create(&db.users(), alice.id, bob.id)
            .await
            .unwrap();
        let first = db.append_message(conv.id, alice.id, bob.id, "a".into()).await.unwrap();
        let second = db.append_message(conv.id, bob.id, alice.id, "b".into()).await.unwrap();

        // A stale replay of the first append.
        db.conversations()
            .apply_message_appended(conv.id, first.id, 1)
            .await
            .unwrap();

        let after = db.conversations().get_by_id(conv.id).await.unwrap();
        assert_eq!(after.num_messages, 2);
        assert_eq!(after.last_message_id, Some(second.id));
        assert_eq!(after.last_updated, Some(second.sent_at));

        let err = db
            .conversations()
            .apply_message_appended(conv.id, Uuid::new_v4(), 3)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "msg-not-found");
    }
}
