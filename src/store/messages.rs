use sqlx::{FromRow, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{
    error::{RelayError, RelayResult, is_unique_violation},
    models::{Message, from_millis, now_millis},
};

#[derive(FromRow)]
struct MessageRow {
    id: Uuid,
    conv_id: Uuid,
    sender_id: Uuid,
    receiver_id: Uuid,
    sent_at: i64,
    seen: bool,
    body: String,
}

impl TryFrom<MessageRow> for Message {
    type Error = RelayError;

    fn try_from(row: MessageRow) -> RelayResult<Self> {
        Ok(Self {
            id: row.id,
            conv_id: row.conv_id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            sent_at: from_millis(row.sent_at)?,
            seen: row.seen,
            body: row.body,
        })
    }
}

const SELECT_MSGS: &str =
    "SELECT id, conv_id, sender_id, receiver_id, sent_at, seen, body FROM msgs";

pub struct MessageStore<'a> {
    pool: &'a SqlitePool,
}

impl<'a> MessageStore<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a message without touching the conversation aggregate.
    ///
    /// The relay uses [`Database::append_message`](super::Database::append_message);
    /// anything calling this directly must follow up with
    /// [`ConversationStore::recompute_aggregate`](super::ConversationStore::recompute_aggregate).
    pub async fn create(
        &self,
        conv_id: Uuid,
        sender_id: Uuid,
        receiver_id: Uuid,
        body: String,
    ) -> RelayResult<Message> {
        let mut conn = self.pool.acquire().await?;
        insert_message(&mut conn, conv_id, sender_id, receiver_id, body).await
    }

    /// Oldest first.
    pub async fn list_for_conversation(&self, conv_id: Uuid) -> RelayResult<Vec<Message>> {
        let sql = format!("{SELECT_MSGS} WHERE conv_id = ? ORDER BY sent_at ASC, rowid ASC");
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(conv_id)
            .fetch_all(self.pool)
            .await?;

        if rows.is_empty() {
            return Err(RelayError::empty(
                "msgs-not-found",
                "Messages not found for this conversation.",
            ));
        }
        rows.into_iter().map(Message::try_from).collect()
    }

    pub async fn get_by_id(&self, id: Uuid) -> RelayResult<Message> {
        let sql = format!("{SELECT_MSGS} WHERE id = ?");
        sqlx::query_as::<_, MessageRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| RelayError::missing("msg-not-found", "Message not found."))?
            .try_into()
    }

    /// Only the receiver may flag a message as seen.
    pub async fn mark_seen(&self, id: Uuid, viewer_id: Uuid) -> RelayResult<Message> {
        let mut msg = self.get_by_id(id).await?;
        if msg.receiver_id != viewer_id {
            return Err(RelayError::forbidden(
                "not-receiver",
                "Only the receiver can mark a message as seen.",
            ));
        }

        sqlx::query("UPDATE msgs SET seen = 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;

        msg.seen = true;
        Ok(msg)
    }
}

pub(crate) async fn insert_message(
    conn: &mut SqliteConnection,
    conv_id: Uuid,
    sender_id: Uuid,
    receiver_id: Uuid,
    body: String,
) -> RelayResult<Message> {
    let participants: Option<(Uuid, Uuid)> =
        sqlx::query_as("SELECT user1_id, user2_id FROM convs WHERE id = ?")
            .bind(conv_id)
            .fetch_optional(&mut *conn)
            .await?;
    let Some((user1, user2)) = participants else {
        return Err(RelayError::missing("conv-not-found", "Conversation not found."));
    };

    let matches_pair = (sender_id == user1 && receiver_id == user2)
        || (sender_id == user2 && receiver_id == user1);
    if !matches_pair {
        return Err(RelayError::BadRequest(
            "sender and receiver must be the conversation's participants".into(),
        ));
    }

    let msg = Message {
        id: Uuid::new_v4(),
        conv_id,
        sender_id,
        receiver_id,
        sent_at: now_millis(),
        seen: false,
        body,
    };

    sqlx::query(
        r#"
        INSERT INTO msgs (id, conv_id, sender_id, receiver_id, sent_at, seen, body)
        VALUES (?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(msg.id)
    .bind(msg.conv_id)
    .bind(msg.sender_id)
    .bind(msg.receiver_id)
    .bind(msg.sent_at.timestamp_millis())
    .bind(&msg.body)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            RelayError::conflict("duplicate-row", "This message already exists.")
        } else {
            e.into()
        }
    })?;

    Ok(msg)
}

pub(crate) async fn count_for_conversation(
    conn: &mut SqliteConnection,
    conv_id: Uuid,
) -> RelayResult<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM msgs WHERE conv_id = ?")
        .bind(conv_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{ErrorKind, NotFoundReason},
        models::{Conversation, User},
        store::Database,
    };

    async fn setup() -> (Database, User, User, Conversation) {
        let db = Database::in_memory().await.unwrap();
        let users = db.users();
        let alice = users.register("alice").await.unwrap();
        let bob = users.register("bob").await.unwrap();
        let conv = db
            .conversations()
            .create(&users, alice.id, bob.id)
            .await
            .unwrap();
        (db, alice, bob, conv)
    }

    #[tokio::test]
    async fn aggregate_tracks_every_append() {
        let (db, alice, bob, conv) = setup().await;

        let mut last = None;
        for i in 0..5 {
            let (from, to) = if i % 2 == 0 { (alice.id, bob.id) } else { (bob.id, alice.id) };
            last = Some(db.append_message(conv.id, from, to, format!("msg {i}")).await.unwrap());
        }
        let last = last.unwrap();

        let conv = db.conversations().get_by_id(conv.id).await.unwrap();
        assert_eq!(conv.num_messages, 5);
        assert_eq!(conv.last_message_id, Some(last.id));
        assert_eq!(conv.last_updated, Some(last.sent_at));
    }

    #[tokio::test]
    async fn list_is_oldest_first() {
        let (db, alice, bob, conv) = setup().await;
        for body in ["one", "two", "three"] {
            db.append_message(conv.id, alice.id, bob.id, body.into())
                .await
                .unwrap();
        }

        let msgs = db.messages().list_for_conversation(conv.id).await.unwrap();
        let bodies: Vec<&str> = msgs.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
        assert!(msgs.windows(2).all(|w| w[0].sent_at <= w[1].sent_at));
    }

    #[tokio::test]
    async fn empty_conversation_lists_as_not_found() {
        let (db, _, _, conv) = setup().await;
        let err = db.messages().list_for_conversation(conv.id).await.unwrap_err();
        assert_eq!(err.code(), "msgs-not-found");
        assert_eq!(err.not_found_reason(), Some(NotFoundReason::EmptyResult));
    }

    #[tokio::test]
    async fn unknown_conversation_is_an_invalid_reference() {
        let (db, alice, bob, _) = setup().await;
        let err = db
            .append_message(Uuid::new_v4(), alice.id, bob.id, "hi".into())
            .await
            .unwrap_err();
        assert_eq!(err.not_found_reason(), Some(NotFoundReason::InvalidReference));
        assert_eq!(err.code(), "conv-not-found");
    }

    #[tokio::test]
    async fn outsiders_cannot_post() {
        let (db, alice, _, conv) = setup().await;
        let mallory = db.users().register("mallory").await.unwrap();

        let err = db
            .append_message(conv.id, mallory.id, alice.id, "hi".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let err = db
            .append_message(conv.id, alice.id, alice.id, "hi".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let conv = db.conversations().get_by_id(conv.id).await.unwrap();
        assert_eq!(conv.num_messages, 0);
    }

    #[tokio::test]
    async fn failed_append_leaves_no_message_behind() {
        let (db, alice, bob, conv) = setup().await;
        // The insert succeeds, the aggregate update then aborts.
        sqlx::query(
            "CREATE TRIGGER fail_aggregate BEFORE UPDATE ON convs \
             BEGIN SELECT RAISE(ABORT, 'aggregate unavailable'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        assert!(
            db.append_message(conv.id, alice.id, bob.id, "lost".into())
                .await
                .is_err()
        );

        let err = db.messages().list_for_conversation(conv.id).await.unwrap_err();
        assert_eq!(err.not_found_reason(), Some(NotFoundReason::EmptyResult));
    }

    #[tokio::test]
    async fn only_the_receiver_marks_seen() {
        let (db, alice, bob, conv) = setup().await;
        let msg = db
            .append_message(conv.id, alice.id, bob.id, "hi".into())
            .await
            .unwrap();
        assert!(!msg.seen);

        let err = db.messages().mark_seen(msg.id, alice.id).await.unwrap_err();
        assert_eq!(err.code(), "not-receiver");

        assert!(db.messages().mark_seen(msg.id, bob.id).await.unwrap().seen);
        assert!(db.messages().get_by_id(msg.id).await.unwrap().seen);
    }
}
