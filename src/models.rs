use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    /// The participant who started the conversation.
    pub user1_id: Uuid,
    pub username1: String,
    pub user2_id: Uuid,
    pub username2: String,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "lastMessage")]
    pub last_message_id: Option<Uuid>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_seen_by_user1: Option<DateTime<Utc>>,
    pub last_seen_by_user2: Option<DateTime<Utc>>,
    pub num_messages: u64,
}

impl Conversation {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }

    /// The other side of the conversation, if `user_id` takes part in it.
    pub fn counterpart(&self, user_id: Uuid) -> Option<Uuid> {
        if self.user1_id == user_id {
            Some(self.user2_id)
        } else if self.user2_id == user_id {
            Some(self.user1_id)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conv_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub sent_at: DateTime<Utc>,
    pub seen: bool,
    pub body: String,
}

/// Canonical key for an unordered participant pair: smaller id first.
pub fn pair_key(a: Uuid, b: Uuid) -> String {
    let (first, second) = if a < b { (a, b) } else { (b, a) };
    format!("{}_{}", first, second)
}

/// Decodes a stored Unix-millisecond timestamp.
pub(crate) fn from_millis(millis: i64) -> RelayResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| RelayError::Internal(format!("stored timestamp out of range: {millis}")))
}

/// Current time at the millisecond precision timestamps are stored with.
pub(crate) fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_ignores_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(pair_key(a, b), pair_key(b, a));
        assert_ne!(pair_key(a, b), pair_key(a, Uuid::new_v4()));
    }

    #[test]
    fn conversation_json_uses_client_field_names() {
        let conv = Conversation {
            id: Uuid::nil(),
            user1_id: Uuid::nil(),
            username1: "alice".into(),
            user2_id: Uuid::nil(),
            username2: "bob".into(),
            started_at: from_millis(0).unwrap(),
            last_message_id: None,
            last_updated: None,
            last_seen_by_user1: None,
            last_seen_by_user2: None,
            num_messages: 0,
        };

        let value = serde_json::to_value(&conv).unwrap();
        for key in [
            "id",
            "user1Id",
            "username1",
            "user2Id",
            "username2",
            "startedAt",
            "lastMessage",
            "lastUpdated",
            "lastSeenByUser1",
            "lastSeenByUser2",
            "numMessages",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert!(value["lastMessage"].is_null());
    }

    #[test]
    fn out_of_range_timestamps_are_rejected() {
        assert_eq!(from_millis(1_700_000_000_123).unwrap().timestamp_millis(), 1_700_000_000_123);
        assert!(matches!(from_millis(i64::MAX), Err(RelayError::Internal(_))));

        let now = now_millis();
        assert_eq!(from_millis(now.timestamp_millis()).unwrap(), now);
    }
}
