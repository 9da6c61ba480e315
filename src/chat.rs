use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{RelayError, RelayResult},
    models::{Conversation, Message},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeType {
    #[serde(rename = "New Message")]
    NewMessage,
    #[serde(rename = "New Conversation")]
    NewConversation,
}

/// Server -> client notification pushed over the persistent connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub msg: Option<Message>,
    pub conv: Option<Conversation>,
}

impl Envelope {
    pub fn new_message(msg: Message) -> Self {
        Self {
            kind: EnvelopeType::NewMessage,
            msg: Some(msg),
            conv: None,
        }
    }

    pub fn new_conversation(conv: Conversation) -> Self {
        Self {
            kind: EnvelopeType::NewConversation,
            msg: None,
            conv: Some(conv),
        }
    }

    pub fn to_bytes(&self) -> RelayResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RelayError::Internal(format!("encode envelope: {e}")))
    }

    pub fn from_bytes(payload: &[u8]) -> RelayResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Client -> server frame asking the relay to send a direct message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    pub conv_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub body: String,
}

impl InboundFrame {
    pub fn parse(text: &str) -> RelayResult<Self> {
        serde_json::from_str(text).map_err(|e| RelayError::BadRequest(format!("malformed frame: {e}")))
    }
}
