use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{ConversationId, MessageBody, MessageId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: ConversationId,
    /// Participant pair, order-normalized so `user_a.0 <= user_b.0`.
    pub user_a: UserId,
    pub user_b: UserId,
    pub last_activity_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn other_participant(&self, me: UserId) -> UserId {
        if self.user_a == me {
            self.user_b
        } else {
            self.user_a
        }
    }
}

/// Server-confirmed message row as delivered over the wire.
///
/// `client_ref` is the client-generated correlation id: set on the send
/// request and echoed back on the confirmed record so the sender can
/// reconcile its provisional entry with an exact key match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: MessageBody,
    pub read: bool,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: MessageBody,
    pub client_ref: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeEvent {
    MessageInserted { message: MessageRecord },
    MessageUpdated { message: MessageRecord },
    Error(ApiError),
}

impl RealtimeEvent {
    /// Topic key the event belongs to, used to route it to the right
    /// channel registration.
    pub fn topic(&self) -> Option<String> {
        match self {
            RealtimeEvent::MessageInserted { message }
            | RealtimeEvent::MessageUpdated { message } => {
                Some(conversation_topic(message.conversation_id))
            }
            RealtimeEvent::Error(_) => None,
        }
    }

    /// Deduplication key: event kind plus identifier, with the read flag
    /// folded into update keys so a genuine flag change is not suppressed
    /// by an earlier update to the same row.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            RealtimeEvent::MessageInserted { message } => {
                Some(format!("new:{}", message.message_id.0))
            }
            RealtimeEvent::MessageUpdated { message } => Some(format!(
                "update:{}:{}",
                message.message_id.0, message.read
            )),
            RealtimeEvent::Error(_) => None,
        }
    }
}

pub fn conversation_topic(conversation_id: ConversationId) -> String {
    format!("conversation:{}", conversation_id.0)
}
