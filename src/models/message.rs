use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A durably stored direct message between two users.
///
/// Immutable once written, except the `read` flag which the receiver's
/// session flips exactly once. `read` is only meaningful from the
/// receiver's perspective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    pub fn involves(&self, user_id: Uuid) -> bool {
        self.sender_id == user_id || self.receiver_id == user_id
    }

    /// The other party of the pair, or `None` if `user_id` is not a
    /// participant.
    pub fn counterpart_of(&self, user_id: Uuid) -> Option<Uuid> {
        if self.sender_id == user_id {
            Some(self.receiver_id)
        } else if self.receiver_id == user_id {
            Some(self.sender_id)
        } else {
            None
        }
    }
}

/// A client-local message rendered before the server has confirmed it.
///
/// Owned exclusively by the sending session and reconciled against the
/// durable record by `local_id`, never by content (content can
/// legitimately repeat).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionalMessage {
    pub local_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Entry in the open conversation's render list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ViewMessage {
    Delivered(Message),
    Pending(ProvisionalMessage),
}

impl ViewMessage {
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            ViewMessage::Delivered(m) => m.created_at,
            ViewMessage::Pending(p) => p.created_at,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ViewMessage::Delivered(m) => &m.content,
            ViewMessage::Pending(p) => &p.content,
        }
    }

    pub fn delivered(&self) -> Option<&Message> {
        match self {
            ViewMessage::Delivered(m) => Some(m),
            ViewMessage::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ViewMessage::Pending(_))
    }
}

/// Transient payload describing a "first message" that another workflow
/// wants materialized into a conversation. Never persisted on its own;
/// it exists only long enough for the seed injector to decide whether a
/// matching message already exists.
#[derive(Debug, Clone)]
pub struct SeedContext {
    pub counterpart_id: Uuid,
    pub content: String,
    pub nominal_timestamp: DateTime<Utc>,
}

/// Event consumed from the requirement-matching collaborator: a tutor
/// responded to a posted requirement and the response should appear as
/// chat content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementResponse {
    pub tutor_id: Uuid,
    pub message: String,
    pub responded_at: DateTime<Utc>,
}

impl From<RequirementResponse> for SeedContext {
    fn from(event: RequirementResponse) -> Self {
        SeedContext {
            counterpart_id: event.tutor_id,
            content: event.message,
            nominal_timestamp: event.responded_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender_id: Uuid, receiver_id: Uuid) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id,
            receiver_id,
            content: "hello".to_string(),
            created_at: Utc::now(),
            read: false,
        }
    }

    #[test]
    fn counterpart_resolution() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let other = Uuid::new_v4();
        let msg = message(a, b);

        assert_eq!(msg.counterpart_of(a), Some(b));
        assert_eq!(msg.counterpart_of(b), Some(a));
        assert_eq!(msg.counterpart_of(other), None);
        assert!(msg.involves(a) && msg.involves(b) && !msg.involves(other));
    }
}
