use crate::models::message::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-counterpart rollup of a user's message history.
///
/// Conversations are never stored; they are computed by grouping a user's
/// messages by counterpart. A conversation exists iff at least one message
/// exists for the pair, and disappears once all such messages are deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub counterpart_id: Uuid,
    pub last_message: Message,
    /// Count of messages from the counterpart that this user has not read.
    pub unread_count: u64,
}
