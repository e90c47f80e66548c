use crate::error::{AppError, AppResult};
use crate::models::conversation::ConversationSummary;
use crate::models::message::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// The durable, append-only record of messages. Single source of truth:
/// every other component (conversation index, badge, open-conversation
/// view) is a derived cache that reconciles against it.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Durably append a message with a server-assigned id and timestamp.
    ///
    /// Rejects identical sender/receiver and content that is empty after
    /// trimming with `AppError::BadRequest` (never retried by callers);
    /// transport failures surface as retryable errors.
    async fn append(&self, sender_id: Uuid, receiver_id: Uuid, content: &str)
        -> AppResult<Message>;

    /// Append with an explicit creation timestamp. Used by the seed
    /// injector to place cross-workflow messages at their nominal time.
    async fn append_at(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> AppResult<Message>;

    /// All messages between the pair, both directions, ascending by
    /// creation time. A stable snapshot: concurrent appends are simply
    /// not included.
    async fn list_between(&self, user_a: Uuid, user_b: Uuid) -> AppResult<Vec<Message>>;

    /// The most recent `limit` messages between the pair, ascending by
    /// creation time. Backends with server-side pagination override this;
    /// the default trims a full fetch.
    async fn list_recent_between(
        &self,
        user_a: Uuid,
        user_b: Uuid,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        let mut messages = self.list_between(user_a, user_b).await?;
        if messages.len() > limit {
            let excess = messages.len() - limit;
            messages.drain(..excess);
        }
        Ok(messages)
    }

    /// Conversation summaries for a user, most recent message first.
    async fn list_conversations_for(&self, user_id: Uuid) -> AppResult<Vec<ConversationSummary>>;

    /// Flip `read` on every unread message from `sender_id` to
    /// `receiver_id`; returns the number of transitions. Idempotent.
    async fn mark_read(&self, receiver_id: Uuid, sender_id: Uuid) -> AppResult<u64>;

    /// Remove all messages for the pair, both directions, atomically from
    /// the caller's point of view.
    async fn delete_between(&self, user_a: Uuid, user_b: Uuid) -> AppResult<()>;
}

/// Shared append validation: distinct parties, non-empty trimmed content.
/// Returns the trimmed content that gets stored.
pub(crate) fn validate_append(
    sender_id: Uuid,
    receiver_id: Uuid,
    content: &str,
) -> AppResult<String> {
    if sender_id == receiver_id {
        return Err(AppError::BadRequest(
            "sender and receiver must be distinct".to_string(),
        ));
    }
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "message content cannot be empty".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

/// Group a user's messages by counterpart into conversation summaries.
///
/// `messages` must be ascending by creation time. Both store backends
/// fetch everything involving the user and derive the grouping here, so
/// the two stay behaviorally identical.
pub(crate) fn group_by_counterpart(user_id: Uuid, messages: &[Message]) -> Vec<ConversationSummary> {
    let mut groups: HashMap<Uuid, (Message, u64)> = HashMap::new();

    for message in messages {
        let Some(counterpart_id) = message.counterpart_of(user_id) else {
            continue;
        };
        let unread = u64::from(message.receiver_id == user_id && !message.read);

        match groups.entry(counterpart_id) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let (last, count) = entry.get_mut();
                *count += unread;
                if message.created_at >= last.created_at {
                    *last = message.clone();
                }
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert((message.clone(), unread));
            }
        }
    }

    let mut summaries: Vec<ConversationSummary> = groups
        .into_iter()
        .map(|(counterpart_id, (last_message, unread_count))| ConversationSummary {
            counterpart_id,
            last_message,
            unread_count,
        })
        .collect();

    summaries.sort_by(|a, b| b.last_message.created_at.cmp(&a.last_message.created_at));
    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(sender_id: Uuid, receiver_id: Uuid, content: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id,
            receiver_id,
            content: content.to_string(),
            created_at: at,
            read: false,
        }
    }

    #[test]
    fn validate_rejects_self_send_and_blank_content() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(matches!(
            validate_append(a, a, "hi"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            validate_append(a, b, "   "),
            Err(AppError::BadRequest(_))
        ));
        assert_eq!(validate_append(a, b, "  hi  ").unwrap(), "hi");
    }

    #[test]
    fn grouping_takes_latest_message_and_counts_unread() {
        let me = Uuid::new_v4();
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        let t0 = Utc::now();

        let messages = vec![
            message(x, me, "first", t0),
            message(me, x, "reply", t0 + Duration::seconds(1)),
            message(x, me, "second", t0 + Duration::seconds(2)),
            message(y, me, "hello", t0 + Duration::seconds(3)),
        ];

        let summaries = group_by_counterpart(me, &messages);
        assert_eq!(summaries.len(), 2);

        // Most recent conversation first.
        assert_eq!(summaries[0].counterpart_id, y);
        assert_eq!(summaries[0].unread_count, 1);
        assert_eq!(summaries[1].counterpart_id, x);
        assert_eq!(summaries[1].last_message.content, "second");
        // Only the two inbound messages count as unread.
        assert_eq!(summaries[1].unread_count, 2);
    }

    #[test]
    fn grouping_ignores_foreign_messages() {
        let me = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let messages = vec![message(a, b, "not mine", Utc::now())];
        assert!(group_by_counterpart(me, &messages).is_empty());
    }
}
