//! In-memory message store.
//!
//! Backs every test in the crate and is sufficient for single-process
//! deployments. Keeps rows ordered by (created_at, insertion sequence) so
//! backdated seed messages land at their nominal position while ties
//! between concurrent appends stay stable.

use crate::error::AppResult;
use crate::models::conversation::ConversationSummary;
use crate::models::message::Message;
use crate::store::{group_by_counterpart, validate_append, MessageStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    rows: Vec<Row>,
    next_seq: u64,
}

struct Row {
    seq: u64,
    message: Message,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> AppResult<Message> {
        let content = validate_append(sender_id, receiver_id, content)?;
        let message = Message {
            id: Uuid::new_v4(),
            sender_id,
            receiver_id,
            content,
            created_at,
            read: false,
        };

        let mut inner = self.inner.write().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let key = (created_at, seq);
        let pos = inner
            .rows
            .partition_point(|row| (row.message.created_at, row.seq) <= key);
        inner.rows.insert(
            pos,
            Row {
                seq,
                message: message.clone(),
            },
        );

        Ok(message)
    }
}

fn is_pair(message: &Message, user_a: Uuid, user_b: Uuid) -> bool {
    (message.sender_id == user_a && message.receiver_id == user_b)
        || (message.sender_id == user_b && message.receiver_id == user_a)
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
    ) -> AppResult<Message> {
        self.insert(sender_id, receiver_id, content, Utc::now()).await
    }

    async fn append_at(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> AppResult<Message> {
        self.insert(sender_id, receiver_id, content, created_at).await
    }

    async fn list_between(&self, user_a: Uuid, user_b: Uuid) -> AppResult<Vec<Message>> {
        let inner = self.inner.read().await;
        Ok(inner
            .rows
            .iter()
            .filter(|row| is_pair(&row.message, user_a, user_b))
            .map(|row| row.message.clone())
            .collect())
    }

    async fn list_conversations_for(&self, user_id: Uuid) -> AppResult<Vec<ConversationSummary>> {
        let inner = self.inner.read().await;
        let involving: Vec<Message> = inner
            .rows
            .iter()
            .filter(|row| row.message.involves(user_id))
            .map(|row| row.message.clone())
            .collect();
        Ok(group_by_counterpart(user_id, &involving))
    }

    async fn mark_read(&self, receiver_id: Uuid, sender_id: Uuid) -> AppResult<u64> {
        let mut inner = self.inner.write().await;
        let mut transitions = 0;
        for row in inner.rows.iter_mut() {
            if row.message.receiver_id == receiver_id
                && row.message.sender_id == sender_id
                && !row.message.read
            {
                row.message.read = true;
                transitions += 1;
            }
        }
        Ok(transitions)
    }

    async fn delete_between(&self, user_a: Uuid, user_b: Uuid) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.rows.retain(|row| !is_pair(&row.message, user_a, user_b));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use chrono::Duration;

    #[tokio::test]
    async fn append_then_list_returns_it_last() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.append(a, b, "first").await.unwrap();
        let appended = store.append(a, b, "second").await.unwrap();

        let listed = store.list_between(a, b).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed.last().unwrap().id, appended.id);
        assert!(listed
            .iter()
            .filter(|m| m.id == appended.id)
            .count() == 1);
    }

    #[tokio::test]
    async fn list_between_is_symmetric_and_ordered() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.append(a, b, "one").await.unwrap();
        store.append(b, a, "two").await.unwrap();
        store.append(a, b, "three").await.unwrap();

        let forward = store.list_between(a, b).await.unwrap();
        let backward = store.list_between(b, a).await.unwrap();
        let contents: Vec<&str> = forward.iter().map(|m| m.content.as_str()).collect();

        assert_eq!(contents, vec!["one", "two", "three"]);
        assert_eq!(forward.len(), backward.len());
    }

    #[tokio::test]
    async fn recent_listing_keeps_only_the_newest_messages() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.append(a, b, "one").await.unwrap();
        store.append(b, a, "two").await.unwrap();
        store.append(a, b, "three").await.unwrap();

        let recent = store.list_recent_between(a, b, 2).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn backdated_append_sorts_by_nominal_time() {
        let store = MemoryStore::new();
        let tutor = Uuid::new_v4();
        let student = Uuid::new_v4();

        store.append(student, tutor, "live message").await.unwrap();
        let backdated_at = Utc::now() - Duration::hours(1);
        store
            .append_at(tutor, student, "earlier response", backdated_at)
            .await
            .unwrap();

        let listed = store.list_between(student, tutor).await.unwrap();
        assert_eq!(listed[0].content, "earlier response");
        assert_eq!(listed[1].content, "live message");
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.append(a, b, "one").await.unwrap();
        store.append(a, b, "two").await.unwrap();

        assert_eq!(store.mark_read(b, a).await.unwrap(), 2);
        assert_eq!(store.mark_read(b, a).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_read_only_touches_the_given_direction() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.append(a, b, "to b").await.unwrap();
        store.append(b, a, "to a").await.unwrap();

        assert_eq!(store.mark_read(b, a).await.unwrap(), 1);
        let listed = store.list_between(a, b).await.unwrap();
        let to_a = listed.iter().find(|m| m.receiver_id == a).unwrap();
        assert!(!to_a.read);
    }

    #[tokio::test]
    async fn delete_between_removes_both_directions_only_for_the_pair() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        store.append(a, b, "a to b").await.unwrap();
        store.append(b, a, "b to a").await.unwrap();
        store.append(a, c, "a to c").await.unwrap();

        store.delete_between(a, b).await.unwrap();

        assert!(store.list_between(a, b).await.unwrap().is_empty());
        assert_eq!(store.list_between(a, c).await.unwrap().len(), 1);
        // The conversation disappears once its messages are gone.
        let summaries = store.list_conversations_for(a).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].counterpart_id, c);
    }

    #[tokio::test]
    async fn append_rejects_invalid_input() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(matches!(
            store.append(a, a, "hi").await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            store.append(a, b, "  \n ").await,
            Err(AppError::BadRequest(_))
        ));
        assert!(store.list_between(a, b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn content_is_stored_trimmed() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let message = store.append(a, b, "  hello  ").await.unwrap();
        assert_eq!(message.content, "hello");
    }
}
