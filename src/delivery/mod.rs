//! Realtime delivery channel.
//!
//! Per-user push subscriptions over unbounded tokio channels. A published
//! message fans out to every session subscribed for either participant.
//! Delivery is at-least-once and best-effort: nothing is buffered for
//! sessions that are not subscribed at publish time, so consumers must
//! deduplicate by message id and catch up through store queries after a
//! dropped channel.

use crate::models::message::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

/// Unique identifier for a delivery subscriber.
///
/// Each subscription gets its own id so a reconnecting session can be
/// cleaned up precisely without disturbing other subscribers of the same
/// user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscriber {
    id: SubscriberId,
    sender: UnboundedSender<Message>,
}

/// Registry of active push subscriptions, keyed by user id.
#[derive(Default, Clone)]
pub struct DeliveryHub {
    inner: Arc<RwLock<HashMap<Uuid, Vec<Subscriber>>>>,
}

impl DeliveryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a session to "messages where I am a participant".
    pub async fn subscribe(&self, user_id: Uuid) -> (SubscriberId, UnboundedReceiver<Message>) {
        let (tx, rx) = unbounded_channel();
        let subscriber_id = SubscriberId::new();

        let mut guard = self.inner.write().await;
        guard.entry(user_id).or_default().push(Subscriber {
            id: subscriber_id,
            sender: tx,
        });

        tracing::debug!(
            user_id = %user_id,
            subscriber_id = ?subscriber_id,
            total = guard.get(&user_id).map(|v| v.len()).unwrap_or(0),
            "delivery subscriber added"
        );

        (subscriber_id, rx)
    }

    /// Remove a specific subscriber. Must be called when a session
    /// detaches; dead senders are also pruned lazily on publish.
    pub async fn unsubscribe(&self, user_id: Uuid, subscriber_id: SubscriberId) {
        let mut guard = self.inner.write().await;

        if let Some(subscribers) = guard.get_mut(&user_id) {
            let before = subscribers.len();
            subscribers.retain(|s| s.id != subscriber_id);
            if subscribers.len() != before {
                tracing::debug!(
                    user_id = %user_id,
                    subscriber_id = ?subscriber_id,
                    remaining = subscribers.len(),
                    "delivery subscriber removed"
                );
            }
            if subscribers.is_empty() {
                guard.remove(&user_id);
            }
        }
    }

    /// Push a newly appended message to every active session of both
    /// participants. Subscribers whose channel is gone are dropped.
    pub async fn publish(&self, message: &Message) {
        let mut guard = self.inner.write().await;

        for user_id in [message.sender_id, message.receiver_id] {
            if let Some(subscribers) = guard.get_mut(&user_id) {
                let before = subscribers.len();
                subscribers.retain(|subscriber| subscriber.sender.send(message.clone()).is_ok());
                let after = subscribers.len();

                if before != after {
                    tracing::debug!(
                        user_id = %user_id,
                        pruned = before - after,
                        active = after,
                        "pruned dead delivery subscribers"
                    );
                }
                if subscribers.is_empty() {
                    guard.remove(&user_id);
                }
            }
        }
    }

    pub async fn subscriber_count(&self, user_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard.get(&user_id).map(|v| v.len()).unwrap_or(0)
    }
}
