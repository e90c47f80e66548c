//! Per-user chat session.
//!
//! Drives one user's view of the conversation system from a single-task
//! event loop: the optimistic send protocol, read-state tracking and badge
//! propagation, idempotent seed injection, conversation erasure, and the
//! catch-up path for a dropped delivery channel.

use crate::badge::BadgeBus;
use crate::config::Config;
use crate::delivery::{DeliveryHub, SubscriberId};
use crate::error::{AppError, AppResult};
use crate::models::conversation::ConversationSummary;
use crate::models::message::{
    Message, ProvisionalMessage, RequirementResponse, SeedContext, ViewMessage,
};
use crate::notify::{truncate_message_preview, NotificationSummary, Notifier};
use crate::state::AppState;
use crate::store::MessageStore;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use uuid::Uuid;

/// An optimistic write awaiting server confirmation. Matched back by
/// `local_id`; the (receiver, content, started_at) triple only exists to
/// recognize the delivery channel echoing our own in-flight append.
struct PendingSend {
    local_id: Uuid,
    receiver_id: Uuid,
    content: String,
    started_at: chrono::DateTime<Utc>,
}

struct OpenConversation {
    counterpart_id: Uuid,
    messages: Vec<ViewMessage>,
}

pub struct ChatSession {
    user_id: Uuid,
    store: Arc<dyn MessageStore>,
    hub: DeliveryHub,
    badge: BadgeBus,
    notifier: Arc<dyn Notifier>,
    config: Arc<Config>,
    subscriber_id: SubscriberId,
    pushes: UnboundedReceiver<Message>,
    open: Option<OpenConversation>,
    index: Vec<ConversationSummary>,
    pending: Vec<PendingSend>,
    /// Message ids this session has already accounted for, view- or
    /// badge-wise. Push and catch-up query race freely; this is the
    /// dedup point between the two sources.
    seen: HashSet<Uuid>,
    seeds_in_flight: HashSet<(Uuid, String)>,
}

impl ChatSession {
    pub(crate) async fn attach(state: &AppState, user_id: Uuid) -> Self {
        let (subscriber_id, pushes) = state.hub.subscribe(user_id).await;
        Self {
            user_id,
            store: state.store.clone(),
            hub: state.hub.clone(),
            badge: state.badge.clone(),
            notifier: state.notifier.clone(),
            config: state.config.clone(),
            subscriber_id,
            pushes,
            open: None,
            index: Vec::new(),
            pending: Vec::new(),
            seen: HashSet::new(),
            seeds_in_flight: HashSet::new(),
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// The currently open conversation's render list, oldest first.
    pub fn messages(&self) -> &[ViewMessage] {
        self.open.as_ref().map(|o| o.messages.as_slice()).unwrap_or(&[])
    }

    pub fn open_counterpart(&self) -> Option<Uuid> {
        self.open.as_ref().map(|o| o.counterpart_id)
    }

    /// Cached conversation index as of the last refresh or push.
    pub fn conversation_index(&self) -> &[ConversationSummary] {
        &self.index
    }

    /// Refresh the conversation index from the store.
    pub async fn conversations(&mut self) -> AppResult<&[ConversationSummary]> {
        self.index = self.store.list_conversations_for(self.user_id).await?;
        Ok(&self.index)
    }

    /// Open a conversation: load history, mark everything from the
    /// counterpart read, and emit the matching badge decrement.
    pub async fn open_conversation(&mut self, counterpart_id: Uuid) -> AppResult<()> {
        let mut history = self
            .store
            .list_recent_between(self.user_id, counterpart_id, self.config.history_limit)
            .await?;

        let transitioned = self.store.mark_read(self.user_id, counterpart_id).await?;
        if transitioned > 0 {
            self.badge.decrease(self.user_id, transitioned);
        }

        // Reflect the mark-read locally; no re-fetch needed.
        for message in &mut history {
            if message.receiver_id == self.user_id {
                message.read = true;
            }
        }
        for message in &history {
            self.seen.insert(message.id);
        }
        if let Some(summary) = self
            .index
            .iter_mut()
            .find(|c| c.counterpart_id == counterpart_id)
        {
            summary.unread_count = 0;
        }

        self.open = Some(OpenConversation {
            counterpart_id,
            messages: history.into_iter().map(ViewMessage::Delivered).collect(),
        });
        Ok(())
    }

    pub fn close_conversation(&mut self) {
        self.open = None;
    }

    /// Send a message to the open conversation's counterpart.
    ///
    /// Three-phase optimistic protocol: render a provisional entry, append
    /// durably (bounded by the send timeout), then reconcile the
    /// provisional by local id or roll it back and surface the error.
    pub async fn send(&mut self, content: &str) -> AppResult<Message> {
        let counterpart_id = match &self.open {
            Some(open) => open.counterpart_id,
            None => {
                return Err(AppError::BadRequest(
                    "no conversation is open".to_string(),
                ))
            }
        };

        let trimmed = content.trim();
        if trimmed.is_empty() {
            // Rejected without touching the view.
            return Err(AppError::BadRequest(
                "message content cannot be empty".to_string(),
            ));
        }

        let provisional = ProvisionalMessage {
            local_id: Uuid::new_v4(),
            receiver_id: counterpart_id,
            content: trimmed.to_string(),
            created_at: Utc::now(),
        };
        let local_id = provisional.local_id;

        self.pending.push(PendingSend {
            local_id,
            receiver_id: counterpart_id,
            content: trimmed.to_string(),
            started_at: provisional.created_at,
        });
        if let Some(open) = self.open.as_mut() {
            open.messages.push(ViewMessage::Pending(provisional));
        }

        let appended = match timeout(
            self.config.send_timeout(),
            self.store.append(self.user_id, counterpart_id, trimmed),
        )
        .await
        {
            Ok(Ok(message)) => message,
            Ok(Err(err)) => {
                self.rollback_pending(local_id);
                return Err(err);
            }
            Err(_) => {
                // The write may still land server-side; the user retries as
                // a fresh send if it did not.
                self.rollback_pending(local_id);
                return Err(AppError::Timeout {
                    timeout_ms: self.config.send_timeout_ms,
                });
            }
        };

        self.reconcile_pending(local_id, &appended);
        self.touch_index(&appended, 0);
        self.hub.publish(&appended).await;

        // Best-effort notification; failure is logged and dropped.
        let summary = NotificationSummary {
            sender_id: self.user_id,
            preview: truncate_message_preview(&appended.content, self.config.preview_max_chars),
        };
        if let Err(err) = self.notifier.notify(counterpart_id, summary).await {
            tracing::warn!(
                receiver_id = %counterpart_id,
                message_id = %appended.id,
                error = %err,
                "notification enqueue failed, dropping"
            );
        }

        Ok(appended)
    }

    /// Apply everything currently queued on the delivery channel.
    ///
    /// A failing message does not block the ones queued behind it; the
    /// whole queue is attempted and the first error returned afterwards.
    pub async fn drain_pushes(&mut self) -> AppResult<()> {
        let mut incoming = Vec::new();
        while let Ok(message) = self.pushes.try_recv() {
            incoming.push(message);
        }
        let mut first_error = None;
        for message in incoming {
            if let Err(err) = self.handle_incoming(message).await {
                tracing::warn!(error = %err, "failed to apply pushed message");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Idempotently materialize a seed message from a cross-workflow
    /// event. Safe to call repeatedly with the same arguments; at most one
    /// visible message results.
    pub async fn ensure_seed_message(&mut self, ctx: SeedContext) -> AppResult<Option<Message>> {
        let guard_key = (ctx.counterpart_id, ctx.content.clone());
        if !self.seeds_in_flight.insert(guard_key.clone()) {
            // A racing trigger in this session is already materializing it.
            return Ok(None);
        }
        let result = self.seed_inner(&ctx).await;
        self.seeds_in_flight.remove(&guard_key);
        result
    }

    pub async fn apply_requirement_response(
        &mut self,
        event: RequirementResponse,
    ) -> AppResult<Option<Message>> {
        self.ensure_seed_message(event.into()).await
    }

    /// Erase the conversation with a counterpart. One-sided in visible
    /// effect: the counterpart gets no realtime notice, their next query
    /// simply stops returning these messages.
    pub async fn delete_conversation(&mut self, counterpart_id: Uuid) -> AppResult<()> {
        // The cached index entry can be stale or missing; count the unread
        // rows being erased in the store itself so the badge decrement
        // matches truth.
        let unread = self
            .store
            .list_between(self.user_id, counterpart_id)
            .await?
            .iter()
            .filter(|m| m.receiver_id == self.user_id && !m.read)
            .count() as u64;

        self.store.delete_between(self.user_id, counterpart_id).await?;

        if unread > 0 {
            self.badge.decrease(self.user_id, unread);
        }
        if let Some(pos) = self
            .index
            .iter()
            .position(|c| c.counterpart_id == counterpart_id)
        {
            self.index.remove(pos);
        }
        if self
            .open
            .as_ref()
            .is_some_and(|o| o.counterpart_id == counterpart_id)
        {
            self.open = None;
        }
        Ok(())
    }

    /// Catch-up query after a dropped or silent delivery channel: refresh
    /// the index, correct the badge for unread the channel never carried,
    /// re-fetch the open conversation merging by message id, and re-run
    /// mark-read for anything that arrived unseen.
    pub async fn resync(&mut self) -> AppResult<()> {
        self.drain_pushes().await?;

        let fresh = self.store.list_conversations_for(self.user_id).await?;
        // Messages that reached the store while no push was live never
        // produced an increment. Emitting the shortfall here keeps every
        // mark-read decrement paired with an earlier increase.
        let accounted: u64 = self.index.iter().map(|c| c.unread_count).sum();
        let actual: u64 = fresh.iter().map(|c| c.unread_count).sum();
        if actual > accounted {
            self.badge.increase(self.user_id, actual - accounted);
        } else if accounted > actual {
            self.badge.decrease(self.user_id, accounted - actual);
        }
        self.index = fresh;

        let Some(counterpart_id) = self.open.as_ref().map(|o| o.counterpart_id) else {
            return Ok(());
        };

        let mut history = self
            .store
            .list_recent_between(self.user_id, counterpart_id, self.config.history_limit)
            .await?;

        let transitioned = self.store.mark_read(self.user_id, counterpart_id).await?;
        if transitioned > 0 {
            self.badge.decrease(self.user_id, transitioned);
        }

        for message in &mut history {
            if message.receiver_id == self.user_id {
                message.read = true;
            }
        }
        for message in &history {
            self.seen.insert(message.id);
        }
        if let Some(summary) = self
            .index
            .iter_mut()
            .find(|c| c.counterpart_id == counterpart_id)
        {
            summary.unread_count = 0;
        }

        if let Some(open) = self.open.as_mut() {
            // Unconfirmed optimistic entries survive the rebuild.
            let pending: Vec<ViewMessage> = open
                .messages
                .iter()
                .filter(|v| v.is_pending())
                .cloned()
                .collect();
            open.messages = history
                .into_iter()
                .map(ViewMessage::Delivered)
                .chain(pending)
                .collect();
        }
        Ok(())
    }

    /// Replace a possibly-dead subscription with a fresh one and catch up.
    pub async fn reconnect(&mut self) -> AppResult<()> {
        let (subscriber_id, pushes) = self.hub.subscribe(self.user_id).await;
        self.hub.unsubscribe(self.user_id, self.subscriber_id).await;
        self.subscriber_id = subscriber_id;
        self.pushes = pushes;
        self.resync().await
    }

    /// True store-side unread count for this user; the only sanctioned
    /// source for badge reconciliation.
    pub async fn unread_total(&self) -> AppResult<u64> {
        Ok(self
            .store
            .list_conversations_for(self.user_id)
            .await?
            .iter()
            .map(|c| c.unread_count)
            .sum())
    }

    /// Release the delivery subscription.
    pub async fn detach(self) {
        self.hub.unsubscribe(self.user_id, self.subscriber_id).await;
    }

    async fn seed_inner(&mut self, ctx: &SeedContext) -> AppResult<Option<Message>> {
        // Content equality is the only dedup key the source workflow
        // provides; two legitimately identical messages sent close
        // together would merge here.
        let existing = self.store.list_between(self.user_id, ctx.counterpart_id).await?;
        let already_present = existing.iter().any(|m| {
            m.sender_id == ctx.counterpart_id
                && m.receiver_id == self.user_id
                && m.content == ctx.content
        });
        if already_present {
            tracing::debug!(
                counterpart_id = %ctx.counterpart_id,
                "seed message already present, skipping"
            );
            return Ok(None);
        }

        let mut message = self
            .store
            .append_at(
                ctx.counterpart_id,
                self.user_id,
                &ctx.content,
                ctx.nominal_timestamp,
            )
            .await?;
        self.seen.insert(message.id);

        let viewing = self
            .open
            .as_ref()
            .is_some_and(|o| o.counterpart_id == ctx.counterpart_id);
        if viewing {
            // Injector and viewer are the same session; insert directly
            // instead of waiting for the delivery channel, already read.
            self.store.mark_read(self.user_id, ctx.counterpart_id).await?;
            message.read = true;
            if let Some(open) = self.open.as_mut() {
                let pos = open
                    .messages
                    .partition_point(|v| v.created_at() <= message.created_at);
                open.messages.insert(pos, ViewMessage::Delivered(message.clone()));
            }
            self.touch_index(&message, 0);
        } else {
            self.badge.increase(self.user_id, 1);
            self.touch_index(&message, 1);
        }

        self.hub.publish(&message).await;
        Ok(Some(message))
    }

    async fn handle_incoming(&mut self, message: Message) -> AppResult<()> {
        // At-least-once delivery: drop anything already accounted for.
        if self.seen.contains(&message.id) {
            return Ok(());
        }

        if message.sender_id == self.user_id {
            if self.matches_pending(&message) {
                // Echo of our own in-flight append; reconciliation owns it.
                return Ok(());
            }
            self.seen.insert(message.id);
            if let Some(open) = self.open.as_mut() {
                if open.counterpart_id == message.receiver_id {
                    open.messages.push(ViewMessage::Delivered(message.clone()));
                }
            }
            self.touch_index(&message, 0);
            return Ok(());
        }

        let viewing = self
            .open
            .as_ref()
            .is_some_and(|o| o.counterpart_id == message.sender_id);
        if viewing {
            // Read immediately; never contributes to the badge. Marked
            // seen only once the read transition sticks, so a push that
            // failed here can be replayed.
            self.store.mark_read(self.user_id, message.sender_id).await?;
            self.seen.insert(message.id);
            let mut message = message;
            message.read = true;
            if let Some(open) = self.open.as_mut() {
                open.messages.push(ViewMessage::Delivered(message.clone()));
            }
            self.touch_index(&message, 0);
        } else {
            self.seen.insert(message.id);
            self.badge.increase(self.user_id, 1);
            self.touch_index(&message, 1);
        }
        Ok(())
    }

    fn matches_pending(&self, message: &Message) -> bool {
        let window = ChronoDuration::seconds(self.config.echo_window_secs);
        self.pending.iter().any(|p| {
            p.receiver_id == message.receiver_id
                && p.content == message.content
                && (message.created_at - p.started_at).abs() <= window
        })
    }

    fn rollback_pending(&mut self, local_id: Uuid) {
        self.pending.retain(|p| p.local_id != local_id);
        if let Some(open) = self.open.as_mut() {
            open.messages
                .retain(|v| !matches!(v, ViewMessage::Pending(p) if p.local_id == local_id));
        }
    }

    fn reconcile_pending(&mut self, local_id: Uuid, message: &Message) {
        self.pending.retain(|p| p.local_id != local_id);
        self.seen.insert(message.id);

        if let Some(open) = self.open.as_mut() {
            let duplicate = open
                .messages
                .iter()
                .any(|v| v.delivered().map(|m| m.id) == Some(message.id));
            if let Some(pos) = open
                .messages
                .iter()
                .position(|v| matches!(v, ViewMessage::Pending(p) if p.local_id == local_id))
            {
                if duplicate {
                    open.messages.remove(pos);
                } else {
                    open.messages[pos] = ViewMessage::Delivered(message.clone());
                }
            }
        }
    }

    fn touch_index(&mut self, message: &Message, unread_delta: u64) {
        let Some(counterpart_id) = message.counterpart_of(self.user_id) else {
            return;
        };

        if let Some(summary) = self
            .index
            .iter_mut()
            .find(|c| c.counterpart_id == counterpart_id)
        {
            summary.unread_count += unread_delta;
            if message.created_at >= summary.last_message.created_at {
                summary.last_message = message.clone();
            }
        } else {
            self.index.push(ConversationSummary {
                counterpart_id,
                last_message: message.clone(),
                unread_count: unread_delta,
            });
        }
        self.index
            .sort_by(|a, b| b.last_message.created_at.cmp(&a.last_message.created_at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;

    async fn state() -> AppState {
        AppState::in_memory(Config::default())
    }

    fn push_message(sender_id: Uuid, receiver_id: Uuid, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id,
            receiver_id,
            content: content.to_string(),
            created_at: Utc::now(),
            read: false,
        }
    }

    #[tokio::test]
    async fn echo_of_pending_write_is_not_rendered() {
        let state = state().await;
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        let mut session = state.session(x).await;
        session.open_conversation(y).await.unwrap();

        // Simulate the append still being in flight when the channel
        // echoes the write back.
        session.pending.push(PendingSend {
            local_id: Uuid::new_v4(),
            receiver_id: y,
            content: "Hi".to_string(),
            started_at: Utc::now(),
        });
        let echo = push_message(x, y, "Hi");
        session.handle_incoming(echo).await.unwrap();

        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn own_message_from_another_session_is_rendered() {
        let state = state().await;
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        let mut session = state.session(x).await;
        session.open_conversation(y).await.unwrap();

        // No pending write: same sender, but nothing in flight here.
        let other_device = push_message(x, y, "from elsewhere");
        session.handle_incoming(other_device).await.unwrap();

        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_push_is_ignored() {
        let state = state().await;
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        let mut session = state.session(x).await;
        session.open_conversation(y).await.unwrap();

        let incoming = push_message(y, x, "hello");
        session.handle_incoming(incoming.clone()).await.unwrap();
        session.handle_incoming(incoming).await.unwrap();

        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn push_for_closed_conversation_raises_badge() {
        let state = state().await;
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        let mut mirror = crate::badge::BadgeMirror::new(&state.badge, x);
        let mut session = state.session(x).await;

        session.handle_incoming(push_message(y, x, "hi")).await.unwrap();

        assert_eq!(mirror.drain(), 1);
        assert_eq!(session.conversation_index().len(), 1);
        assert_eq!(session.conversation_index()[0].unread_count, 1);
    }

    #[tokio::test]
    async fn push_for_open_conversation_is_read_without_badge() {
        let state = state().await;
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        let mut mirror = crate::badge::BadgeMirror::new(&state.badge, x);
        let mut session = state.session(x).await;
        session.open_conversation(y).await.unwrap();

        // The message exists in the store as it would after the sender's
        // append, then arrives via push.
        let stored = state.store.append(y, x, "hi").await.unwrap();
        session.handle_incoming(stored).await.unwrap();

        assert_eq!(mirror.drain(), 0);
        let rendered = session.messages()[0].delivered().unwrap();
        assert!(rendered.read);
        assert_eq!(session.unread_total().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn send_requires_an_open_conversation() {
        let state = state().await;
        let mut session = state.session(Uuid::new_v4()).await;
        assert!(matches!(
            session.send("hello").await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn empty_send_is_rejected_without_view_changes() {
        let state = state().await;
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        let mut session = state.session(x).await;
        session.open_conversation(y).await.unwrap();

        assert!(matches!(
            session.send("   \n").await,
            Err(AppError::BadRequest(_))
        ));
        assert!(session.messages().is_empty());
        assert!(session.pending.is_empty());
    }
}
