//! Cross-component unread-badge bus.
//!
//! Carries only additive/subtractive deltas, never recomputed snapshots,
//! so independently updating UI surfaces cannot overwrite each other with
//! stale totals. The mirrored value is a cache of the store-side unread
//! count; the read-state path is the only component allowed to correct it
//! (via the decrement that accompanies `mark_read`, or a reset from
//! `ChatSession::unread_total`).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "n", rename_all = "snake_case")]
pub enum BadgeDelta {
    Increase(u64),
    Decrease(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeEvent {
    pub user_id: Uuid,
    pub delta: BadgeDelta,
}

/// Process-wide publish/subscribe point for badge deltas.
#[derive(Clone)]
pub struct BadgeBus {
    tx: broadcast::Sender<BadgeEvent>,
}

impl BadgeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BadgeEvent> {
        self.tx.subscribe()
    }

    pub fn increase(&self, user_id: Uuid, n: u64) {
        self.emit(user_id, BadgeDelta::Increase(n));
    }

    pub fn decrease(&self, user_id: Uuid, n: u64) {
        self.emit(user_id, BadgeDelta::Decrease(n));
    }

    fn emit(&self, user_id: Uuid, delta: BadgeDelta) {
        if matches!(delta, BadgeDelta::Increase(0) | BadgeDelta::Decrease(0)) {
            return;
        }
        // No receivers is fine; surfaces that mount later start from a
        // reconciled value instead of replaying history.
        let _ = self.tx.send(BadgeEvent { user_id, delta });
    }
}

impl Default for BadgeBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Consumer-side cached badge value for one user.
///
/// Any UI surface displaying the badge holds one of these and drains it
/// from its own event loop. It can drift if the receiver lags; `reset`
/// is the reconciliation entry point.
pub struct BadgeMirror {
    user_id: Uuid,
    rx: broadcast::Receiver<BadgeEvent>,
    value: u64,
}

impl BadgeMirror {
    pub fn new(bus: &BadgeBus, user_id: Uuid) -> Self {
        Self {
            user_id,
            rx: bus.subscribe(),
            value: 0,
        }
    }

    /// Apply every queued delta for this user and return the new value.
    pub fn drain(&mut self) -> u64 {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if event.user_id != self.user_id {
                        continue;
                    }
                    match event.delta {
                        BadgeDelta::Increase(n) => self.value = self.value.saturating_add(n),
                        BadgeDelta::Decrease(n) => self.value = self.value.saturating_sub(n),
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        user_id = %self.user_id,
                        skipped,
                        "badge mirror lagged, value needs reconciliation"
                    );
                }
                Err(_) => break,
            }
        }
        self.value
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Overwrite the cached value with a reconciled count.
    pub fn reset(&mut self, value: u64) {
        self.value = value;
    }
}
