//! Notification collaborator seam.
//!
//! On a successful append the sending session fires a best-effort
//! notification at the receiver. Failures here are logged and dropped;
//! they never roll back the message or surface to the user.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSummary {
    pub sender_id: Uuid,
    pub preview: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, receiver_id: Uuid, summary: NotificationSummary) -> Result<(), String>;
}

/// In-process producer that records notifications on the tracing output.
/// Deployments with a push gateway implement the same trait against it.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, receiver_id: Uuid, summary: NotificationSummary) -> Result<(), String> {
        let payload = serde_json::to_string(&summary)
            .map_err(|e| format!("serialize notification: {e}"))?;
        tracing::info!(
            receiver_id = %receiver_id,
            payload = %payload,
            "message notification enqueued"
        );
        Ok(())
    }
}

/// Truncate message content to a maximum number of characters, adding an
/// ellipsis if needed. Counts chars, not bytes, so multibyte content never
/// splits mid-character.
pub fn truncate_message_preview(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        message.to_string()
    } else {
        let truncated: String = message.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}
