use crate::badge::BadgeBus;
use crate::config::Config;
use crate::delivery::DeliveryHub;
use crate::error::AppResult;
use crate::notify::{LogNotifier, Notifier};
use crate::session::ChatSession;
use crate::store::{MemoryStore, MessageStore, PgStore};
use std::sync::Arc;
use uuid::Uuid;

/// Shared infrastructure every session hangs off: the authoritative
/// message store, the delivery hub, the badge bus, and the notification
/// producer.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub hub: DeliveryHub,
    pub badge: BadgeBus,
    pub notifier: Arc<dyn Notifier>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn Notifier>,
        config: Config,
    ) -> Self {
        Self {
            store,
            hub: DeliveryHub::new(),
            badge: BadgeBus::default(),
            notifier,
            config: Arc::new(config),
        }
    }

    /// Fully in-process state: memory store and tracing notifier.
    pub fn in_memory(config: Config) -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(LogNotifier), config)
    }

    /// Postgres-backed state; bootstraps the schema on startup.
    pub async fn connect(config: Config) -> AppResult<Self> {
        let store = PgStore::connect(&config.database_url)?;
        store.ensure_schema().await?;
        Ok(Self::new(Arc::new(store), Arc::new(LogNotifier), config))
    }

    /// Spawn a session for a user, opening its delivery subscription.
    pub async fn session(&self, user_id: Uuid) -> ChatSession {
        ChatSession::attach(self, user_id).await
    }
}
