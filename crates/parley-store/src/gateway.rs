//! SQLite-backed implementations of the collaborator traits.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::task;

use parley_core::gateway::{MembershipOracle, PersistenceGateway};
use parley_core::{ConversationId, GatewayError, Message, UserId};

use crate::chats::ChatRepo;
use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;

/// Runs store calls on the blocking pool so async callers never wait on disk.
#[derive(Clone)]
pub struct SqliteGateway {
    db: Database,
}

impl SqliteGateway {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce(Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| GatewayError::Unavailable(format!("store task failed: {e}")))?
            .map_err(GatewayError::from)
    }
}

#[async_trait]
impl MembershipOracle for SqliteGateway {
    async fn resolve_subscriptions(
        &self,
        user_id: UserId,
    ) -> Result<BTreeSet<ConversationId>, GatewayError> {
        self.blocking(move |db| ChatRepo::new(db).conversation_ids(user_id))
            .await
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn append(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<Message, GatewayError> {
        let content = content.to_owned();
        self.blocking(move |db| MessageRepo::new(db).append(conversation_id, sender_id, &content))
            .await
    }
}
