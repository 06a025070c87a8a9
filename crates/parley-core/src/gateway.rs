//! Collaborators the websocket layer depends on but does not own.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::errors::GatewayError;
use crate::ids::{ConversationId, UserId};
use crate::messages::Message;

/// Resolves which conversations a user may follow. Consulted once per
/// connection, before the upgrade.
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    async fn resolve_subscriptions(
        &self,
        user_id: UserId,
    ) -> Result<BTreeSet<ConversationId>, GatewayError>;
}

/// Durably appends messages. A returned [`Message`] is committed; nothing is
/// broadcast for a failed append.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn append(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<Message, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;
    use chrono::Utc;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Fixed;

    #[async_trait]
    impl MembershipOracle for Fixed {
        async fn resolve_subscriptions(
            &self,
            user_id: UserId,
        ) -> Result<BTreeSet<ConversationId>, GatewayError> {
            if user_id.get() == 0 {
                return Err(GatewayError::Unavailable("offline".into()));
            }
            Ok([ConversationId::new(7)].into_iter().collect())
        }
    }

    struct Counter(AtomicI64);

    #[async_trait]
    impl PersistenceGateway for Counter {
        async fn append(
            &self,
            conversation_id: ConversationId,
            sender_id: UserId,
            content: &str,
        ) -> Result<Message, GatewayError> {
            let id = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Message {
                id: MessageId::new(id),
                conversation_id,
                sender_id,
                content: content.to_owned(),
                created_at: Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn traits_are_object_safe() {
        let oracle: Box<dyn MembershipOracle> = Box::new(Fixed);
        let subs = oracle.resolve_subscriptions(UserId::new(1)).await.unwrap();
        assert!(subs.contains(&ConversationId::new(7)));
        assert!(oracle.resolve_subscriptions(UserId::new(0)).await.is_err());

        let gateway: Box<dyn PersistenceGateway> = Box::new(Counter(AtomicI64::new(0)));
        let first = gateway.append(ConversationId::new(7), UserId::new(1), "a").await.unwrap();
        let second = gateway.append(ConversationId::new(7), UserId::new(1), "b").await.unwrap();
        assert!(second.id > first.id);
        assert_eq!(second.content, "b");
    }
}
