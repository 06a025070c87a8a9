use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, UserId};

/// A chat message as persisted by the storage layer.
///
/// Instances only come out of a [`PersistenceGateway`](crate::gateway::PersistenceGateway)
/// and are never mutated afterwards. Field order here is the field order on
/// the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
