//! Domain types shared across the parley crates: identifiers, persisted
//! messages, the websocket envelope protocol and the collaborator traits the
//! fanout hub depends on.

pub mod envelope;
pub mod errors;
pub mod gateway;
pub mod ids;
pub mod messages;

pub use errors::{GatewayError, ProtocolError};
pub use ids::{ConnectionId, ConversationId, MessageId, UserId};
pub use messages::Message;
