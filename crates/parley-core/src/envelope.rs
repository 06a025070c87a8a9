//! Websocket wire protocol.
//!
//! Every frame in either direction is a JSON object `{"type": ..., "payload": ...}`.
//! Inbound frames are decoded in two steps: first the raw envelope, then the
//! payload for the matched type, so each failure maps to its own error frame.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::ids::{ConversationId, UserId};
use crate::messages::Message;

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    #[serde(alias = "chat_id")]
    conversation_id: ConversationId,
    content: String,
}

#[derive(Debug, Deserialize)]
struct TypingPayload {
    #[serde(alias = "chat_id")]
    conversation_id: ConversationId,
}

/// A validated client frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    SendMessage {
        conversation_id: ConversationId,
        content: String,
    },
    Typing {
        conversation_id: ConversationId,
    },
}

impl Inbound {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::SendMessage { conversation_id, .. } | Self::Typing { conversation_id } => {
                *conversation_id
            }
        }
    }
}

/// Decode one inbound text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidFormat)?;

    match raw.kind.as_str() {
        "send_message" | "post_message" => {
            let payload: SendMessagePayload =
                serde_json::from_value(raw.payload).map_err(|_| ProtocolError::InvalidPayload)?;
            if payload.content.trim().is_empty() {
                return Err(ProtocolError::EmptyContent);
            }
            Ok(Inbound::SendMessage {
                conversation_id: payload.conversation_id,
                content: payload.content,
            })
        }
        "typing" => {
            let payload: TypingPayload =
                serde_json::from_value(raw.payload).map_err(|_| ProtocolError::InvalidPayload)?;
            Ok(Inbound::Typing {
                conversation_id: payload.conversation_id,
            })
        }
        _ => Err(ProtocolError::UnknownType(raw.kind)),
    }
}

/// A server frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Outbound {
    NewMessage(Message),
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    Error {
        message: String,
    },
}

impl Outbound {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&ProtocolError> for Outbound {
    fn from(err: &ProtocolError) -> Self {
        Self::error(err.to_string())
    }
}

/// A frame routed to every session subscribed to one conversation.
///
/// The payload is serialized once and shared by all recipients.
#[derive(Clone, Debug)]
pub struct BroadcastEnvelope {
    pub conversation_id: ConversationId,
    pub payload: Arc<str>,
}

impl BroadcastEnvelope {
    pub fn new_message(message: &Message) -> Result<Self, serde_json::Error> {
        let payload = Outbound::NewMessage(message.clone()).to_json()?;
        Ok(Self {
            conversation_id: message.conversation_id,
            payload: payload.into(),
        })
    }

    pub fn typing(conversation_id: ConversationId, user_id: UserId) -> Result<Self, serde_json::Error> {
        let payload = Outbound::Typing {
            conversation_id,
            user_id,
        }
        .to_json()?;
        Ok(Self {
            conversation_id,
            payload: payload.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;
    use chrono::{TimeZone, Utc};

    fn message() -> Message {
        Message {
            id: MessageId::new(5),
            conversation_id: ConversationId::new(7),
            sender_id: UserId::new(2),
            content: "hello".into(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    #[test]
    fn parses_send_message() {
        let frame = r#"{"type":"send_message","payload":{"conversation_id":7,"content":"hi"}}"#;
        assert_eq!(
            parse_inbound(frame).unwrap(),
            Inbound::SendMessage {
                conversation_id: ConversationId::new(7),
                content: "hi".into()
            }
        );
    }

    #[test]
    fn accepts_post_message_and_chat_id_aliases() {
        let frame = r#"{"type":"post_message","payload":{"chat_id":3,"content":"yo"}}"#;
        let parsed = parse_inbound(frame).unwrap();
        assert_eq!(parsed.conversation_id(), ConversationId::new(3));
    }

    #[test]
    fn parses_typing() {
        let frame = r#"{"type":"typing","payload":{"conversation_id":9}}"#;
        assert_eq!(
            parse_inbound(frame).unwrap(),
            Inbound::Typing {
                conversation_id: ConversationId::new(9)
            }
        );
    }

    #[test]
    fn malformed_json_is_invalid_format() {
        assert_eq!(parse_inbound("{not json").unwrap_err(), ProtocolError::InvalidFormat);
        assert_eq!(parse_inbound(r#"{"payload":{}}"#).unwrap_err(), ProtocolError::InvalidFormat);
    }

    #[test]
    fn unknown_type_is_reported_with_its_name() {
        let err = parse_inbound(r#"{"type":"dance","payload":{}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("dance".into()));
        assert_eq!(err.to_string(), "unknown message type");
    }

    #[test]
    fn mismatched_payload_is_invalid_payload() {
        let missing = r#"{"type":"send_message","payload":{"content":"hi"}}"#;
        assert_eq!(parse_inbound(missing).unwrap_err(), ProtocolError::InvalidPayload);
        let wrong_type = r#"{"type":"send_message","payload":{"conversation_id":"seven","content":"hi"}}"#;
        assert_eq!(parse_inbound(wrong_type).unwrap_err(), ProtocolError::InvalidPayload);
        let absent = r#"{"type":"typing"}"#;
        assert_eq!(parse_inbound(absent).unwrap_err(), ProtocolError::InvalidPayload);
    }

    #[test]
    fn blank_content_is_rejected() {
        let frame = r#"{"type":"send_message","payload":{"conversation_id":7,"content":"   "}}"#;
        assert_eq!(parse_inbound(frame).unwrap_err(), ProtocolError::EmptyContent);
    }

    #[test]
    fn new_message_frame_carries_persisted_fields() {
        let json = Outbound::NewMessage(message()).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "new_message");
        assert_eq!(value["payload"]["id"], 5);
        assert_eq!(value["payload"]["conversation_id"], 7);
        assert_eq!(value["payload"]["sender_id"], 2);
        assert_eq!(value["payload"]["content"], "hello");
        assert_eq!(value["payload"]["created_at"], "2026-01-02T03:04:05Z");

        let back: Outbound = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Outbound::NewMessage(message()));
    }

    #[test]
    fn serialization_is_deterministic() {
        let a = BroadcastEnvelope::new_message(&message()).unwrap();
        let b = BroadcastEnvelope::new_message(&message()).unwrap();
        assert_eq!(a.payload, b.payload);
        assert_eq!(a.conversation_id, ConversationId::new(7));
    }

    #[test]
    fn error_frame_shape() {
        let json = Outbound::from(&ProtocolError::InvalidPayload).to_json().unwrap();
        assert_eq!(json, r#"{"type":"error","payload":{"message":"invalid payload"}}"#);
    }

    #[test]
    fn typing_frame_shape() {
        let env = BroadcastEnvelope::typing(ConversationId::new(4), UserId::new(8)).unwrap();
        assert_eq!(
            &*env.payload,
            r#"{"type":"typing","payload":{"conversation_id":4,"user_id":8}}"#
        );
    }
}
