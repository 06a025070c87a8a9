/// Errors raised while decoding or validating an inbound websocket frame.
///
/// The `Display` text of each variant is exactly what the client receives in
/// the `error` frame, so keep the wording stable.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid message format")]
    InvalidFormat,
    #[error("unknown message type")]
    UnknownType(String),
    #[error("invalid payload")]
    InvalidPayload,
    #[error("content must not be empty")]
    EmptyContent,
    #[error("user is not a member of the chat")]
    NotMember,
}

impl ProtocolError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "invalid_format",
            Self::UnknownType(_) => "unknown_type",
            Self::InvalidPayload => "invalid_payload",
            Self::EmptyContent => "empty_content",
            Self::NotMember => "not_member",
        }
    }
}

/// Failures reported by the membership oracle or the persistence gateway.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    // Caller mistakes
    #[error("user is not a member of the chat")]
    Forbidden,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Invalid(String),

    // Backend trouble
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// Whether the caller caused the failure (and would get it again).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Forbidden | Self::NotFound(_) | Self::Invalid(_))
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Forbidden => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Invalid(_) => "invalid",
            Self::Unavailable(_) => "unavailable",
        }
    }
}
