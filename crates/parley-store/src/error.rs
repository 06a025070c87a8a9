use parley_core::GatewayError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("user is not a member of the chat")]
    Forbidden,

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(String),

    #[error("password hashing failed: {0}")]
    Hash(String),
}

impl From<bcrypt::BcryptError> for StoreError {
    fn from(e: bcrypt::BcryptError) -> Self {
        StoreError::Hash(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Forbidden => GatewayError::Forbidden,
            StoreError::NotFound(what) => GatewayError::NotFound(what),
            StoreError::Invalid(what) | StoreError::Conflict(what) => GatewayError::Invalid(what),
            other => GatewayError::Unavailable(other.to_string()),
        }
    }
}
