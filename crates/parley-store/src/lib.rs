pub mod chats;
pub mod database;
pub mod error;
pub mod gateway;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod users;

pub use database::Database;
pub use error::StoreError;
pub use gateway::SqliteGateway;
