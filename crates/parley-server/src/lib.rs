//! # parley-server
//!
//! Axum HTTP + `WebSocket` server for the chat backend.
//!
//! - `/ws` gateway: one session per connection, subscriptions fixed at connect
//! - A single registry task (the hub) owning all conversation interest sets
//! - Bounded per-connection mailboxes; a full mailbox evicts its session
//! - REST endpoints for chats, posting and history
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`
//! - Password registration and login issuing access + refresh tokens

#![deny(unsafe_code)]

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod health;
pub mod hub;
pub mod mailbox;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::{load_config, ServerConfig};
pub use hub::{Hub, HubSnapshot};
pub use server::{build_router, start, AppState, ServerError, ServerHandle};
