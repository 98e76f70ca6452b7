//! # moechat-server
//!
//! HTTP server for the MoE-Chat streaming relay:
//!
//! - **Relay**: per-request session state machine and client SSE frames
//! - **Telemetry**: bounded fire-and-forget expert-activation publishing
//! - **Persistence**: message store contract plus in-memory implementation
//! - **Surface**: axum routes (`/api/v1/chats/{chat_id}/messages[/stream]`,
//!   `/health`, `/metrics`), config, graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod persistence;
pub mod relay;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod telemetry;

pub use config::RelayConfig;
pub use error::RelayError;
pub use persistence::{InMemoryMessageStore, MessageStore};
pub use server::{AppState, RelayServer};
pub use telemetry::TelemetryPublisher;
