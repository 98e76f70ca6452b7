//! # moechat-core
//!
//! Foundation types shared by the MoE-Chat relay crates:
//!
//! - **Messages**: roles, persistence statuses, the stored message shape,
//!   and the `(role, content)` turns sent upstream as conversation context
//! - **Models**: the model directory record, including the per-model
//!   thinking-marker convention
//! - **Telemetry**: per-layer expert-activation samples published to the
//!   visualization channel

#![deny(unsafe_code)]

pub mod message;
pub mod model;
pub mod telemetry;

pub use message::{ChatTurn, MessageRole, MessageStatus, StoredMessage};
pub use model::{ModelRecord, DEFAULT_THINKING_MARKER};
pub use telemetry::{ActivationBatch, ExpertActivationSample};
