//! # moechat-llm
//!
//! Everything the relay needs to talk to an OpenAI-compatible token-streaming
//! inference backend:
//!
//! - **SSE parsing**: line reassembly over raw byte streams ([`sse`])
//! - **Chunk decoding**: `chat.completion.chunk` wire types ([`chunk`])
//! - **Thinking splitter**: incremental marker-based separation of reasoning
//!   from answer text ([`splitter`])
//! - **Expert telemetry**: extraction of MoE routing samples ([`experts`])
//! - **Upstream client**: streaming and one-shot chat calls ([`client`])
//! - **Model directory**: the lookup contract plus an in-memory
//!   implementation ([`directory`])

#![deny(unsafe_code)]

pub mod chunk;
pub mod client;
pub mod directory;
pub mod error;
pub mod experts;
pub mod splitter;
pub mod sse;

pub use chunk::{ChatCompletion, ChatCompletionChunk, ChunkEvent, FinishReason, MalformedChunk};
pub use client::{ChatRequest, ChunkEventStream, UpstreamClient, UpstreamClientConfig};
pub use directory::{InMemoryModelDirectory, ModelDirectory};
pub use error::UpstreamError;
pub use splitter::{SplitOutput, ThinkingSplitter};
