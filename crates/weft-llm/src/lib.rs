//! Transport-agnostic helpers around [`weft_core::traits::LlmClient`].
//!
//! Concrete oracle transports live outside the engine. This crate turns their
//! delta streams into stream-complete assistant turns and adds retry and
//! fallback on top of any client.

pub mod assemble;
pub mod retry;

pub use assemble::{collect_turn, AssembledTurn, MalformedCall, StreamAssembler, ToolCall};
pub use retry::RetryingClient;
