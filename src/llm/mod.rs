//! LLM layer: what the session core needs from a model.
//!
//! This module handles all interactions with the language model, including:
//! - Codec and engine abstractions
//! - Token budget management (context window)
//! - The local candle backend

pub mod types;
pub mod provider;
pub mod context;
pub mod candle;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types
pub use types::{GenerationRequest, SamplingParams, TokenSequence, Turn, TurnOutcome};
pub use provider::{Backend, GenerationEngine, TokenCodec};
pub use context::ContextWindow;
