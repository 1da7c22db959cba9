//! The backend abstraction.
//!
//! These traits define what the session core consumes from a model backend,
//! whether it's a local candle model or a test double.

use anyhow::Result;
use std::sync::Arc;

use super::types::{SamplingParams, TokenSequence};

/// Converts text to and from a model-specific token sequence.
pub trait TokenCodec: Send + Sync {
    /// Encode text without adding special tokens.
    fn encode(&self, text: &str) -> Result<TokenSequence>;

    /// Decode tokens to text, skipping special tokens.
    fn decode(&self, tokens: &TokenSequence) -> Result<String>;

    /// Token appended after every user utterance.
    fn end_of_turn_token_id(&self) -> u32;

    /// Padding token, if the vocabulary defines one.
    fn pad_token_id(&self) -> Option<u32> {
        None
    }

    /// Ids other than end-of-turn that end a reply.
    fn stop_token_ids(&self) -> Vec<u32> {
        Vec::new()
    }

    /// Padding token, falling back to the end-of-turn token.
    fn effective_pad_token_id(&self) -> u32 {
        self.pad_token_id()
            .unwrap_or_else(|| self.end_of_turn_token_id())
    }
}

/// Produces a continuation for a token sequence.
///
/// `generate` blocks for as long as inference takes; callers run it off the
/// interactive thread. The returned sequence excludes the input prefix.
pub trait GenerationEngine: Send + Sync {
    fn generate(&self, input: &TokenSequence, params: &SamplingParams) -> Result<TokenSequence>;

    /// Short model identifier for display.
    fn model_id(&self) -> String;
}

/// The process-wide model pair, built once before any session opens and
/// dropped after the last one closes.
#[derive(Clone)]
pub struct Backend {
    pub codec: Arc<dyn TokenCodec>,
    pub engine: Arc<dyn GenerationEngine>,
}

impl Backend {
    pub fn new(codec: Arc<dyn TokenCodec>, engine: Arc<dyn GenerationEngine>) -> Self {
        Self { codec, engine }
    }
}
