//! Context window management.
//!
//! This module handles the "scarce resource" of the model context window.
//! It fits the accumulated dialogue plus the new user input into the token
//! budget left after reserving room for the response.

use super::provider::TokenCodec;
use super::types::TokenSequence;
use crate::error::{SessionError, SessionResult};

/// Token budget for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindow {
    /// Maximum number of tokens the model may see (input + response).
    max_total_tokens: usize,
    /// Tokens held back for the next response.
    max_response_tokens: usize,
}

impl ContextWindow {
    /// Fails when no room is left for input once the response is reserved.
    pub fn new(max_total_tokens: usize, max_response_tokens: usize) -> SessionResult<Self> {
        if max_response_tokens >= max_total_tokens {
            return Err(SessionError::BudgetViolation {
                max_total_tokens,
                max_response_tokens,
            });
        }
        Ok(Self {
            max_total_tokens,
            max_response_tokens,
        })
    }

    pub fn max_total_tokens(&self) -> usize {
        self.max_total_tokens
    }

    pub fn max_response_tokens(&self) -> usize {
        self.max_response_tokens
    }

    /// Tokens available for history plus input.
    ///
    /// budget = max_total_tokens - max_response_tokens
    pub fn budget(&self) -> usize {
        self.max_total_tokens - self.max_response_tokens
    }

    /// Encode `new_text` followed by the end-of-turn marker and append it to
    /// `history`, if any.
    pub fn append_input(
        &self,
        codec: &dyn TokenCodec,
        history: Option<&TokenSequence>,
        new_text: &str,
    ) -> SessionResult<TokenSequence> {
        let mut ids = codec
            .encode(new_text)
            .map_err(SessionError::encoding)?
            .as_slice()
            .to_vec();
        ids.push(codec.end_of_turn_token_id());
        let input = TokenSequence::new(ids);

        Ok(match history {
            Some(history) => history.concat(&input),
            None => input,
        })
    }

    /// Append pre-encoded assistant cue tokens (prompt template).
    pub fn append_cue(&self, seq: &TokenSequence, cue: &TokenSequence) -> TokenSequence {
        seq.concat(cue)
    }

    /// Keep only the most recent `budget` tokens.
    ///
    /// Oldest context goes first, even mid-utterance.
    pub fn truncate(&self, seq: &TokenSequence, budget: usize) -> TokenSequence {
        if seq.len() <= budget {
            return seq.clone();
        }
        tracing::debug!(
            len = seq.len(),
            budget,
            dropped = seq.len() - budget,
            "Truncating context from the front"
        );
        seq.tail(budget)
    }

    /// Append the response to the request input. No truncation here: the
    /// latest response stays intact until the next input is added.
    pub fn append_response(&self, history: &TokenSequence, response: &TokenSequence) -> TokenSequence {
        history.concat(response)
    }
}
