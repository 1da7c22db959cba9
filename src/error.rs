//! Error types for conversational sessions.

use thiserror::Error;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while running a conversation turn.
///
/// `Encoding` and `Generation` are per-turn failures: they are rendered as an
/// assistant message and never touch the session history. `BudgetViolation`
/// and `ContextOverflow` are configuration errors and abort startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Blank user text. `GenerationSession::start_turn` reports it as
    /// `Ok(None)` and the turn is dropped without a message; the variant
    /// names that case for front-ends that classify input themselves.
    #[error("empty input")]
    EmptyInput,

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error(
        "invalid token budget: max_response_tokens ({max_response_tokens}) must be below max_total_tokens ({max_total_tokens})"
    )]
    BudgetViolation {
        max_total_tokens: usize,
        max_response_tokens: usize,
    },

    #[error(
        "invalid token budget: max_total_tokens ({max_total_tokens}) exceeds the model's context length ({context_length})"
    )]
    ContextOverflow {
        max_total_tokens: usize,
        context_length: usize,
    },
}

impl SessionError {
    /// Classify raw user text before building a turn.
    pub fn check_input(text: &str) -> SessionResult<&str> {
        let text = text.trim();
        if text.is_empty() {
            Err(Self::EmptyInput)
        } else {
            Ok(text)
        }
    }

    /// Whether the error is recoverable within the current session.
    pub fn is_per_turn(&self) -> bool {
        matches!(self, Self::Encoding(_) | Self::Generation(_))
    }

    pub(crate) fn encoding(err: impl std::fmt::Display) -> Self {
        Self::Encoding(err.to_string())
    }

    pub(crate) fn generation(err: impl std::fmt::Display) -> Self {
        Self::Generation(err.to_string())
    }
}
