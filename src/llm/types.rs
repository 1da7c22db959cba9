//! Universal types for generation requests.
//!
//! These types isolate the session logic from specific model backends.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// An immutable sequence of token ids.
///
/// Cloning is cheap (shared buffer). New sequences are only produced by
/// [`TokenSequence::concat`] and [`TokenSequence::tail`], never by mutating a
/// sequence another owner may hold.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct TokenSequence(Arc<[u32]>);

impl TokenSequence {
    pub fn new(ids: Vec<u32>) -> Self {
        Self(ids.into())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    /// A new sequence holding `self` followed by `other`.
    pub fn concat(&self, other: &TokenSequence) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut ids = Vec::with_capacity(self.len() + other.len());
        ids.extend_from_slice(&self.0);
        ids.extend_from_slice(&other.0);
        Self::new(ids)
    }

    /// A new sequence holding only the last `n` tokens.
    pub fn tail(&self, n: usize) -> Self {
        if n >= self.len() {
            return self.clone();
        }
        Self::new(self.0[self.len() - n..].to_vec())
    }

    /// Last token, if any.
    pub fn last(&self) -> Option<u32> {
        self.0.last().copied()
    }
}

impl From<Vec<u32>> for TokenSequence {
    fn from(ids: Vec<u32>) -> Self {
        Self::new(ids)
    }
}

impl From<&[u32]> for TokenSequence {
    fn from(ids: &[u32]) -> Self {
        Self(ids.into())
    }
}

impl fmt::Debug for TokenSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

/// Sampling parameters attached to every generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    /// When false, decoding is greedy and the other knobs are ignored.
    pub do_sample: bool,
    pub seed: u64,
    pub pad_token_id: u32,
    pub eos_token_id: u32,
    /// Further ids that end a reply, e.g. a model's end-of-text token.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_token_ids: Vec<u32>,
}

impl SamplingParams {
    /// Whether `token` ends the reply.
    pub fn is_stop(&self, token: u32) -> bool {
        token == self.eos_token_id || self.stop_token_ids.contains(&token)
    }
}

/// One generation request, built fresh for every turn.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// History plus the new input, already truncated to the window budget.
    pub input_tokens: TokenSequence,
    pub sampling: SamplingParams,
    /// The trimmed user text, kept for the transcript.
    pub user_text: String,
    /// Ordering token of the turn within its session.
    pub issued_at: u64,
}

/// Outcome of a turn, as shown in the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnOutcome {
    Completed,
    Failed,
}

/// A single exchange in a conversation. Display only: the token history, not
/// the transcript, feeds the next generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub user_text: String,
    pub response_text: String,
    pub issued_at: u64,
    pub at: chrono::DateTime<chrono::Utc>,
    pub outcome: TurnOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_leaves_operands_untouched() {
        let a = TokenSequence::new(vec![1, 2]);
        let b = TokenSequence::new(vec![3]);
        let c = a.concat(&b);
        assert_eq!(c.as_slice(), &[1, 2, 3]);
        assert_eq!(a.as_slice(), &[1, 2]);
        assert_eq!(b.as_slice(), &[3]);
    }

    #[test]
    fn test_tail() {
        let seq = TokenSequence::new(vec![1, 2, 3, 4, 5]);
        assert_eq!(seq.tail(2).as_slice(), &[4, 5]);
        assert_eq!(seq.tail(5), seq);
        assert_eq!(seq.tail(9), seq);
        assert!(seq.tail(0).is_empty());
    }

    #[test]
    fn test_stop_tokens() {
        let params = SamplingParams {
            max_new_tokens: 4,
            temperature: 0.7,
            top_p: 0.9,
            top_k: None,
            do_sample: true,
            seed: 0,
            pad_token_id: 0,
            eos_token_id: 7,
            stop_token_ids: vec![9],
        };
        assert!(params.is_stop(7));
        assert!(params.is_stop(9));
        assert!(!params.is_stop(8));
    }

    #[test]
    fn test_debug_lists_ids() {
        let seq = TokenSequence::new(vec![7, 8]);
        assert_eq!(format!("{:?}", seq), "[7, 8]");
    }
}
