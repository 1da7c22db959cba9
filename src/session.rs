//! Per-conversation generation session.
//!
//! A [`GenerationSession`] owns the token history of one conversation. It
//! builds the request for each turn and folds the response back into the
//! history. It never talks to the engine itself: generation runs on a
//! worker, and the session is only touched from the interactive thread.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::{PromptTemplate, SamplingConfig, WindowConfig};
use crate::error::{SessionError, SessionResult};
use crate::llm::{
    ContextWindow, GenerationRequest, SamplingParams, TokenCodec, TokenSequence, Turn, TurnOutcome,
};

/// Identifies one conversation (one chat window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mutable conversation state. Created empty, replaced once per completed
/// turn, dropped with the session.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    history: Option<TokenSequence>,
    transcript: Vec<Turn>,
    next_seq: u64,
}

impl SessionState {
    pub fn history(&self) -> Option<&TokenSequence> {
        self.history.as_ref()
    }

    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

pub struct GenerationSession {
    id: SessionId,
    codec: Arc<dyn TokenCodec>,
    window: ContextWindow,
    sampling: SamplingParams,
    template: PromptTemplate,
    /// Assistant cue, encoded once at construction.
    cue: TokenSequence,
    state: SessionState,
}

impl GenerationSession {
    /// Build a session. Fails on a budget that leaves no room for input, or
    /// when the template cue cannot be encoded.
    pub fn new(
        codec: Arc<dyn TokenCodec>,
        window: &WindowConfig,
        sampling: &SamplingConfig,
        template: PromptTemplate,
    ) -> SessionResult<Self> {
        let window = window.window()?;

        let cue = if template.assistant_cue.is_empty() {
            TokenSequence::empty()
        } else {
            codec
                .encode(template.assistant_cue)
                .map_err(SessionError::encoding)?
        };

        let sampling = SamplingParams {
            max_new_tokens: sampling.max_new_tokens.min(window.max_response_tokens()),
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            do_sample: sampling.do_sample,
            seed: sampling.seed,
            pad_token_id: codec.effective_pad_token_id(),
            eos_token_id: codec.end_of_turn_token_id(),
            stop_token_ids: codec.stop_token_ids(),
        };

        let id = SessionId::new();
        tracing::debug!(
            session = %id,
            budget = window.budget(),
            max_new_tokens = sampling.max_new_tokens,
            "Session created"
        );

        Ok(Self {
            id,
            codec,
            window,
            sampling,
            template,
            cue,
            state: SessionState::default(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn window(&self) -> &ContextWindow {
        &self.window
    }

    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn history(&self) -> Option<&TokenSequence> {
        self.state.history()
    }

    pub fn transcript(&self) -> &[Turn] {
        self.state.transcript()
    }

    /// Build the request for a new turn.
    ///
    /// Blank input yields `Ok(None)`: the caller drops the turn silently. The
    /// history is never modified here.
    pub fn start_turn(&mut self, user_text: &str) -> SessionResult<Option<GenerationRequest>> {
        let user_text = match SessionError::check_input(user_text) {
            Ok(text) => text,
            Err(SessionError::EmptyInput) => return Ok(None),
            Err(e) => return Err(e),
        };

        let rendered = self.template.render_user(user_text);
        let input = self
            .window
            .append_input(self.codec.as_ref(), self.state.history(), &rendered)?;
        let input = self.window.append_cue(&input, &self.cue);
        let input_tokens = self.window.truncate(&input, self.window.budget());

        let issued_at = self.state.allocate_seq();
        tracing::debug!(
            session = %self.id,
            issued_at,
            input_tokens = input_tokens.len(),
            "Turn request built"
        );

        Ok(Some(GenerationRequest {
            input_tokens,
            sampling: self.sampling.clone(),
            user_text: user_text.to_string(),
            issued_at,
        }))
    }

    /// Fold a successful generation into the history and return the text to
    /// render. Decoding happens first so a decode failure leaves the state
    /// untouched.
    pub fn complete_turn(
        &mut self,
        request: &GenerationRequest,
        response_tokens: &TokenSequence,
    ) -> SessionResult<String> {
        let text = self
            .codec
            .decode(response_tokens)
            .map_err(SessionError::encoding)?;
        let display_text = text.trim().to_string();

        let history = self
            .window
            .append_response(&request.input_tokens, response_tokens);
        tracing::info!(
            session = %self.id,
            issued_at = request.issued_at,
            response_tokens = response_tokens.len(),
            history_tokens = history.len(),
            "Turn completed"
        );

        self.state.history = Some(history);
        self.state.transcript.push(Turn {
            user_text: request.user_text.clone(),
            response_text: display_text.clone(),
            issued_at: request.issued_at,
            at: chrono::Utc::now(),
            outcome: TurnOutcome::Completed,
        });

        Ok(display_text)
    }

    /// Render a failed turn. The history stays exactly as it was.
    ///
    /// `issued_at` is the failed request's ordering token, or `None` when the
    /// turn failed before a request existed.
    pub fn handle_failure(
        &mut self,
        user_text: &str,
        issued_at: Option<u64>,
        error: &SessionError,
    ) -> String {
        let issued_at = issued_at.unwrap_or_else(|| self.state.allocate_seq());
        tracing::warn!(session = %self.id, issued_at, error = %error, "Turn failed");

        let display_text = format!("Error: {}", error);
        self.state.transcript.push(Turn {
            user_text: user_text.trim().to_string(),
            response_text: display_text.clone(),
            issued_at,
            at: chrono::Utc::now(),
            outcome: TurnOutcome::Failed,
        });
        display_text
    }

    /// Start a new conversation in the same window.
    pub fn reset(&mut self) {
        tracing::debug!(session = %self.id, "Session reset");
        self.state = SessionState::default();
    }
}
