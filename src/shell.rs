//! The surface a UI front-end drives.
//!
//! `ChatShell` lives on the interactive thread. It owns every session and the
//! dispatcher, and invokes the render callback exactly once per accepted,
//! non-empty turn, whether it succeeded or failed.

use std::collections::HashMap;

use tokio::runtime::Handle;

use crate::config::{Config, PromptTemplate};
use crate::dispatch::{Completion, TurnDispatcher, TurnHandle};
use crate::error::SessionResult;
use crate::llm::Backend;
use crate::session::{GenerationSession, SessionId};

/// Called with the text of every finished turn.
pub type RenderCallback = Box<dyn FnMut(SessionId, &str)>;

/// What happened to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Blank input, or unknown session
    Ignored,
    /// A turn is already in flight for this session; the input was dropped
    Busy,
    /// The user asked to leave
    Quit,
    /// The turn failed before dispatch and was rendered immediately
    Rendered,
    Dispatched(TurnHandle),
}

/// Words that close the front-end instead of starting a turn.
pub fn is_quit_command(text: &str) -> bool {
    matches!(text.trim().to_lowercase().as_str(), "quit" | "exit")
}

pub struct ChatShell {
    backend: Backend,
    config: Config,
    template: PromptTemplate,
    sessions: HashMap<SessionId, GenerationSession>,
    dispatcher: TurnDispatcher,
    on_turn_rendered: RenderCallback,
}

impl ChatShell {
    /// Fails on a misconfigured token budget.
    pub fn new(
        backend: Backend,
        config: Config,
        template: PromptTemplate,
        runtime: Handle,
        on_turn_rendered: RenderCallback,
    ) -> SessionResult<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            template,
            sessions: HashMap::new(),
            dispatcher: TurnDispatcher::new(runtime),
            on_turn_rendered,
        })
    }

    /// Open a new conversation (one per chat window).
    pub fn open_session(&mut self) -> SessionResult<SessionId> {
        let session = GenerationSession::new(
            self.backend.codec.clone(),
            &self.config.window,
            &self.config.sampling,
            self.template.clone(),
        )?;
        let id = session.id();
        self.sessions.insert(id, session);
        tracing::info!(session = %id, model = %self.backend.engine.model_id(), "Session opened");
        Ok(id)
    }

    /// Close a conversation. A turn still in flight is abandoned.
    pub fn close_session(&mut self, id: SessionId) -> bool {
        if self.dispatcher.forget(id) {
            tracing::debug!(session = %id, "Closing session with a turn in flight");
        }
        self.sessions.remove(&id).is_some()
    }

    pub fn session(&self, id: SessionId) -> Option<&GenerationSession> {
        self.sessions.get(&id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// True between an accepted submission and its rendered result.
    pub fn busy(&self, id: SessionId) -> bool {
        self.dispatcher.is_in_flight(id)
    }

    pub fn on_user_submit(&mut self, id: SessionId, text: &str) -> SubmitOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SubmitOutcome::Ignored;
        }
        if is_quit_command(text) {
            return SubmitOutcome::Quit;
        }
        if self.dispatcher.is_in_flight(id) {
            return SubmitOutcome::Busy;
        }
        let Some(session) = self.sessions.get_mut(&id) else {
            tracing::warn!(session = %id, "Submission for unknown session");
            return SubmitOutcome::Ignored;
        };

        match session.start_turn(text) {
            Ok(None) => SubmitOutcome::Ignored,
            Ok(Some(request)) => {
                let engine = self.backend.engine.clone();
                let handle = self.dispatcher.submit(id, request, move |request| {
                    engine.generate(&request.input_tokens, &request.sampling)
                });
                match handle {
                    Some(handle) => SubmitOutcome::Dispatched(handle),
                    None => SubmitOutcome::Busy,
                }
            }
            Err(e) => {
                let display_text = session.handle_failure(text, None, &e);
                (self.on_turn_rendered)(id, &display_text);
                SubmitOutcome::Rendered
            }
        }
    }

    /// Start a fresh conversation in an existing window. Refused while a
    /// turn is in flight.
    pub fn reset_session(&mut self, id: SessionId) -> bool {
        if self.dispatcher.is_in_flight(id) {
            return false;
        }
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.reset();
                true
            }
            None => false,
        }
    }

    /// Wait for the next completion and render it. Returns false when the
    /// completion was stale and nothing was rendered.
    pub async fn pump(&mut self) -> bool {
        match self.dispatcher.next_completion().await {
            Some(completion) => self.deliver(completion),
            None => false,
        }
    }

    /// Render every completion that is already available.
    pub fn pump_ready(&mut self) -> usize {
        let mut rendered = 0;
        while let Some(completion) = self.dispatcher.try_next_completion() {
            if self.deliver(completion) {
                rendered += 1;
            }
        }
        rendered
    }

    fn deliver(&mut self, completion: Completion) -> bool {
        let id = completion.handle.session;
        let Some(session) = self.sessions.get_mut(&id) else {
            tracing::debug!(session = %id, "Completion for closed session dropped");
            return false;
        };
        match self.dispatcher.on_complete(completion, session) {
            Some(display_text) => {
                (self.on_turn_rendered)(id, &display_text);
                true
            }
            None => false,
        }
    }

    /// Tear down: in-flight turns are abandoned and sessions dropped.
    /// Returns the number of abandoned turns.
    pub fn shutdown(self) -> usize {
        let abandoned = self.dispatcher.shutdown();
        tracing::info!(sessions = self.sessions.len(), abandoned, "Shell shut down");
        abandoned
    }
}
