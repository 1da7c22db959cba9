//! Turn dispatcher: one in-flight generation per session.
//!
//! Generation runs on tokio's blocking pool. Workers never touch session
//! state; they send a [`Completion`] back over a channel that the
//! interactive thread drains and folds into the owning session.

use std::collections::HashMap;
use std::future::Future;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;

use crate::error::{SessionError, SessionResult};
use crate::llm::{GenerationRequest, TokenSequence};
use crate::session::{GenerationSession, SessionId};

/// Correlates a completion with the submission that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnHandle {
    pub session: SessionId,
    pub issued_at: u64,
}

/// Result of a worker, delivered back to the interactive thread.
#[derive(Debug)]
pub struct Completion {
    pub handle: TurnHandle,
    pub request: GenerationRequest,
    pub result: SessionResult<TokenSequence>,
}

pub struct TurnDispatcher {
    runtime: Handle,
    in_flight: HashMap<SessionId, TurnHandle>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl TurnDispatcher {
    pub fn new(runtime: Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            runtime,
            in_flight: HashMap::new(),
            tx,
            rx,
        }
    }

    pub fn is_in_flight(&self, session: SessionId) -> bool {
        self.in_flight.contains_key(&session)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Run `generate_fn(request)` off the interactive thread.
    ///
    /// Returns `None` without doing anything when `session` already has a
    /// turn in flight.
    pub fn submit<F>(
        &mut self,
        session: SessionId,
        request: GenerationRequest,
        generate_fn: F,
    ) -> Option<TurnHandle>
    where
        F: FnOnce(&GenerationRequest) -> anyhow::Result<TokenSequence> + Send + 'static,
    {
        if let Some(current) = self.in_flight.get(&session) {
            tracing::debug!(
                session = %session,
                in_flight = current.issued_at,
                rejected = request.issued_at,
                "Submission rejected: turn already in flight"
            );
            return None;
        }

        let handle = TurnHandle {
            session,
            issued_at: request.issued_at,
        };
        self.in_flight.insert(session, handle);
        tracing::info!(
            session = %session,
            issued_at = handle.issued_at,
            input_tokens = request.input_tokens.len(),
            "Turn dispatched"
        );

        let worker_request = request.clone();
        let worker = self
            .runtime
            .spawn_blocking(move || generate_fn(&worker_request));

        let tx = self.tx.clone();
        self.runtime.spawn(async move {
            let result = match worker.await {
                Ok(Ok(tokens)) => Ok(tokens),
                Ok(Err(e)) => Err(SessionError::generation(format!("{:#}", e))),
                Err(e) if e.is_panic() => Err(SessionError::generation(panic_message(e.into_panic()))),
                Err(e) => Err(SessionError::generation(e)),
            };
            // A closed channel means the front-end shut down: drop the result.
            if tx.send(Completion { handle, request, result }).is_err() {
                tracing::debug!(session = %handle.session, "Completion abandoned after shutdown");
            }
        });

        Some(handle)
    }

    /// Wait for the next completion.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        self.rx.recv().await
    }

    /// Take a completion if one is ready, without waiting.
    pub fn try_next_completion(&mut self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }

    /// Fold a completion into its session on the interactive thread and clear
    /// the in-flight marker. Returns the text to render, or `None` for a
    /// stale completion (session closed or forgotten).
    pub fn on_complete(
        &mut self,
        completion: Completion,
        session: &mut GenerationSession,
    ) -> Option<String> {
        let Completion {
            handle,
            request,
            result,
        } = completion;

        if self.in_flight.get(&handle.session) != Some(&handle) {
            tracing::debug!(session = %handle.session, issued_at = handle.issued_at, "Dropping stale completion");
            return None;
        }
        if session.id() != handle.session {
            // The result is lost, but the owning session must not stay busy.
            self.in_flight.remove(&handle.session);
            tracing::warn!(
                expected = %handle.session,
                got = %session.id(),
                issued_at = handle.issued_at,
                "Completion delivered to the wrong session, turn dropped"
            );
            return None;
        }

        let text = match result {
            Ok(tokens) => match session.complete_turn(&request, &tokens) {
                Ok(text) => text,
                Err(e) => session.handle_failure(&request.user_text, Some(request.issued_at), &e),
            },
            Err(e) => session.handle_failure(&request.user_text, Some(request.issued_at), &e),
        };

        self.in_flight.remove(&handle.session);
        Some(text)
    }

    /// Forget the in-flight turn of a closed session. Its completion will be
    /// dropped as stale.
    pub fn forget(&mut self, session: SessionId) -> bool {
        self.in_flight.remove(&session).is_some()
    }

    /// Abandon all in-flight work. Running generations are not recalled;
    /// their results are discarded when they finish.
    pub fn shutdown(mut self) -> usize {
        let abandoned = self.in_flight.len();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        if abandoned > 0 {
            tracing::info!(abandoned, "Dispatcher shut down with turns in flight");
        }
        abandoned
    }
}

/// Drive `future` to completion, then tear the runtime down without waiting
/// for generations still running on the blocking pool.
pub fn block_on_detached<F: Future>(runtime: Runtime, future: F) -> F::Output {
    let output = runtime.block_on(future);
    runtime.shutdown_background();
    output
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {}", s)
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PromptTemplate, SamplingConfig, WindowConfig};
    use crate::llm::testing::{open_gate, ByteCodec, ScriptedEngine};
    use crate::llm::{GenerationEngine, TurnOutcome};
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    fn session() -> GenerationSession {
        GenerationSession::new(
            Arc::new(ByteCodec),
            &WindowConfig {
                max_total_tokens: 20,
                max_response_tokens: 5,
            },
            &SamplingConfig::default(),
            PromptTemplate::plain("<eot>"),
        )
        .unwrap()
    }

    fn generate_with(
        engine: Arc<ScriptedEngine>,
    ) -> impl FnOnce(&GenerationRequest) -> anyhow::Result<TokenSequence> + Send + 'static {
        move |request: &GenerationRequest| engine.generate(&request.input_tokens, &request.sampling)
    }

    async fn next(dispatcher: &mut TurnDispatcher) -> Completion {
        tokio::time::timeout(Duration::from_secs(5), dispatcher.next_completion())
            .await
            .expect("completion timed out")
            .expect("channel closed")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_submit_rejected_while_in_flight() {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let engine = Arc::new(ScriptedEngine::gated("ok", gate.clone()));
        let mut dispatcher = TurnDispatcher::new(Handle::current());
        let mut s = session();

        let first = s.start_turn("abc").unwrap().unwrap();
        let handle = dispatcher
            .submit(s.id(), first, generate_with(engine.clone()))
            .unwrap();
        assert!(dispatcher.is_in_flight(s.id()));

        let second = s.start_turn("def").unwrap().unwrap();
        assert!(dispatcher
            .submit(s.id(), second, generate_with(engine.clone()))
            .is_none());

        open_gate(&gate);
        let completion = next(&mut dispatcher).await;
        assert_eq!(completion.handle, handle);
        assert_eq!(dispatcher.on_complete(completion, &mut s).as_deref(), Some("ok"));
        assert!(!dispatcher.is_in_flight(s.id()));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);

        // Submission is re-enabled
        let third = s.start_turn("ghi").unwrap().unwrap();
        assert!(dispatcher
            .submit(s.id(), third, generate_with(engine.clone()))
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_generation_failure_keeps_history_and_clears_marker() {
        let mut dispatcher = TurnDispatcher::new(Handle::current());
        let mut s = session();
        let engine = Arc::new(ScriptedEngine::failing());

        let request = s.start_turn("abc").unwrap().unwrap();
        dispatcher.submit(s.id(), request, generate_with(engine));
        let completion = next(&mut dispatcher).await;
        let text = dispatcher.on_complete(completion, &mut s).unwrap();

        assert!(text.starts_with("Error: generation failed"));
        assert!(text.contains("out of memory"));
        assert!(s.history().is_none());
        assert_eq!(s.transcript()[0].outcome, TurnOutcome::Failed);
        assert!(!dispatcher.is_in_flight(s.id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_undecodable_reply_renders_encoding_error() {
        let mut dispatcher = TurnDispatcher::new(Handle::current());
        let mut s = session();

        let request = s.start_turn("abc").unwrap().unwrap();
        dispatcher.submit(s.id(), request, |_| -> anyhow::Result<TokenSequence> {
            Ok(TokenSequence::new(vec![ByteCodec::UNDECODABLE, ByteCodec::EOT]))
        });
        let completion = next(&mut dispatcher).await;
        let text = dispatcher.on_complete(completion, &mut s).unwrap();

        assert!(text.starts_with("Error: encoding failed"));
        assert!(s.history().is_none());
        assert_eq!(s.transcript().len(), 1);
        assert_eq!(s.transcript()[0].outcome, TurnOutcome::Failed);
        assert!(!dispatcher.is_in_flight(s.id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_panic_becomes_failure() {
        let mut dispatcher = TurnDispatcher::new(Handle::current());
        let mut s = session();

        let request = s.start_turn("abc").unwrap().unwrap();
        dispatcher.submit(s.id(), request, |_| -> anyhow::Result<TokenSequence> {
            panic!("engine exploded")
        });
        let completion = next(&mut dispatcher).await;
        let text = dispatcher.on_complete(completion, &mut s).unwrap();

        assert!(text.contains("engine exploded"));
        assert!(!dispatcher.is_in_flight(s.id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_forgotten_session_completion_is_stale() {
        let mut dispatcher = TurnDispatcher::new(Handle::current());
        let mut s = session();
        let engine = Arc::new(ScriptedEngine::replying("late"));

        let request = s.start_turn("abc").unwrap().unwrap();
        dispatcher.submit(s.id(), request, generate_with(engine));
        assert!(dispatcher.forget(s.id()));

        let completion = next(&mut dispatcher).await;
        assert!(dispatcher.on_complete(completion, &mut s).is_none());
        assert!(s.history().is_none());
        assert!(s.transcript().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_independent_sessions_run_concurrently() {
        let mut dispatcher = TurnDispatcher::new(Handle::current());
        let engine = Arc::new(ScriptedEngine::replying("hi"));
        let mut a = session();
        let mut b = session();

        let ra = a.start_turn("one").unwrap().unwrap();
        let rb = b.start_turn("two").unwrap().unwrap();
        assert!(dispatcher.submit(a.id(), ra, generate_with(engine.clone())).is_some());
        assert!(dispatcher.submit(b.id(), rb, generate_with(engine.clone())).is_some());
        assert_eq!(dispatcher.in_flight_count(), 2);

        for _ in 0..2 {
            let completion = next(&mut dispatcher).await;
            let target = if completion.handle.session == a.id() { &mut a } else { &mut b };
            assert_eq!(dispatcher.on_complete(completion, target).as_deref(), Some("hi"));
        }
        assert!(a.history().is_some());
        assert!(b.history().is_some());
        assert_eq!(dispatcher.in_flight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_misrouted_completion_clears_marker() {
        let mut dispatcher = TurnDispatcher::new(Handle::current());
        let engine = Arc::new(ScriptedEngine::replying("hi"));
        let mut a = session();
        let mut b = session();

        let request = a.start_turn("one").unwrap().unwrap();
        dispatcher.submit(a.id(), request, generate_with(engine));
        let completion = next(&mut dispatcher).await;

        assert!(dispatcher.on_complete(completion, &mut b).is_none());
        assert!(!dispatcher.is_in_flight(a.id()));
        assert!(b.history().is_none());
        assert!(b.transcript().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_abandons_in_flight() {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let engine = Arc::new(ScriptedEngine::gated("never shown", gate.clone()));
        let mut dispatcher = TurnDispatcher::new(Handle::current());
        let mut s = session();

        let request = s.start_turn("abc").unwrap().unwrap();
        dispatcher.submit(s.id(), request, generate_with(engine.clone()));
        assert_eq!(dispatcher.shutdown(), 1);

        // Let the worker finish into a closed channel
        open_gate(&gate);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(s.history().is_none());
    }
}
