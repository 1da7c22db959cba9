//! Causerie - bounded-context chat with a local language model
//!
//! The core keeps a conversation's token history under a fixed budget,
//! builds one generation request per turn, runs generation off the
//! interactive thread and folds the result back into the history.
//!
//! ```text
//! user text → ContextWindow → TurnDispatcher (worker) → GenerationEngine
//!                                     ↓
//!   on_turn_rendered ← GenerationSession.complete_turn ← completion channel
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod init;
pub mod llm;
pub mod repl;
pub mod session;
pub mod shell;

pub use config::{ChatModel, Config, DevicePreference, PromptTemplate, SamplingConfig, WindowConfig};
pub use dispatch::{block_on_detached, Completion, TurnDispatcher, TurnHandle};
pub use error::{SessionError, SessionResult};
pub use init::{run_init, show_welcome, InitResult};
pub use llm::{
    Backend, ContextWindow, GenerationEngine, GenerationRequest, SamplingParams, TokenCodec,
    TokenSequence, Turn, TurnOutcome,
};
pub use repl::run_repl;
pub use session::{GenerationSession, SessionId, SessionState};
pub use shell::{is_quit_command, ChatShell, RenderCallback, SubmitOutcome};
