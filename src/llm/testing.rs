//! In-memory backend doubles for unit tests.

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use super::provider::{Backend, GenerationEngine, TokenCodec};
use super::types::{SamplingParams, TokenSequence};

/// One token per byte, offset past the special ids.
pub struct ByteCodec;

impl ByteCodec {
    pub const EOT: u32 = 0;
    const OFFSET: u32 = 1;
    /// Text this codec refuses to encode.
    pub const UNENCODABLE: &'static str = "\u{FFFD}";
    /// Token id this codec refuses to decode.
    pub const UNDECODABLE: u32 = u32::MAX;
}

impl TokenCodec for ByteCodec {
    fn encode(&self, text: &str) -> Result<TokenSequence> {
        if text.contains(Self::UNENCODABLE) {
            bail!("replacement character in input");
        }
        Ok(text.bytes().map(|b| b as u32 + Self::OFFSET).collect::<Vec<_>>().into())
    }

    fn decode(&self, tokens: &TokenSequence) -> Result<String> {
        if tokens.as_slice().contains(&Self::UNDECODABLE) {
            bail!("token {} is outside the vocabulary", Self::UNDECODABLE);
        }
        let bytes: Vec<u8> = tokens
            .as_slice()
            .iter()
            .filter(|&&id| id >= Self::OFFSET)
            .map(|&id| (id - Self::OFFSET) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn end_of_turn_token_id(&self) -> u32 {
        Self::EOT
    }
}

/// Replies with a fixed text, or fails when told to.
pub struct ScriptedEngine {
    reply: String,
    fail: bool,
    pub calls: AtomicUsize,
    /// When set, `generate` waits until the gate opens.
    gate: Option<Arc<(Mutex<bool>, Condvar)>>,
}

impl ScriptedEngine {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            fail: false,
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::replying("")
        }
    }

    pub fn gated(reply: &str, gate: Arc<(Mutex<bool>, Condvar)>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::replying(reply)
        }
    }
}

impl GenerationEngine for ScriptedEngine {
    fn generate(&self, _input: &TokenSequence, params: &SamplingParams) -> Result<TokenSequence> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let (open, cvar) = &**gate;
            let mut open = open.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
        }
        if self.fail {
            bail!("out of memory");
        }
        let mut ids = ByteCodec.encode(&self.reply)?.as_slice().to_vec();
        ids.push(params.eos_token_id);
        Ok(ids.into())
    }

    fn model_id(&self) -> String {
        "scripted".to_string()
    }
}

pub fn open_gate(gate: &Arc<(Mutex<bool>, Condvar)>) {
    let (open, cvar) = &**gate;
    *open.lock().unwrap() = true;
    cvar.notify_all();
}

pub fn backend(engine: ScriptedEngine) -> Backend {
    Backend::new(Arc::new(ByteCodec), Arc::new(engine))
}
