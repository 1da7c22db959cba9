//! Candle-based local backend (Phi-3).
//!
//! Runs Phi-3 locally using the `candle` crate. Weights and tokenizer are
//! fetched from the HuggingFace hub on first use and cached by `hf_hub`.

use super::provider::{Backend, GenerationEngine, TokenCodec};
use super::types::{SamplingParams, TokenSequence};
use crate::config::{ChatModel, Config, DevicePreference};
use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::phi3::{Config as Phi3Config, Model as Phi3};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
const WEIGHTS_FILE: &str = "model.safetensors";

/// Tokens that also end a Phi-3 reply, per its generation config.
const EXTRA_STOP_TOKENS: &[&str] = &["<|endoftext|>", "<|assistant|>"];

/// Tokenizer wrapper implementing [`TokenCodec`].
pub struct CandleCodec {
    tokenizer: Tokenizer,
    end_of_turn: u32,
    stop: Vec<u32>,
    pad: Option<u32>,
}

impl CandleCodec {
    /// `end_of_turn` must be a token in the vocabulary.
    pub fn new(tokenizer: Tokenizer, end_of_turn: &str) -> Result<Self> {
        let end_of_turn_id = tokenizer
            .token_to_id(end_of_turn)
            .with_context(|| format!("Tokenizer has no {} token", end_of_turn))?;
        let pad = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| tokenizer.token_to_id("<pad>"));

        let mut stop = Vec::new();
        for token in EXTRA_STOP_TOKENS {
            if let Some(id) = tokenizer.token_to_id(token) {
                if id != end_of_turn_id && !stop.contains(&id) {
                    stop.push(id);
                }
            }
        }

        Ok(Self {
            tokenizer,
            end_of_turn: end_of_turn_id,
            stop,
            pad,
        })
    }
}

impl TokenCodec for CandleCodec {
    fn encode(&self, text: &str) -> Result<TokenSequence> {
        let encoding = self.tokenizer.encode(text, false).map_err(anyhow::Error::msg)?;
        Ok(encoding.get_ids().to_vec().into())
    }

    fn decode(&self, tokens: &TokenSequence) -> Result<String> {
        self.tokenizer
            .decode(tokens.as_slice(), true)
            .map_err(anyhow::Error::msg)
    }

    fn end_of_turn_token_id(&self) -> u32 {
        self.end_of_turn
    }

    fn stop_token_ids(&self) -> Vec<u32> {
        self.stop.clone()
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad
    }
}

/// Phi-3 model implementing [`GenerationEngine`].
///
/// The model holds a KV cache, so generations are serialized on a mutex.
pub struct CandleEngine {
    model: Mutex<Phi3>,
    device: Device,
    model_id: String,
}

impl CandleEngine {
    pub fn new(model: Phi3, device: Device, model_id: impl Into<String>) -> Self {
        Self {
            model: Mutex::new(model),
            device,
            model_id: model_id.into(),
        }
    }
}

impl GenerationEngine for CandleEngine {
    fn generate(&self, input: &TokenSequence, params: &SamplingParams) -> Result<TokenSequence> {
        if input.is_empty() {
            bail!("Cannot generate from an empty input");
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("Model lock poisoned by an earlier generation"))?;
        model.clear_kv_cache();

        let mut logits_processor = LogitsProcessor::from_sampling(params.seed, sampling_for(params));
        let mut context: Vec<u32> = input.as_slice().to_vec();
        let mut output = Vec::with_capacity(params.max_new_tokens);
        let mut offset = 0;

        // Prefill with the whole input, then feed one token at a time
        for _ in 0..params.max_new_tokens {
            let step = Tensor::new(&context[offset..], &self.device)?.unsqueeze(0)?;
            let logits = model.forward(&step, offset)?;
            let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
            let logits = logits.get(logits.dim(0)? - 1)?;

            let next_token = logits_processor.sample(&logits)?;
            output.push(next_token);
            offset = context.len();
            context.push(next_token);

            if params.is_stop(next_token) {
                break;
            }
        }

        tracing::debug!(
            model = %self.model_id,
            input_tokens = input.len(),
            output_tokens = output.len(),
            "Generation finished"
        );
        Ok(output.into())
    }

    fn model_id(&self) -> String {
        self.model_id.clone()
    }
}

fn sampling_for(params: &SamplingParams) -> Sampling {
    if !params.do_sample || params.temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    match params.top_k {
        Some(k) => Sampling::TopKThenTopP {
            k,
            p: params.top_p,
            temperature: params.temperature,
        },
        None => Sampling::TopP {
            p: params.top_p,
            temperature: params.temperature,
        },
    }
}

/// Pick the compute device according to the user's preference
pub fn select_device(preference: &DevicePreference) -> Result<Device> {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => Device::new_cuda(0).context("CUDA device unavailable")?,
        DevicePreference::Metal => Device::new_metal(0).context("Metal device unavailable")?,
        DevicePreference::Auto => {
            if candle_core::utils::cuda_is_available() {
                Device::new_cuda(0)?
            } else if candle_core::utils::metal_is_available() {
                Device::new_metal(0)?
            } else {
                Device::Cpu
            }
        }
    };
    Ok(device)
}

/// Download (or reuse cached) model files and build the codec + engine pair.
pub fn load_backend(config: &Config, show_progress: bool) -> Result<Backend> {
    let model = &config.model;
    let device = select_device(&config.device)?;

    if show_progress {
        eprintln!("  {} ({} MB)", model.name(), model.size_mb());
    }

    let api = ApiBuilder::new()
        .with_progress(show_progress)
        .build()
        .context("Failed to create HuggingFace API")?;
    let repo = api.repo(Repo::new(model.hf_id().to_string(), RepoType::Model));

    let config_path = repo.get(CONFIG_FILE).context("Failed to get config.json")?;
    let tokenizer_path = repo.get(TOKENIZER_FILE).context("Failed to get tokenizer.json")?;
    let weights = weight_files(&repo)?;

    let phi_config: Phi3Config = serde_json::from_slice(&std::fs::read(&config_path)?)
        .context("Failed to parse model config")?;
    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

    let dtype = if device.is_cuda() { DType::BF16 } else { DType::F32 };
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, &device)? };
    let phi = Phi3::new(&phi_config, vb).context("Failed to load model weights")?;

    if show_progress {
        eprintln!("done");
    }
    tracing::info!(model = model.name(), device = ?device, "Model loaded");

    let codec = CandleCodec::new(tokenizer, model.template().end_of_turn)?;
    let engine = CandleEngine::new(phi, device, model.name());
    Ok(Backend::new(Arc::new(codec), Arc::new(engine)))
}

/// Resolve the safetensors shards listed in the index, or the single file.
fn weight_files(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    let Ok(index_path) = repo.get(WEIGHTS_INDEX_FILE) else {
        return Ok(vec![repo.get(WEIGHTS_FILE).context("Failed to get model.safetensors")?]);
    };

    let index: serde_json::Value = serde_json::from_slice(&std::fs::read(&index_path)?)?;
    let weight_map = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .context("Weights index has no weight_map")?;

    let shards: BTreeSet<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    shards
        .into_iter()
        .map(|shard| repo.get(shard).with_context(|| format!("Failed to get {}", shard)))
        .collect()
}

/// Whether the model's files are already in the local hub cache.
pub fn is_cached(model: &ChatModel) -> bool {
    let cache = hf_hub::Cache::default();
    let repo = cache.repo(Repo::new(model.hf_id().to_string(), RepoType::Model));
    repo.get(CONFIG_FILE).is_some() && repo.get(TOKENIZER_FILE).is_some()
}
