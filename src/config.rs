//! Configuration management for Causerie
//!
//! Handles model selection, token budgets, sampling defaults and persistence
//! of user preferences.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::SessionError;
use crate::llm::ContextWindow;

/// Device preference for compute
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum DevicePreference {
    /// Automatically detect best available device (GPU if available, else CPU)
    #[default]
    Auto,
    /// Force CPU usage
    Cpu,
    /// Force Metal GPU (macOS Apple Silicon)
    Metal,
    /// Force CUDA GPU (NVIDIA)
    Cuda,
}

impl DevicePreference {
    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Metal => "metal",
            Self::Cuda => "cuda",
        }
    }

    /// Get all available options
    pub fn all() -> Vec<Self> {
        vec![Self::Auto, Self::Cpu, Self::Metal, Self::Cuda]
    }
}

/// How a user turn is framed for the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    /// Prepended to the user text before encoding
    pub user_prefix: &'static str,
    /// Encoded once and appended after the end-of-turn marker
    pub assistant_cue: &'static str,
    /// Vocabulary entry used as the end-of-turn marker
    pub end_of_turn: &'static str,
}

impl PromptTemplate {
    /// Bare utterances separated by the end-of-turn marker.
    pub fn plain(end_of_turn: &'static str) -> Self {
        Self {
            user_prefix: "",
            assistant_cue: "",
            end_of_turn,
        }
    }

    pub fn render_user(&self, text: &str) -> String {
        format!("{}{}", self.user_prefix, text)
    }
}

/// Available chat models
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChatModel {
    /// Phi-3 mini, 4k context (default)
    Phi3Mini4kInstruct,
    /// Phi-3.5 mini, 128k context
    Phi35MiniInstruct,
}

impl ChatModel {
    /// Display name for the model
    pub fn name(&self) -> &'static str {
        match self {
            Self::Phi3Mini4kInstruct => "phi-3-mini-4k-instruct",
            Self::Phi35MiniInstruct => "phi-3.5-mini-instruct",
        }
    }

    /// HuggingFace model ID
    pub fn hf_id(&self) -> &'static str {
        match self {
            Self::Phi3Mini4kInstruct => "microsoft/Phi-3-mini-4k-instruct",
            Self::Phi35MiniInstruct => "microsoft/Phi-3.5-mini-instruct",
        }
    }

    /// Native context length of the model
    pub fn context_length(&self) -> usize {
        match self {
            Self::Phi3Mini4kInstruct => 4096,
            Self::Phi35MiniInstruct => 131_072,
        }
    }

    /// Approximate model size in MB
    pub fn size_mb(&self) -> u32 {
        match self {
            Self::Phi3Mini4kInstruct => 7_640,
            Self::Phi35MiniInstruct => 7_640,
        }
    }

    pub fn template(&self) -> PromptTemplate {
        match self {
            Self::Phi3Mini4kInstruct | Self::Phi35MiniInstruct => PromptTemplate {
                user_prefix: "<|user|>\n",
                assistant_cue: "\n<|assistant|>\n",
                end_of_turn: "<|end|>",
            },
        }
    }

    /// Get all available models
    pub fn all() -> Vec<Self> {
        vec![Self::Phi3Mini4kInstruct, Self::Phi35MiniInstruct]
    }
}

impl Default for ChatModel {
    fn default() -> Self {
        Self::Phi3Mini4kInstruct
    }
}

/// Token budget of a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowConfig {
    /// Maximum tokens the model sees per request (input + response)
    pub max_total_tokens: usize,
    /// Tokens reserved for the response
    pub max_response_tokens: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_total_tokens: 1024,
            max_response_tokens: 500,
        }
    }
}

impl WindowConfig {
    pub fn window(&self) -> Result<ContextWindow, SessionError> {
        ContextWindow::new(self.max_total_tokens, self.max_response_tokens)
    }

    /// Like [`window`](Self::window), also rejecting a window wider than the
    /// model's context.
    pub fn window_for(&self, model: &ChatModel) -> Result<ContextWindow, SessionError> {
        let window = self.window()?;
        if self.max_total_tokens > model.context_length() {
            return Err(SessionError::ContextOverflow {
                max_total_tokens: self.max_total_tokens,
                context_length: model.context_length(),
            });
        }
        Ok(window)
    }
}

/// Fixed sampling parameters for every turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingConfig {
    /// Clamped to the window's response reserve when building requests
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    pub do_sample: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    299_792_458
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 300,
            temperature: 0.7,
            top_p: 0.9,
            top_k: None,
            do_sample: true,
            seed: default_seed(),
        }
    }
}

/// Causerie configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Selected chat model
    #[serde(default)]
    pub model: ChatModel,
    /// Device preference (auto, cpu, metal, cuda)
    #[serde(default)]
    pub device: DevicePreference,
    /// Version of config schema (for future migrations)
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ChatModel::default(),
            device: DevicePreference::default(),
            version: 1,
            window: WindowConfig::default(),
            sampling: SamplingConfig::default(),
        }
    }
}

impl Config {
    /// Get the config file path (~/.causerie/config.toml)
    pub fn path() -> Result<PathBuf> {
        Ok(causerie_dir()?.join("config.toml"))
    }

    /// Check if config exists (i.e., not first run)
    pub fn exists() -> bool {
        Self::path().map(|p| p.exists()).unwrap_or(false)
    }

    /// Load config from disk, or return None if it doesn't exist
    pub fn load() -> Result<Option<Self>> {
        Self::load_from(&Self::path()?)
    }

    /// Load config from a specific file
    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .context("Failed to read config file")?;
        let config: Self = toml::from_str(&content)
            .context("Failed to parse config file")?;
        Ok(Some(config))
    }

    /// Load config from disk, falling back to defaults on first run
    pub fn load_or_default() -> Result<Self> {
        Ok(Self::load()?.unwrap_or_default())
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path()?)
    }

    /// Save config to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;
        std::fs::write(path, content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Reject budgets that leave no room for input or that the model cannot
    /// hold.
    pub fn validate(&self) -> Result<(), SessionError> {
        self.window.window_for(&self.model).map(|_| ())
    }
}

/// Get the base causerie directory path (~/.causerie)
pub fn causerie_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".causerie"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.model, ChatModel::Phi3Mini4kInstruct);
        assert_eq!(config.window.max_total_tokens, 1024);
        assert_eq!(config.window.max_response_tokens, 500);
        assert!(config.sampling.do_sample);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_model_metadata() {
        let model = ChatModel::Phi3Mini4kInstruct;
        assert_eq!(model.context_length(), 4096);
        assert_eq!(model.hf_id(), "microsoft/Phi-3-mini-4k-instruct");
        assert_eq!(model.template().end_of_turn, "<|end|>");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.model, parsed.model);
        assert_eq!(config.window, parsed.window);
        assert_eq!(config.sampling, parsed.sampling);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("[window]\nmax_total_tokens = 64\nmax_response_tokens = 16\n").unwrap();
        assert_eq!(parsed.window.max_total_tokens, 64);
        assert_eq!(parsed.sampling, SamplingConfig::default());
        assert_eq!(parsed.version, 1);
    }

    #[test]
    fn test_validate_rejects_exhausted_budget() {
        let mut config = Config::default();
        config.window.max_response_tokens = config.window.max_total_tokens;
        assert!(matches!(
            config.validate(),
            Err(SessionError::BudgetViolation { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_window_wider_than_model() {
        let mut config = Config::default();
        config.window.max_total_tokens = config.model.context_length() + 1;
        assert_eq!(
            config.validate(),
            Err(SessionError::ContextOverflow {
                max_total_tokens: 4097,
                context_length: 4096,
            })
        );

        config.window.max_total_tokens = config.model.context_length();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hand_edited_window_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[window]\nmax_total_tokens = 100000\nmax_response_tokens = 500\n").unwrap();

        let config = Config::load_from(&path).unwrap().unwrap();
        assert!(matches!(
            config.validate(),
            Err(SessionError::ContextOverflow { .. })
        ));
    }

    #[test]
    fn test_save_and_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        assert!(Config::load_from(&path).unwrap().is_none());

        let mut config = Config::default();
        config.device = DevicePreference::Cpu;
        config.sampling.top_k = Some(40);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.device, DevicePreference::Cpu);
        assert_eq!(loaded.sampling.top_k, Some(40));
    }

    #[test]
    fn test_plain_template_renders_text_unchanged() {
        let template = PromptTemplate::plain("<|endoftext|>");
        assert_eq!(template.render_user("hello"), "hello");
        assert_eq!(template.assistant_cue, "");
    }
}
