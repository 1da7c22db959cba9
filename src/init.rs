//! Initialization flow for Causerie
//!
//! Handles first-run setup: model, device and token budget selection.

use crate::config::{ChatModel, Config, DevicePreference, WindowConfig};
use anyhow::Result;
use std::io::{self, Write};

/// Result of running the init flow
#[derive(Debug)]
pub enum InitResult {
    /// User completed init with this config
    Configured(Config),
    /// User cancelled the init
    Cancelled,
}

/// Run the interactive init flow
pub fn run_init(existing_config: Option<&Config>) -> Result<InitResult> {
    if let Some(config) = existing_config {
        println!("\nCurrent configuration:");
        println!("  Model:  {}", config.model.name());
        println!("  Device: {}", config.device.name());
        println!(
            "  Window: {} tokens ({} reserved for replies)",
            config.window.max_total_tokens, config.window.max_response_tokens
        );
        println!();
    }

    // Show options
    println!("[D] Default - {} ({}MB), {} device",
        ChatModel::default().name(),
        ChatModel::default().size_mb(),
        DevicePreference::default().name()
    );
    println!("[C] Custom  - Choose model, device and window");
    println!("[Q] Quit");
    println!();

    let input = read_line("Choice [D/c/q]: ")?.to_lowercase();

    let config = match input.as_str() {
        "q" | "quit" => return Ok(InitResult::Cancelled),
        "c" | "custom" => run_custom_selection(existing_config)?,
        _ => Config::default(),
    };

    // Save config
    config.save()?;

    Ok(InitResult::Configured(config))
}

/// Run custom selection
fn run_custom_selection(existing_config: Option<&Config>) -> Result<Config> {
    let base = existing_config.cloned().unwrap_or_default();

    let models = ChatModel::all();
    let labels: Vec<String> = models
        .iter()
        .map(|m| format!("{} ({}MB, {} ctx)", m.name(), m.size_mb(), m.context_length()))
        .collect();
    let current = models.iter().position(|m| *m == base.model);
    let model = models[select("Chat model:", &labels, current)?].clone();

    let devices = DevicePreference::all();
    let labels: Vec<String> = devices.iter().map(|d| d.name().to_string()).collect();
    let current = devices.iter().position(|d| *d == base.device);
    let device = devices[select("Device:", &labels, current)?].clone();

    let window = select_window(&base.window, &model)?;

    Ok(Config {
        model,
        device,
        window,
        ..base
    })
}

/// Ask for the token window, re-prompting on a budget that leaves no room
/// for input.
fn select_window(current: &WindowConfig, model: &ChatModel) -> Result<WindowConfig> {
    println!();
    println!("Token window (model supports up to {}):", model.context_length());

    loop {
        let total = read_line(&format!("  Max total tokens [{}]: ", current.max_total_tokens))?;
        let response = read_line(&format!("  Reserved for replies [{}]: ", current.max_response_tokens))?;

        let window = WindowConfig {
            max_total_tokens: parse_or(&total, current.max_total_tokens),
            max_response_tokens: parse_or(&response, current.max_response_tokens),
        };
        match window.window_for(model) {
            Ok(_) => return Ok(window),
            Err(e) => println!("{}, try again.", e),
        }
    }
}

/// Show numbered options and return the chosen index
fn select(label: &str, options: &[String], current: Option<usize>) -> Result<usize> {
    println!();
    println!("{}", label);

    for (i, option) in options.iter().enumerate() {
        let current_marker = if Some(i) == current { " ← current" } else { "" };
        println!("  [{}] {}{}", i + 1, option, current_marker);
    }
    println!();

    let default_idx = current.unwrap_or(0);
    let input = read_line(&format!("Choice [{}]: ", default_idx + 1))?;
    let choice = parse_choice(&input, options.len(), default_idx);
    if choice.is_none() {
        println!("Invalid selection, using default.");
    }
    Ok(choice.unwrap_or(default_idx))
}

/// 1-based menu choice; empty input picks the default
fn parse_choice(input: &str, len: usize, default_idx: usize) -> Option<usize> {
    let input = input.trim();
    if input.is_empty() {
        return Some(default_idx);
    }
    match input.parse::<usize>() {
        Ok(n) if n >= 1 && n <= len => Some(n - 1),
        _ => None,
    }
}

fn parse_or(input: &str, default: usize) -> usize {
    input.trim().parse().unwrap_or(default)
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Display first-run welcome message
pub fn show_welcome() {
    println!("Causerie v{} - Chat with a local language model\n",
        env!("CARGO_PKG_VERSION")
    );
    println!("First run detected. Let's set you up.\n");
}
