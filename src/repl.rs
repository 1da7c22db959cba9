//! Interactive REPL for Causerie
//!
//! Run `causerie` with no arguments to enter chat mode. Input is read on the
//! interactive task while generation runs in the background; lines typed
//! while the assistant is thinking are dropped.

use anyhow::Result;
use colored::*;
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;

use crate::config::Config;
use crate::llm::{Backend, TurnOutcome};
use crate::shell::{ChatShell, SubmitOutcome};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command definition with name and description
struct Command {
    name: &'static str,
    description: &'static str,
}

const COMMANDS: &[Command] = &[
    Command { name: "/history", description: "Show this conversation" },
    Command { name: "/reset", description: "Start a new conversation" },
    Command { name: "/info", description: "Show model and budget" },
    Command { name: "/help", description: "Show this help" },
    Command { name: "quit", description: "Exit (or 'exit')" },
];

/// Print the welcome banner
fn print_banner(config: &Config, model_id: &str) {
    println!();
    println!(
        "  {} v{}  ·  {}",
        "Causerie".green().bold(),
        VERSION,
        model_id.cyan()
    );
    println!(
        "  {}",
        format!(
            "{} token window, {} reserved for replies",
            config.window.max_total_tokens, config.window.max_response_tokens
        )
        .dimmed()
    );
    println!();
    println!("  {} {}", "Assistant:".blue().bold(), "Ready to chat! Ask me anything.");
    println!("  {}", "Type /help for commands.".dimmed());
    println!();
}

fn print_help() {
    println!();
    for cmd in COMMANDS {
        println!("  {:<10} {}", cmd.name.cyan(), cmd.description.dimmed());
    }
    println!();
}

fn prompt() {
    print!("{} ", ">".green());
    let _ = io::stdout().flush();
}

/// Run the chat loop until quit or end of input.
pub async fn run_repl(backend: Backend, config: Config) -> Result<()> {
    let model_id = backend.engine.model_id();
    let template = config.model.template();

    let mut shell = ChatShell::new(
        backend,
        config.clone(),
        template,
        Handle::current(),
        Box::new(|_: crate::SessionId, text: &str| {
            println!("\r{} {}\n", "Assistant:".blue().bold(), text);
            prompt();
        }),
    )?;
    let session = shell.open_session()?;

    print_banner(&config, &model_id);
    prompt();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let text = line.trim();

                match text {
                    "/help" => {
                        print_help();
                        prompt();
                        continue;
                    }
                    "/info" => {
                        print_info(&shell, session, &config, &model_id);
                        prompt();
                        continue;
                    }
                    "/history" => {
                        print_history(&shell, session);
                        prompt();
                        continue;
                    }
                    "/reset" => {
                        if shell.reset_session(session) {
                            println!("  {}\n", "Started a new conversation.".dimmed());
                        } else {
                            println!("  {}\n", "Wait for the current reply first.".yellow());
                        }
                        prompt();
                        continue;
                    }
                    _ => {}
                }

                match shell.on_user_submit(session, text) {
                    SubmitOutcome::Quit => break,
                    SubmitOutcome::Ignored => prompt(),
                    SubmitOutcome::Busy => {
                        println!("  {}", "Still thinking... your message was not sent.".yellow());
                    }
                    SubmitOutcome::Rendered => {}
                    SubmitOutcome::Dispatched(_) => {
                        println!("  {}", "Thinking...".dimmed());
                    }
                }
            }
            _ = shell.pump(), if shell.busy(session) => {}
        }
    }

    let abandoned = shell.shutdown();
    if abandoned > 0 {
        println!("{}", "Abandoned the reply in progress.".dimmed());
    }
    println!("Goodbye!");
    Ok(())
}

fn print_info(shell: &ChatShell, session: crate::SessionId, config: &Config, model_id: &str) {
    let history_tokens = shell
        .session(session)
        .and_then(|s| s.history())
        .map(|h| h.len())
        .unwrap_or(0);
    let budget = config.window.max_total_tokens - config.window.max_response_tokens;

    println!();
    println!("  {:<16} {}", "Model:".dimmed(), model_id);
    println!("  {:<16} {}", "Device:".dimmed(), config.device.name());
    println!("  {:<16} {} / {}", "History tokens:".dimmed(), history_tokens, budget);
    println!(
        "  {:<16} temperature {}, top_p {}, max {} new",
        "Sampling:".dimmed(),
        config.sampling.temperature,
        config.sampling.top_p,
        config.sampling.max_new_tokens
    );
    println!();
}

fn print_history(shell: &ChatShell, session: crate::SessionId) {
    let Some(session) = shell.session(session) else {
        return;
    };
    if session.transcript().is_empty() {
        println!("  {}\n", "No messages yet.".dimmed());
        return;
    }

    println!();
    for turn in session.transcript() {
        println!("  {} {}", "You:".green().bold(), turn.user_text);
        let label = match turn.outcome {
            TurnOutcome::Completed => "Assistant:".blue().bold(),
            TurnOutcome::Failed => "Assistant:".red().bold(),
        };
        println!(
            "  {} {}  {}",
            label,
            turn.response_text,
            turn.at.format("%H:%M:%S").to_string().dimmed()
        );
    }
    println!();
}
