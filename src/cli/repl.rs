//! Interactive REPL for gantry
//!
//! Provides the main user interaction loop.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentEvent, EventCallback};
use crate::cli::commands::{handle_command, CommandResult};
use crate::core::{Config, GantryError, Result};
use crate::executor::ShellOutputEvent;

/// Interactive REPL (Read-Eval-Print Loop)
pub struct Repl {
    agent: Agent,
}

impl Repl {
    /// Create a REPL over the configured Ollama backend
    pub fn with_config(config: Config) -> Result<Self> {
        Ok(Self::with_agent(Agent::new(config)?))
    }

    /// Wrap an existing agent, printing its progress to the terminal
    pub fn with_agent(agent: Agent) -> Self {
        Self {
            agent: agent.with_events(console_events()),
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Run the REPL
    pub async fn run(&mut self) -> Result<()> {
        self.print_banner();

        let stdin = io::stdin();
        let mut stdout = io::stdout();

        loop {
            print!("You: ");
            stdout.flush()?;

            let mut input = String::new();
            match stdin.lock().read_line(&mut input) {
                Ok(0) => {
                    // EOF (Ctrl+D)
                    println!("\nGoodbye!");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read input");
                    continue;
                }
            }

            let input = input.trim();
            if input.is_empty() {
                continue;
            }

            match handle_command(input, &mut self.agent) {
                CommandResult::Exit => {
                    println!("\nGoodbye!");
                    break;
                }
                CommandResult::Clear => {
                    println!("Conversation cleared.\n");
                }
                CommandResult::Handled(output) => {
                    println!("{}\n", output);
                }
                CommandResult::Continue(input) => {
                    println!("\nAssistant:");
                    match self.run_prompt(&input).await {
                        Ok(_) => println!("\n"),
                        Err(GantryError::Cancelled) => println!("\n[cancelled]\n"),
                        Err(e) => eprintln!("\nError: {}\n", e),
                    }
                }
            }
        }

        Ok(())
    }

    /// Process one prompt; Ctrl-C cancels it
    async fn run_prompt(&mut self, input: &str) -> Result<String> {
        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };

        let outcome = self.agent.process(input, cancel).await;
        watcher.abort();
        outcome
    }

    /// Print the startup banner
    fn print_banner(&self) {
        let config = self.agent.config();

        println!("gantry {}", env!("CARGO_PKG_VERSION"));
        match config.backend_url() {
            Ok(url) => println!("Backend: {}", url),
            Err(e) => println!("Backend: invalid ({})", e),
        }
        println!("Model:   {}", self.agent.model());
        println!();
        println!("Commands: help, clear, history, status, model, pty, exit");
        println!("─────────────────────────────────────────────────────────");
    }
}

/// Print model text, tool activity and live shell output
pub fn console_events() -> EventCallback {
    Arc::new(|event| {
        let mut stdout = io::stdout();
        match event {
            AgentEvent::Text(text) => print!("{}", text),
            AgentEvent::ToolCall(call) => {
                println!("\n→ {} {}", call.name, call.args);
            }
            AgentEvent::ToolResult {
                name,
                success,
                display,
            } => {
                let mark = if success { "✓" } else { "✗" };
                let first = display.lines().next().unwrap_or("");
                println!("{} {}: {}", mark, name, first);
            }
            AgentEvent::Shell(ShellOutputEvent::Data { chunk, .. }) => print!("{}", chunk),
            AgentEvent::Shell(ShellOutputEvent::BinaryDetected) => {
                println!("[binary output detected]");
            }
            AgentEvent::Shell(ShellOutputEvent::BinaryProgress { bytes_received }) => {
                print!("\r[received {} bytes]", bytes_received);
            }
        }
        let _ = stdout.flush();
    })
}
