//! gantry - local coding agent
//!
//! Main entry point for the CLI application.

use clap::Parser;
use gantry::core::logging::init_logging;
use gantry::{Agent, Config, Repl};
use tokio_util::sync::CancellationToken;

/// gantry - local coding agent backed by Ollama
#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model to converse with
    #[arg(long, short = 'm')]
    model: Option<String>,

    /// Enable debug logging
    #[arg(long, short = 'd')]
    debug: bool,

    /// Run shell commands in a pseudo-terminal
    #[arg(long)]
    pty: bool,

    /// Single prompt mode (non-interactive)
    #[arg(long, short = 'p')]
    prompt: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load();

    // CLI overrides
    if let Some(model) = args.model {
        config.model.model = model;
    }
    if args.debug {
        config.agent.debug = true;
    }
    if args.pty {
        config.shell.use_pty = true;
    }

    init_logging(config.agent.debug);
    tracing::debug!(model = %config.model.model, "starting gantry");

    if let Some(prompt) = args.prompt {
        let mut agent = Agent::new(config)?;
        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };

        let response = agent.process(&prompt, cancel).await;
        watcher.abort();
        println!("{}", response?);
        return Ok(());
    }

    let mut repl = Repl::with_config(config)?;
    repl.run().await?;

    Ok(())
}
