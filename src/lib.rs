//! gantry - a local coding agent
//!
//! Conversation engine, shell executor and sub-agent runner for a coding
//! assistant that talks to a local Ollama server.
//!
//! # Architecture
//!
//! - **Core**: Shared types, configuration, logging and error handling
//! - **LLM**: Content generator seam with Ollama and scripted implementations
//! - **Executor**: Shell command execution over pipes or a pseudo-terminal
//! - **Tools**: Tool registry, shell tool and sub-agent delegation
//! - **Agent**: Conversation history, retry, sub-agents and the agent loop
//! - **CLI**: Command-line interface and REPL
//!
//! # Usage
//!
//! ```rust,no_run
//! use gantry::{Agent, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> gantry::Result<()> {
//!     let mut agent = Agent::new(Config::load())?;
//!     let answer = agent
//!         .process("List the Rust files in this directory", CancellationToken::new())
//!         .await?;
//!     println!("{}", answer);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod cli;
pub mod core;
pub mod executor;
pub mod llm;
pub mod tools;

// Re-export commonly used items
pub use agent::{Agent, Conversation, SubAgentScope};
pub use cli::Repl;
pub use core::{Config, GantryError, Result};
