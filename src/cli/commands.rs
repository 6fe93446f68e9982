//! CLI commands
//!
//! Special commands that can be executed in the REPL.

use crate::agent::Agent;
use crate::core::{Content, Part, Role};

/// Result of parsing a command
#[derive(Debug, PartialEq)]
pub enum CommandResult {
    /// Continue processing as normal input
    Continue(String),
    /// Command was handled, show output
    Handled(String),
    /// Exit the REPL
    Exit,
    /// Clear history
    Clear,
}

/// Parse and handle special commands
pub fn handle_command(input: &str, agent: &mut Agent) -> CommandResult {
    let input = input.trim();
    let mut parts = input.splitn(2, ' ');
    let cmd = parts.next().unwrap_or("").to_lowercase();
    let args = parts.next().map(str::trim).unwrap_or("");

    match cmd.as_str() {
        "exit" | "quit" | "q" => CommandResult::Exit,

        "clear" | "reset" => {
            agent.clear();
            CommandResult::Clear
        }

        "help" | "?" => CommandResult::Handled(help_text()),

        "history" => CommandResult::Handled(render_history(&agent.history())),

        "status" => {
            let config = agent.config();
            let backend = config
                .backend_url()
                .map(|url| url.to_string())
                .unwrap_or_else(|e| format!("invalid ({})", e));
            CommandResult::Handled(format!(
                "Gantry Status:\n\
                 ─────────────────────────────\n\
                 Backend:  {}\n\
                 Model:    {}\n\
                 Fallback: {}\n\
                 PTY:      {}\n\
                 Tools:    {}\n\
                 History:  {} entries",
                backend,
                agent.model(),
                config.model.fallback_model,
                if agent.use_pty() { "on" } else { "off" },
                agent.tools().names().join(", "),
                agent.history().len(),
            ))
        }

        "model" => {
            if args.is_empty() {
                return CommandResult::Handled(format!("Current model: {}", agent.model()));
            }
            agent.set_model(args);
            CommandResult::Handled(format!("Model set to: {}", args))
        }

        "pty" => match args.to_lowercase().as_str() {
            "" => CommandResult::Handled(format!(
                "PTY execution: {}",
                if agent.use_pty() { "on" } else { "off" }
            )),
            "on" | "true" | "1" | "yes" => {
                agent.set_pty(true);
                CommandResult::Handled("PTY execution: on".to_string())
            }
            "off" | "false" | "0" | "no" => {
                agent.set_pty(false);
                CommandResult::Handled("PTY execution: off".to_string())
            }
            other => CommandResult::Handled(format!("Usage: pty <on|off> (got '{}')", other)),
        },

        _ => {
            if input.starts_with('/') {
                CommandResult::Handled(format!(
                    "Unknown command: {}. Type 'help' for available commands.",
                    cmd
                ))
            } else {
                CommandResult::Continue(input.to_string())
            }
        }
    }
}

/// One line per history entry, long text truncated
fn render_history(history: &[Content]) -> String {
    if history.is_empty() {
        return "History is empty.".to_string();
    }

    history
        .iter()
        .enumerate()
        .map(|(i, content)| {
            let role = match content.role {
                Role::User => "user",
                Role::Model => "model",
            };
            let summary = content
                .parts
                .iter()
                .map(summarize_part)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" | ");
            format!("{:>3}. {:<5} {}", i + 1, role, summary)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn summarize_part(part: &Part) -> String {
    match part {
        Part::FunctionCall(call) => format!("[call {}]", call.name),
        Part::FunctionResponse(response) => format!("[result {}]", response.name),
        Part::Thought(_) => "[thought]".to_string(),
        Part::Text(text) => {
            let text = text.replace('\n', " ");
            if text.chars().count() > 80 {
                format!("{}...", text.chars().take(80).collect::<String>())
            } else {
                text
            }
        }
    }
}

/// Generate help text
fn help_text() -> String {
    r#"Gantry Commands:
─────────────────────────────────────────────
  help, ?          Show this help message
  exit, quit, q    Exit gantry
  clear, reset     Clear conversation history
  history          Show the conversation history
  status           Show current configuration

  model <id>       Switch the model
  pty <on|off>     Run shell commands in a pseudo-terminal

Keyboard Shortcuts:
  Ctrl+C           Cancel the running prompt
  Ctrl+D           Exit gantry
─────────────────────────────────────────────"#
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use crate::llm::ScriptedGenerator;
    use std::sync::Arc;

    fn agent() -> Agent {
        Agent::with_generator(Config::default(), Arc::new(ScriptedGenerator::new()))
    }

    #[test]
    fn test_plain_input_passes_through() {
        let mut agent = agent();
        assert_eq!(
            handle_command("list the files", &mut agent),
            CommandResult::Continue("list the files".to_string())
        );
    }

    #[test]
    fn test_model_and_pty_commands() {
        let mut agent = agent();
        handle_command("model qwen3:8b", &mut agent);
        assert_eq!(agent.model(), "qwen3:8b");

        handle_command("pty on", &mut agent);
        assert!(agent.use_pty());
        handle_command("pty off", &mut agent);
        assert!(!agent.use_pty());
    }

    #[test]
    fn test_history_rendering() {
        let mut agent = agent();
        assert_eq!(
            handle_command("history", &mut agent),
            CommandResult::Handled("History is empty.".to_string())
        );

        agent.conversation().add_history(Content::user("hello"));
        agent.conversation().add_history(Content::model("hi"));
        match handle_command("history", &mut agent) {
            CommandResult::Handled(text) => {
                assert!(text.contains("user  hello"));
                assert!(text.contains("model hi"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_slash_command() {
        let mut agent = agent();
        assert!(matches!(
            handle_command("/bogus", &mut agent),
            CommandResult::Handled(_)
        ));
        assert_eq!(handle_command("exit", &mut agent), CommandResult::Exit);
    }
}
