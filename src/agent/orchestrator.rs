//! Agent orchestrator
//!
//! Interactive driver that couples a [`Conversation`] with the tool
//! registry: send the prompt, run whatever tools the model asks for, feed
//! the function responses back, and repeat until the model answers in plain
//! text or the turn limit is reached.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::agent::conversation::{Conversation, SessionConfig};
use crate::agent::retry::AcceptFallback;
use crate::agent::sub_agent::{AgentContext, ModelConfig};
use crate::core::{Config, Content, FunctionCall, GantryError, Part, Result, Role};
use crate::executor::{OutputCallback, ShellExecutionService, ShellOutputEvent};
use crate::llm::{ContentGenerator, GenerateConfig, OllamaClient};
use crate::tools::{DelegateTool, ShellTool, ToolRegistry};

const DEFAULT_SYSTEM_PROMPT: &str = "You are gantry, a coding agent working in the user's workspace. \
Use the run_shell_command tool to inspect and change files and to run programs. \
Use delegate_task for self-contained subtasks that can be solved independently. \
When the task is complete, answer in plain text without calling tools.";

/// Progress reported while a prompt is processed
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Model text as it arrives
    Text(String),
    ToolCall(FunctionCall),
    ToolResult {
        name: String,
        success: bool,
        display: String,
    },
    /// Live output of a running shell command
    Shell(ShellOutputEvent),
}

/// Observer for agent progress
pub type EventCallback = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// Main agent that orchestrates the model and tools
pub struct Agent {
    /// Configuration
    config: Config,
    generator: Arc<dyn ContentGenerator>,
    /// Tool registry handed to the model
    tools: ToolRegistry,
    conversation: Conversation,
    events: Option<EventCallback>,
    workspace: PathBuf,
    session_id: String,
    prompt_count: usize,
}

impl Agent {
    /// Create an agent talking to the configured Ollama backend
    pub fn new(config: Config) -> Result<Self> {
        let generator = Arc::new(OllamaClient::from_config(&config)?);
        Ok(Self::with_generator(config, generator))
    }

    /// Create an agent over any content generator
    pub fn with_generator(config: Config, generator: Arc<dyn ContentGenerator>) -> Self {
        let workspace = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        let conversation = Conversation::new(
            generator.clone(),
            config.model.model.clone(),
            GenerateConfig {
                system_instruction: Some(
                    config
                        .agent
                        .system_prompt
                        .clone()
                        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
                ),
                temperature: config.model.temperature,
                top_p: config.model.top_p,
                tools: Vec::new(),
            },
            Vec::new(),
            SessionConfig::from(&config),
        )
        .with_fallback_handler(Arc::new(AcceptFallback));

        let mut agent = Self {
            config,
            generator,
            tools: ToolRegistry::new(),
            conversation,
            events: None,
            workspace,
            session_id: uuid::Uuid::new_v4().to_string(),
            prompt_count: 0,
        };
        agent.rebuild_tools();
        agent
    }

    /// Report progress to `callback`
    pub fn with_events(mut self, callback: EventCallback) -> Self {
        self.events = Some(callback);
        self.rebuild_tools();
        self
    }

    /// Run tools in `workspace` instead of the current directory
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self.rebuild_tools();
        self
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(ref events) = self.events {
            events(event);
        }
    }

    /// Build shell and delegation tools from the current settings
    fn rebuild_tools(&mut self) {
        let service = ShellExecutionService::new((&self.config.shell).into());
        let mut shell = ShellTool::new(service, self.workspace.clone())
            .with_pty(self.config.shell.use_pty)
            .with_confirmation(self.config.shell.require_confirmation);
        if let Some(events) = self.events.clone() {
            let forward: OutputCallback = Arc::new(move |event| events(AgentEvent::Shell(event)));
            shell = shell.with_output(forward);
        }

        let mut base = ToolRegistry::new();
        base.register(Arc::new(shell));

        let delegate = DelegateTool::new(
            AgentContext {
                generator: self.generator.clone(),
                tools: base.clone(),
                session: SessionConfig::from(&self.config),
                prompt_id: self.session_id.clone(),
            },
            ModelConfig {
                model: self.config.model.model.clone(),
                temperature: self.config.model.temperature,
                top_p: self.config.model.top_p,
            },
            self.config.subagent.clone(),
        );

        let mut tools = base;
        tools.register(Arc::new(delegate));
        self.conversation.set_tools(tools.definitions());
        self.tools = tools;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn model(&self) -> String {
        self.conversation.model()
    }

    /// Switch the conversation model; delegated sub-agents follow
    pub fn set_model(&mut self, model: impl Into<String>) {
        let model = model.into();
        self.conversation.set_model(model.clone());
        self.config.model.model = model;
        self.rebuild_tools();
    }

    pub fn use_pty(&self) -> bool {
        self.config.shell.use_pty
    }

    pub fn set_pty(&mut self, use_pty: bool) {
        self.config.shell.use_pty = use_pty;
        self.rebuild_tools();
    }

    pub fn history(&self) -> Vec<Content> {
        self.conversation.get_history(false)
    }

    pub fn clear(&mut self) {
        self.conversation.clear_history();
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Send one model turn and collect its text and function calls
    async fn turn(
        &self,
        message: Vec<Part>,
        prompt_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<FunctionCall>)> {
        if !self.config.agent.streaming {
            let response = self.conversation.send_message(message, prompt_id).await?;
            let text = response.text();
            if !text.is_empty() {
                self.emit(AgentEvent::Text(text.clone()));
            }
            return Ok((text, response.function_calls()));
        }

        let mut stream = self
            .conversation
            .send_message_stream(message, prompt_id, cancel.clone())
            .await?;

        while let Some(chunk) = stream.next().await {
            let piece = chunk?.text();
            if !piece.is_empty() {
                self.emit(AgentEvent::Text(piece));
            }
        }

        // chunks of re-attempted streams were forwarded too; the recorded turn is authoritative
        Ok(match self.conversation.get_history(false).last() {
            Some(turn) if turn.role == Role::Model => (turn.text(), turn.function_calls()),
            _ => (String::new(), Vec::new()),
        })
    }

    /// Process a user message until the model gives a final answer
    pub async fn process(&mut self, user_input: &str, cancel: CancellationToken) -> Result<String> {
        self.prompt_count += 1;
        let prompt_id = format!("{}########{}", self.session_id, self.prompt_count);
        let max_turns = self.config.agent.max_turns;

        let mut message = vec![Part::text(user_input)];
        let mut last_text = String::new();

        for turn in 1..=max_turns {
            if cancel.is_cancelled() {
                return Err(GantryError::Cancelled);
            }
            tracing::debug!(turn, max_turns, prompt_id = %prompt_id, "agent turn");

            let (text, calls) = self.turn(message, &prompt_id, &cancel).await?;
            if calls.is_empty() {
                return Ok(text);
            }
            last_text = text;

            let mut responses = Vec::with_capacity(calls.len());
            for call in calls {
                self.emit(AgentEvent::ToolCall(call.clone()));
                let outcome = self.tools.execute(&call, cancel.clone()).await;
                let (success, display) = match outcome {
                    Ok(ref result) => (result.success, result.return_display.clone()),
                    Err(ref e) => (false, e.to_string()),
                };
                self.emit(AgentEvent::ToolResult {
                    name: call.name.clone(),
                    success,
                    display,
                });
                responses.push(Part::FunctionResponse(ToolRegistry::response_for(&call, &outcome)));
            }

            if cancel.is_cancelled() {
                // keep the calls answered so the history stays resendable
                self.conversation.add_history(Content::new(Role::User, responses));
                return Err(GantryError::Cancelled);
            }
            message = responses;
        }

        tracing::warn!(max_turns, "turn limit reached without a final answer");
        Ok(if last_text.is_empty() {
            format!("Stopped after {} turns without a final answer.", max_turns)
        } else {
            last_text
        })
    }
}
