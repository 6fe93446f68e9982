//! Sub-agent support
//!
//! A sub-agent is a bounded, non-interactive conversation run for one
//! delegated task. It owns a private [`Conversation`], an allowlisted slice
//! of the host's tools and a budget of turns and wall-clock time. The run
//! ends with a [`SubagentTerminateMode`] and whatever output variables the
//! model emitted.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::conversation::{Conversation, SessionConfig};
use crate::agent::loop_state::LoopState;
use crate::core::{
    Content, FunctionCall, FunctionResponse, GantryError, Part, Result, Role, ToolDefinition,
};
use crate::llm::{ContentGenerator, GenerateConfig};
use crate::tools::ToolRegistry;

/// Built-in function used to report output variables
pub const EMIT_VALUE_TOOL: &str = "self.emitvalue";

const START_MESSAGE: &str = "Get Started!";
const ALL_CALLS_FAILED: &str =
    "All tool calls failed. Please analyze the errors and try an alternative approach.";

/// Why a sub-agent run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubagentTerminateMode {
    /// Finished with every declared output emitted
    Goal,
    MaxTurns,
    Timeout,
    /// The conversation failed
    Error,
    /// The caller cancelled the run
    Aborted,
}

impl fmt::Display for SubagentTerminateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Goal => "GOAL",
            Self::MaxTurns => "MAX_TURNS",
            Self::Timeout => "TIMEOUT",
            Self::Error => "ERROR",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Result of a sub-agent run.
///
/// Only `Goal` guarantees every declared output is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputObject {
    pub terminate_reason: SubagentTerminateMode,
    pub emitted_vars: HashMap<String, String>,
}

impl Default for OutputObject {
    fn default() -> Self {
        Self {
            terminate_reason: SubagentTerminateMode::Error,
            emitted_vars: HashMap::new(),
        }
    }
}

/// Variables available to prompt templates
#[derive(Debug, Clone, Default)]
pub struct ContextState {
    values: HashMap<String, serde_json::Value>,
}

impl ContextState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    /// Replace every `${name}` in `template`.
    ///
    /// All missing names are reported in one error.
    pub fn render(&self, template: &str) -> Result<String> {
        static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
        let placeholder = PLACEHOLDER
            .get_or_init(|| Regex::new(r"\$\{(\w+)\}").expect("placeholder regex must compile"));

        let mut missing: Vec<&str> = placeholder
            .captures_iter(template)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|key| !self.values.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            missing.dedup();
            return Err(GantryError::Template(format!(
                "Missing context values for the following keys: {}",
                missing.join(", ")
            )));
        }

        let rendered = placeholder.replace_all(template, |caps: &regex::Captures<'_>| {
            match self.values.get(&caps[1]) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            }
        });
        Ok(rendered.into_owned())
    }
}

impl<K: Into<String>, V: Into<serde_json::Value>> FromIterator<(K, V)> for ContextState {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut state = Self::new();
        for (key, value) in iter {
            state.set(key, value);
        }
        state
    }
}

/// How the sub-agent's conversation is seeded; exactly one must be set
#[derive(Debug, Clone, Default)]
pub struct PromptConfig {
    /// Templated system prompt
    pub system_prompt: Option<String>,
    /// Pre-built history used instead of a system prompt
    pub initial_messages: Option<Vec<Content>>,
}

impl PromptConfig {
    pub fn system(prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: Some(prompt.into()),
            initial_messages: None,
        }
    }
}

/// Model parameters for the private conversation
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

impl ModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            top_p: None,
        }
    }
}

/// Resource budget
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_time_minutes: f64,
    /// `None` leaves only the clock as a bound
    pub max_turns: Option<usize>,
}

/// Tools the sub-agent may call, by name
#[derive(Debug, Clone, Default)]
pub struct ToolConfig {
    pub tools: Vec<String>,
}

/// Declared outputs, name to description
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    pub outputs: BTreeMap<String, String>,
}

/// Optional parts of a sub-agent definition
#[derive(Debug, Clone, Default)]
pub struct SubAgentOptions {
    pub tool_config: Option<ToolConfig>,
    pub output_config: Option<OutputConfig>,
}

/// What a sub-agent borrows from its host
#[derive(Clone)]
pub struct AgentContext {
    pub generator: Arc<dyn ContentGenerator>,
    /// Tools the allowlist is resolved against
    pub tools: ToolRegistry,
    pub session: SessionConfig,
    /// Prompt id of the host turn; sub-agent turns are `<prompt_id>#<turn>`
    pub prompt_id: String,
}

/// One non-interactive sub-agent run
pub struct SubAgentScope {
    name: String,
    context: AgentContext,
    prompt_config: PromptConfig,
    model_config: ModelConfig,
    run_config: RunConfig,
    tools: ToolRegistry,
    outputs: BTreeMap<String, String>,
    /// Filled in by [`SubAgentScope::run_non_interactive`]
    pub output: OutputObject,
}

impl SubAgentScope {
    /// Validate the definition and resolve the tool allowlist
    pub fn create(
        name: impl Into<String>,
        context: AgentContext,
        prompt_config: PromptConfig,
        model_config: ModelConfig,
        run_config: RunConfig,
        options: SubAgentOptions,
    ) -> Result<Self> {
        let name = name.into();

        if prompt_config.system_prompt.is_some() == prompt_config.initial_messages.is_some() {
            return Err(GantryError::config(
                "PromptConfig must have exactly one of system_prompt or initial_messages",
            ));
        }

        let allowlist = options.tool_config.map(|c| c.tools).unwrap_or_default();
        let tools = context.tools.subset(&allowlist)?;
        for tool_name in tools.names() {
            if tools.get(&tool_name).is_some_and(|t| t.requires_confirmation()) {
                return Err(GantryError::config(format!(
                    "Tool \"{}\" requires user confirmation and cannot be used by a non-interactive subagent.",
                    tool_name
                )));
            }
        }

        Ok(Self {
            name,
            context,
            prompt_config,
            model_config,
            run_config,
            tools,
            outputs: options.output_config.map(|c| c.outputs).unwrap_or_default(),
            output: OutputObject::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn emit_value_definition() -> ToolDefinition {
        ToolDefinition::function(
            EMIT_VALUE_TOOL,
            "Emit one output variable of this task. Call once per required output.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "emit_variable_name": {
                        "type": "string",
                        "description": "Name of the output variable"
                    },
                    "emit_variable_value": {
                        "type": "string",
                        "description": "Value of the output variable"
                    }
                },
                "required": ["emit_variable_name", "emit_variable_value"]
            }),
        )
    }

    fn build_system_prompt(&self, context: &ContextState) -> Result<Option<String>> {
        let Some(ref template) = self.prompt_config.system_prompt else {
            return Ok(None);
        };

        let mut prompt = context.render(template)?;
        prompt.push_str(
            "\n\nImportant rules:\n\
             * You are running non-interactively. You cannot ask the user for input or \
             clarification; proceed with the information you have.\n\
             * When every goal is met and every required output is emitted, stop calling tools.",
        );

        if !self.outputs.is_empty() {
            prompt.push_str(&format!(
                "\n\nYou must report these outputs with the '{}' tool, one call per output, \
                 or finish with a JSON object containing them:",
                EMIT_VALUE_TOOL
            ));
            for (name, description) in &self.outputs {
                prompt.push_str(&format!("\n* {}: {}", name, description));
            }
        }

        Ok(Some(prompt))
    }

    fn missing_outputs(&self) -> Vec<String> {
        self.outputs
            .keys()
            .filter(|name| !self.output.emitted_vars.contains_key(*name))
            .cloned()
            .collect()
    }

    /// Pick declared outputs out of a final JSON answer
    fn absorb_final_text(&mut self, text: &str) {
        if self.outputs.is_empty() {
            return;
        }
        let Some(object) = parse_json_object(text) else {
            return;
        };
        for name in self.outputs.keys() {
            if let Some(value) = object.get(name) {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                self.output.emitted_vars.insert(name.clone(), value);
            }
        }
    }

    /// Execute one turn's calls and build the parts sent back
    async fn process_function_calls(
        &mut self,
        calls: Vec<FunctionCall>,
        cancel: &CancellationToken,
    ) -> Vec<Part> {
        let mut parts = Vec::new();

        for call in calls {
            if call.name.is_empty() {
                tracing::warn!(subagent = %self.name, "skipping function call without a name");
                continue;
            }

            if call.name == EMIT_VALUE_TOOL {
                let response = match (
                    call.get_string("emit_variable_name"),
                    call.get_string("emit_variable_value"),
                ) {
                    (Some(name), Some(value)) => {
                        tracing::debug!(subagent = %self.name, variable = %name, "emitted variable");
                        self.output.emitted_vars.insert(name.clone(), value);
                        FunctionResponse::output(&call, format!("Emitted variable {} successfully", name))
                    }
                    _ => FunctionResponse::error(
                        &call,
                        "emit_variable_name and emit_variable_value are both required",
                    ),
                };
                parts.push(Part::FunctionResponse(response));
                continue;
            }

            let response = self.tools.dispatch(&call, cancel.clone()).await;
            parts.push(Part::FunctionResponse(response));
        }

        if parts.is_empty() {
            parts.push(Part::text(ALL_CALLS_FAILED));
        }
        parts
    }

    fn fail(&mut self, error: GantryError) -> Result<()> {
        tracing::warn!(subagent = %self.name, error = %error, "subagent run failed");
        self.output.terminate_reason = SubagentTerminateMode::Error;
        Err(error)
    }

    /// Run to completion.
    ///
    /// The outcome is left in [`SubAgentScope::output`]. Budget exhaustion
    /// and cancellation are outcomes, not errors; a failure of the
    /// conversation itself sets `Error` and is also returned.
    pub async fn run_non_interactive(
        &mut self,
        context: &ContextState,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.output = OutputObject::default();

        let system_instruction = match self.build_system_prompt(context) {
            Ok(prompt) => prompt,
            Err(e) => return self.fail(e),
        };

        let mut declarations = self.tools.definitions();
        if !self.outputs.is_empty() {
            declarations.push(Self::emit_value_definition());
        }

        let chat = Conversation::new(
            self.context.generator.clone(),
            self.model_config.model.clone(),
            GenerateConfig {
                system_instruction,
                temperature: self.model_config.temperature,
                top_p: self.model_config.top_p,
                tools: declarations,
            },
            self.prompt_config.initial_messages.clone().unwrap_or_default(),
            self.context.session.clone(),
        );

        let mut state = LoopState::new(self.run_config.max_turns, self.run_config.max_time_minutes);
        let mut message = vec![Part::text(START_MESSAGE)];

        let reason = loop {
            if cancel.is_cancelled() {
                break SubagentTerminateMode::Aborted;
            }
            if let Some(reason) = state.check_budget() {
                break reason;
            }

            let prompt_id = format!("{}#{}", self.context.prompt_id, state.turn);
            state.next_turn();
            tracing::debug!(subagent = %self.name, turn = state.turn, prompt_id = %prompt_id, "subagent turn");

            let mut stream = match chat.send_message_stream(message, &prompt_id, cancel.clone()).await {
                Ok(stream) => stream,
                Err(e) => return self.fail(e),
            };

            let mut aborted = false;
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(_) => {}
                    Err(GantryError::Cancelled) => {
                        aborted = true;
                        break;
                    }
                    Err(e) => return self.fail(e),
                }
            }
            drop(stream);

            if aborted {
                break SubagentTerminateMode::Aborted;
            }
            if state.is_timed_out() {
                break SubagentTerminateMode::Timeout;
            }

            // re-attempted streams forward discarded chunks too; act on the committed turn only
            let (calls, text) = match chat.get_history(false).last() {
                Some(turn) if turn.role == Role::Model => (turn.function_calls(), turn.text()),
                _ => (Vec::new(), String::new()),
            };

            if !calls.is_empty() {
                message = self.process_function_calls(calls, &cancel).await;
                continue;
            }

            self.absorb_final_text(&text);
            let missing = self.missing_outputs();
            if missing.is_empty() {
                break SubagentTerminateMode::Goal;
            }

            tracing::debug!(subagent = %self.name, missing = ?missing, "nudging for missing outputs");
            message = vec![Part::text(format!(
                "You have stopped calling tools but have not emitted the following required variables: {}. \
                 Please use the '{}' tool to emit them now, or continue working if necessary.",
                missing.join(", "),
                EMIT_VALUE_TOOL
            ))];
        };

        tracing::info!(subagent = %self.name, reason = %reason, turns = state.turn, "subagent finished");
        self.output.terminate_reason = reason;
        Ok(())
    }
}

/// Parse a JSON object from model text, tolerating code fences and prose
fn parse_json_object(text: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let candidate = match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => &unfenced[start..=end],
        _ => return None,
    };

    match serde_json::from_str::<serde_json::Value>(candidate) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerateResponse, ScriptedGenerator};

    fn context(generator: Arc<ScriptedGenerator>) -> AgentContext {
        AgentContext {
            generator,
            tools: ToolRegistry::new(),
            session: SessionConfig::default(),
            prompt_id: "parent".into(),
        }
    }

    fn run_config(max_turns: Option<usize>) -> RunConfig {
        RunConfig {
            max_time_minutes: 1.0,
            max_turns,
        }
    }

    fn outputs(names: &[&str]) -> SubAgentOptions {
        SubAgentOptions {
            tool_config: None,
            output_config: Some(OutputConfig {
                outputs: names.iter().map(|n| (n.to_string(), format!("the {}", n))).collect(),
            }),
        }
    }

    #[test]
    fn test_template_rendering() {
        let state: ContextState = [("name", "world"), ("n", "3")].into_iter().collect();
        assert_eq!(state.render("hello ${name} x${n}").unwrap(), "hello world x3");

        let err = state.render("${a} ${b} ${name} ${a}").unwrap_err();
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn test_prompt_config_must_have_exactly_one_source() {
        let generator = Arc::new(ScriptedGenerator::new());
        let both = PromptConfig {
            system_prompt: Some("x".into()),
            initial_messages: Some(vec![]),
        };
        assert!(SubAgentScope::create(
            "a",
            context(generator.clone()),
            both,
            ModelConfig::new("m"),
            run_config(None),
            SubAgentOptions::default()
        )
        .is_err());
        assert!(SubAgentScope::create(
            "a",
            context(generator),
            PromptConfig::default(),
            ModelConfig::new("m"),
            run_config(None),
            SubAgentOptions::default()
        )
        .is_err());
    }

    #[test]
    fn test_parse_json_object() {
        let map = parse_json_object("```json\n{\"answer\": 42}\n```").unwrap();
        assert_eq!(map["answer"], 42);
        assert!(parse_json_object("Result: {\"a\": \"b\"} done").is_some());
        assert!(parse_json_object("no json here").is_none());
    }

    #[tokio::test]
    async fn test_goal_via_emit_value() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator
            .push_response(GenerateResponse::parts(vec![Part::FunctionCall(FunctionCall::new(
                EMIT_VALUE_TOOL,
                serde_json::json!({"emit_variable_name": "answer", "emit_variable_value": "42"}),
            ))]))
            .push_text("done");

        let mut scope = SubAgentScope::create(
            "calc",
            context(generator.clone()),
            PromptConfig::system("Compute ${what}."),
            ModelConfig::new("m"),
            run_config(Some(5)),
            outputs(&["answer"]),
        )
        .unwrap();

        let vars: ContextState = [("what", "the answer")].into_iter().collect();
        scope.run_non_interactive(&vars, CancellationToken::new()).await.unwrap();

        assert_eq!(scope.output.terminate_reason, SubagentTerminateMode::Goal);
        assert_eq!(scope.output.emitted_vars["answer"], "42");

        let requests = generator.requests();
        let system = requests[0].config.system_instruction.clone().unwrap();
        assert!(system.starts_with("Compute the answer."));
        assert!(requests[0].config.tools.iter().any(|t| t.name() == EMIT_VALUE_TOOL));
        assert_eq!(requests[0].contents[0].text(), START_MESSAGE);
        assert_eq!(generator.prompt_ids(), vec!["parent#0", "parent#1"]);
    }

    #[tokio::test]
    async fn test_goal_via_final_json() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_text("```json\n{\"summary\": \"all good\"}\n```");

        let mut scope = SubAgentScope::create(
            "summarize",
            context(generator),
            PromptConfig::system("Summarize."),
            ModelConfig::new("m"),
            run_config(Some(3)),
            outputs(&["summary"]),
        )
        .unwrap();
        scope
            .run_non_interactive(&ContextState::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(scope.output.terminate_reason, SubagentTerminateMode::Goal);
        assert_eq!(scope.output.emitted_vars["summary"], "all good");
    }

    struct Counter(Arc<std::sync::atomic::AtomicUsize>);

    #[async_trait::async_trait]
    impl crate::tools::Tool for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn description(&self) -> &str {
            "counts invocations"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _cancel: CancellationToken,
        ) -> Result<crate::core::ToolResult> {
            let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            Ok(crate::core::ToolResult::success("counter", n.to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_from_discarded_stream_run_once() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let generator = Arc::new(ScriptedGenerator::new());
        let call = || {
            Ok(GenerateResponse::parts(vec![Part::FunctionCall(FunctionCall::new(
                "counter",
                serde_json::json!({}),
            ))]))
        };
        generator
            .push_stream(vec![call(), Ok(GenerateResponse::default())])
            .push_stream(vec![call()])
            .push_text("done");

        let mut ctx = context(generator.clone());
        ctx.tools.register(Arc::new(Counter(count.clone())));
        let mut scope = SubAgentScope::create(
            "count",
            ctx,
            PromptConfig::system("Count."),
            ModelConfig::new("m"),
            run_config(Some(5)),
            SubAgentOptions {
                tool_config: Some(ToolConfig {
                    tools: vec!["counter".to_string()],
                }),
                output_config: None,
            },
        )
        .unwrap();
        scope
            .run_non_interactive(&ContextState::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(scope.output.terminate_reason, SubagentTerminateMode::Goal);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);

        let requests = generator.requests();
        let responses = requests.last().unwrap().contents.last().unwrap();
        assert!(responses.is_function_response());
        assert_eq!(responses.parts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_json_read_from_committed_turn() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator
            .push_stream(vec![
                Ok(GenerateResponse::text_response(r#"{"answer": "42"}"#)),
                Ok(GenerateResponse::default()),
            ])
            .push_stream(vec![Ok(GenerateResponse::text_response(r#"{"answer": "42"}"#))]);

        let mut scope = SubAgentScope::create(
            "answer",
            context(generator),
            PromptConfig::system("Answer."),
            ModelConfig::new("m"),
            run_config(Some(2)),
            outputs(&["answer"]),
        )
        .unwrap();
        scope
            .run_non_interactive(&ContextState::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(scope.output.terminate_reason, SubagentTerminateMode::Goal);
        assert_eq!(scope.output.emitted_vars["answer"], "42");
    }

    #[tokio::test]
    async fn test_missing_template_value_is_error() {
        let generator = Arc::new(ScriptedGenerator::new());
        let mut scope = SubAgentScope::create(
            "t",
            context(generator),
            PromptConfig::system("Use ${missing}"),
            ModelConfig::new("m"),
            run_config(None),
            SubAgentOptions::default(),
        )
        .unwrap();

        let result = scope.run_non_interactive(&ContextState::new(), CancellationToken::new()).await;
        assert!(matches!(result, Err(GantryError::Template(_))));
        assert_eq!(scope.output.terminate_reason, SubagentTerminateMode::Error);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_aborted() {
        let generator = Arc::new(ScriptedGenerator::new());
        let mut scope = SubAgentScope::create(
            "c",
            context(generator.clone()),
            PromptConfig::system("x"),
            ModelConfig::new("m"),
            run_config(None),
            SubAgentOptions::default(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        scope.run_non_interactive(&ContextState::new(), cancel).await.unwrap();
        assert_eq!(scope.output.terminate_reason, SubagentTerminateMode::Aborted);
        assert!(generator.requests().is_empty());
    }

    #[test]
    fn test_terminate_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&SubagentTerminateMode::MaxTurns).unwrap(),
            "\"MAX_TURNS\""
        );
        assert_eq!(SubagentTerminateMode::Goal.to_string(), "GOAL");
    }
}
