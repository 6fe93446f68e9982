//! Delegation tool - hands a task to a bounded sub-agent

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::agent::sub_agent::{
    AgentContext, ContextState, ModelConfig, OutputConfig, PromptConfig, RunConfig,
    SubAgentOptions, SubAgentScope, SubagentTerminateMode, ToolConfig,
};
use crate::core::config::SubAgentDefaults;
use crate::core::{Result, ToolResult};
use crate::tools::Tool;

pub const DELEGATE_TOOL_NAME: &str = "delegate_task";

const DELEGATE_PROMPT: &str = "You are a focused sub-agent working on one delegated task.\n\nTask:\n${task}";

/// Tool that runs a sub-agent with a slice of the host's tools
pub struct DelegateTool {
    context: AgentContext,
    model: ModelConfig,
    defaults: SubAgentDefaults,
}

#[derive(Debug, Deserialize)]
struct DelegateInput {
    task: String,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    outputs: BTreeMap<String, String>,
    #[serde(default)]
    max_turns: Option<usize>,
    #[serde(default)]
    max_time_minutes: Option<f64>,
}

impl DelegateTool {
    /// `context.tools` is the set sub-agents may be granted
    pub fn new(context: AgentContext, model: ModelConfig, defaults: SubAgentDefaults) -> Self {
        Self {
            context,
            model,
            defaults,
        }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        DELEGATE_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Delegates a self-contained task to a non-interactive sub-agent with its own \
         turn and time budget. Returns the termination reason and any output variables it emitted."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Complete description of the task"
                },
                "tools": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Names of tools the sub-agent may use"
                },
                "outputs": {
                    "type": "object",
                    "additionalProperties": {"type": "string"},
                    "description": "Output variables to produce, name to description"
                },
                "max_turns": {
                    "type": "integer",
                    "description": "Turn budget"
                },
                "max_time_minutes": {
                    "type": "number",
                    "description": "Wall-clock budget in minutes"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: serde_json::Value, cancel: CancellationToken) -> Result<ToolResult> {
        let input: DelegateInput = match serde_json::from_value(args) {
            Ok(input) => input,
            Err(e) => return Ok(ToolResult::failure(DELEGATE_TOOL_NAME, format!("Invalid input: {}", e))),
        };

        let mut context = self.context.clone();
        context.prompt_id = format!("{}-{}", DELEGATE_TOOL_NAME, uuid::Uuid::new_v4());

        let scope = SubAgentScope::create(
            DELEGATE_TOOL_NAME,
            context,
            PromptConfig::system(DELEGATE_PROMPT),
            self.model.clone(),
            RunConfig {
                max_time_minutes: input.max_time_minutes.unwrap_or(self.defaults.max_time_minutes),
                max_turns: Some(input.max_turns.unwrap_or(self.defaults.max_turns)),
            },
            SubAgentOptions {
                tool_config: Some(ToolConfig { tools: input.tools }),
                output_config: Some(OutputConfig {
                    outputs: input.outputs,
                }),
            },
        );
        let mut scope = match scope {
            Ok(scope) => scope,
            Err(e) => return Ok(ToolResult::failure(DELEGATE_TOOL_NAME, e.to_string())),
        };

        let variables: ContextState = [("task", input.task)].into_iter().collect();
        if let Err(e) = scope.run_non_interactive(&variables, cancel).await {
            return Ok(ToolResult::failure(
                DELEGATE_TOOL_NAME,
                format!("Sub-agent failed: {}", e),
            ));
        }

        let summary = serde_json::to_value(&scope.output)?;
        let text = serde_json::to_string_pretty(&summary)?;
        let reason = scope.output.terminate_reason;

        Ok(if reason == SubagentTerminateMode::Goal {
            ToolResult::success_with_data(DELEGATE_TOOL_NAME, text, summary)
        } else {
            ToolResult {
                data: Some(summary),
                ..ToolResult::failure(DELEGATE_TOOL_NAME, text)
            }
            .with_display(format!("Sub-agent stopped: {}", reason))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::conversation::SessionConfig;
    use crate::core::{FunctionCall, Part};
    use crate::llm::{GenerateResponse, ScriptedGenerator};
    use crate::tools::ToolRegistry;
    use std::sync::Arc;

    fn tool(generator: Arc<ScriptedGenerator>) -> DelegateTool {
        DelegateTool::new(
            AgentContext {
                generator,
                tools: ToolRegistry::new(),
                session: SessionConfig::default(),
                prompt_id: String::new(),
            },
            ModelConfig::new("m"),
            SubAgentDefaults::default(),
        )
    }

    #[tokio::test]
    async fn test_delegation_returns_emitted_vars() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_text(r#"{"answer": "4"}"#);

        let result = tool(generator.clone())
            .execute(
                serde_json::json!({"task": "add 2 and 2", "outputs": {"answer": "the sum"}}),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["terminate_reason"], "GOAL");
        assert_eq!(data["emitted_vars"]["answer"], "4");
        let system = generator.requests()[0].config.system_instruction.clone().unwrap();
        assert!(system.contains("add 2 and 2"));
    }

    #[tokio::test]
    async fn test_turn_budget_reported_as_failure() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_response(GenerateResponse::parts(vec![Part::FunctionCall(
            FunctionCall::new("run_shell_command", serde_json::json!({"command": "ls"})),
        )]));

        let result = tool(generator)
            .execute(
                serde_json::json!({"task": "list files", "max_turns": 1}),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.data.unwrap()["terminate_reason"], "MAX_TURNS");
    }

    #[tokio::test]
    async fn test_unknown_tool_in_allowlist() {
        let result = tool(Arc::new(ScriptedGenerator::new()))
            .execute(
                serde_json::json!({"task": "x", "tools": ["does_not_exist"]}),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.llm_content.contains("does_not_exist"));
    }
}
