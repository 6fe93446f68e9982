//! Sub-agent runner tests
//!
//! Budgets and termination reasons, driven by the scripted generator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gantry::agent::{
    AgentContext, ContextState, ModelConfig, OutputConfig, PromptConfig, RunConfig, SessionConfig,
    SubAgentOptions, SubAgentScope, SubagentTerminateMode,
};
use gantry::core::{FunctionCall, Part};
use gantry::llm::{GenerateResponse, ScriptedGenerator};
use gantry::tools::ToolRegistry;
use tokio_util::sync::CancellationToken;

fn scope(generator: Arc<ScriptedGenerator>, max_turns: usize, outputs: &[&str]) -> SubAgentScope {
    scope_with(
        generator,
        RunConfig {
            max_time_minutes: 1.0,
            max_turns: Some(max_turns),
        },
        outputs,
    )
}

fn scope_with(generator: Arc<ScriptedGenerator>, run: RunConfig, outputs: &[&str]) -> SubAgentScope {
    let outputs: BTreeMap<String, String> = outputs
        .iter()
        .map(|name| (name.to_string(), format!("the {}", name)))
        .collect();

    SubAgentScope::create(
        "tester",
        AgentContext {
            generator,
            tools: ToolRegistry::new(),
            session: SessionConfig::default(),
            prompt_id: "parent".to_string(),
        },
        PromptConfig::system("Work on ${topic}."),
        ModelConfig::new("sub-model"),
        run,
        SubAgentOptions {
            tool_config: None,
            output_config: Some(OutputConfig { outputs }),
        },
    )
    .unwrap()
}

fn variables() -> ContextState {
    [("topic", "parsing")].into_iter().collect()
}

#[tokio::test]
async fn test_turn_budget_stops_tool_loop() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.push_response(GenerateResponse::parts(vec![Part::FunctionCall(
        FunctionCall::new("missing_tool", serde_json::json!({})),
    )]));

    let mut scope = scope(generator.clone(), 1, &[]);
    scope
        .run_non_interactive(&variables(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(scope.output.terminate_reason, SubagentTerminateMode::MaxTurns);
    assert_eq!(generator.requests().len(), 1);
    assert_eq!(generator.prompt_ids(), vec!["parent#0".to_string()]);
}

#[tokio::test]
async fn test_emitted_values_reach_goal() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator
        .push_response(GenerateResponse::parts(vec![Part::FunctionCall(
            FunctionCall::new(
                "self.emitvalue",
                serde_json::json!({"emit_variable_name": "summary", "emit_variable_value": "done"}),
            ),
        )]))
        .push_text("finished");

    let mut scope = scope(generator.clone(), 5, &["summary"]);
    scope
        .run_non_interactive(&variables(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(scope.output.terminate_reason, SubagentTerminateMode::Goal);
    assert_eq!(scope.output.emitted_vars.get("summary").map(String::as_str), Some("done"));

    let system = generator.requests()[0].config.system_instruction.clone().unwrap();
    assert!(system.contains("Work on parsing."));
}

#[tokio::test]
async fn test_generator_error_reports_error() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.push_error(gantry::GantryError::api(400, "bad request"));

    let mut scope = scope(generator, 5, &[]);
    let outcome = scope
        .run_non_interactive(&variables(), CancellationToken::new())
        .await;

    assert!(outcome.is_err());
    assert_eq!(scope.output.terminate_reason, SubagentTerminateMode::Error);
}

#[tokio::test(start_paused = true)]
async fn test_slow_turn_ends_in_timeout() {
    // each chunk takes longer than the whole budget
    let generator = Arc::new(ScriptedGenerator::new().with_latency(Duration::from_secs(1)));
    generator.push_response(GenerateResponse::parts(vec![Part::FunctionCall(
        FunctionCall::new("missing_tool", serde_json::json!({})),
    )]));

    let mut scope = scope_with(
        generator.clone(),
        RunConfig {
            max_time_minutes: 0.01,
            max_turns: Some(5),
        },
        &[],
    );
    scope
        .run_non_interactive(&variables(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(scope.output.terminate_reason, SubagentTerminateMode::Timeout);
    assert_eq!(generator.requests().len(), 1);
}
