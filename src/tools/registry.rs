//! Tool registry - manages and dispatches tool calls
//!
//! Central hub for registering tools and routing function calls to them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::{FunctionCall, FunctionResponse, GantryError, Result, ToolDefinition, ToolResult};
use crate::tools::Tool;

/// Registry of available tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    /// Tools indexed by name
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Registration order, so declarations are stable
    order: Vec<String>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names in registration order
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Declarations of every registered tool
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition())
            .collect()
    }

    /// Registry restricted to an allowlist
    pub fn subset(&self, names: &[String]) -> Result<ToolRegistry> {
        let mut subset = ToolRegistry::new();
        for name in names {
            let tool = self
                .get(name)
                .ok_or_else(|| GantryError::tool(format!("Unknown tool: {}", name)))?;
            subset.register(tool);
        }
        Ok(subset)
    }

    /// Run the tool named by a function call
    pub async fn execute(&self, call: &FunctionCall, cancel: CancellationToken) -> Result<ToolResult> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| GantryError::tool(format!("Tool \"{}\" not found in registry.", call.name)))?;

        tracing::debug!(tool = %call.name, args = %call.args, "executing tool");
        tool.execute(call.args.clone(), cancel).await
    }

    /// Function-response payload for a finished call
    pub fn response_for(call: &FunctionCall, outcome: &Result<ToolResult>) -> FunctionResponse {
        match outcome {
            Ok(result) if result.success => FunctionResponse::output(call, &result.llm_content),
            Ok(result) => FunctionResponse::error(call, &result.llm_content),
            Err(e) => FunctionResponse::error(call, e.to_string()),
        }
    }

    /// Run a call and package the outcome for the model.
    ///
    /// Unknown tools and tool failures become error payloads.
    pub async fn dispatch(&self, call: &FunctionCall, cancel: CancellationToken) -> FunctionResponse {
        let outcome = self.execute(call, cancel).await;
        if let Err(ref e) = outcome {
            tracing::warn!(tool = %call.name, error = %e, "tool call failed");
        }
        Self::response_for(call, &outcome)
    }
}
