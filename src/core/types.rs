//! Shared types used across gantry modules
//!
//! Contains the turn/part data model, tool definitions, and tool results.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::GantryError;

/// Role of a turn in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Model => write!(f, "model"),
        }
    }
}

impl FromStr for Role {
    type Err = GantryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "model" => Ok(Role::Model),
            other => Err(GantryError::InvalidHistory(format!(
                "Role must be user or model, but got {}",
                other
            ))),
        }
    }
}

/// A function call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Backend-assigned call id, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Name of the function to invoke
    pub name: String,
    /// JSON arguments
    #[serde(default)]
    pub args: serde_json::Value,
}

impl FunctionCall {
    /// Create a new function call
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            args,
        }
    }

    /// Get a string argument by key
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.args
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// The result of a function call, fed back to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: serde_json::Value,
}

impl FunctionResponse {
    /// Build a response carrying `{"output": ...}`
    pub fn output(call: &FunctionCall, output: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            response: serde_json::json!({ "output": output.into() }),
        }
    }

    /// Build a response carrying `{"error": ...}`
    pub fn error(call: &FunctionCall, error: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            response: serde_json::json!({ "error": error.into() }),
        }
    }
}

/// One content fragment within a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    Text(String),
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
    /// Model reasoning; never resent and never recorded in history
    Thought(String),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    /// Whether the part carries nothing usable.
    ///
    /// Thought parts are never empty: the marker itself is the content.
    pub fn is_empty(&self) -> bool {
        match self {
            Part::Text(text) => text.is_empty(),
            Part::FunctionCall(call) => call.name.is_empty(),
            Part::FunctionResponse(response) => response.name.is_empty(),
            Part::Thought(_) => false,
        }
    }

    pub fn is_thought(&self) -> bool {
        matches!(self, Part::Thought(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// A role-tagged message unit in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    /// Create a user turn with a single text part
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    /// Create a model turn with a single text part
    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, vec![Part::text(text)])
    }

    /// Create a user turn carrying function responses
    pub fn function_responses(responses: Vec<FunctionResponse>) -> Self {
        Self::new(
            Role::User,
            responses.into_iter().map(Part::FunctionResponse).collect(),
        )
    }

    /// A turn is valid when it has parts and none of them is empty
    pub fn is_valid(&self) -> bool {
        !self.parts.is_empty() && !self.parts.iter().any(Part::is_empty)
    }

    /// Model turn whose first part is non-empty text
    pub fn is_text(&self) -> bool {
        self.role == Role::Model
            && matches!(self.parts.first(), Some(Part::Text(text)) if !text.is_empty())
    }

    /// Model turn that leads with a thought
    pub fn is_thought(&self) -> bool {
        self.role == Role::Model && matches!(self.parts.first(), Some(Part::Thought(_)))
    }

    /// User turn made entirely of function responses
    pub fn is_function_response(&self) -> bool {
        self.role == Role::User
            && !self.parts.is_empty()
            && self
                .parts
                .iter()
                .all(|part| matches!(part, Part::FunctionResponse(_)))
    }

    /// Concatenated non-thought text
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::FunctionCall(call) => Some(call.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Definition of a tool that can be called by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Type of tool (always "function" for now)
    #[serde(rename = "type")]
    pub tool_type: String,
    /// Function details
    pub function: FunctionDefinition,
}

/// Function definition within a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the parameters
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a new function tool definition
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// Result of executing a tool
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Name of the tool that was executed
    pub tool_name: String,
    /// Whether the execution was successful
    pub success: bool,
    /// Content sent back to the model
    pub llm_content: String,
    /// Content shown to the user
    pub return_display: String,
    /// Optional structured data
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    /// Create a successful result
    pub fn success(tool_name: impl Into<String>, output: impl Into<String>) -> Self {
        let output = output.into();
        Self {
            tool_name: tool_name.into(),
            success: true,
            return_display: output.clone(),
            llm_content: output,
            data: None,
        }
    }

    /// Create a successful result with structured data
    pub fn success_with_data(
        tool_name: impl Into<String>,
        output: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            data: Some(data),
            ..Self::success(tool_name, output)
        }
    }

    /// Create a failed result
    pub fn failure(tool_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::success(tool_name, error)
        }
    }

    /// Override what the user sees
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.return_display = display.into();
        self
    }

    /// Interpret tool output that is expected to be JSON.
    ///
    /// Plain text is not an error: it is kept verbatim with `success = false`.
    pub fn from_json_output(tool_name: impl Into<String>, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        match serde_json::from_str::<serde_json::Value>(raw.trim()) {
            Ok(value) => Self::success_with_data(tool_name, raw, value),
            Err(_) => Self::failure(tool_name, raw),
        }
    }

}
