//! Tools module - the tool contract and built-in tools
//!
//! A tool takes JSON arguments and a cancellation token and produces a
//! [`ToolResult`]. The registry turns model function calls into
//! function-response parts.

pub mod delegate;
pub mod registry;
pub mod shell;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::{Result, ToolDefinition, ToolResult};

pub use delegate::DelegateTool;
pub use registry::ToolRegistry;
pub use shell::ShellTool;

/// A callable the model can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name exposed to the model
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments
    fn parameters(&self) -> serde_json::Value;

    /// Whether a person must approve each call.
    ///
    /// Such tools are never handed to non-interactive sub-agents.
    fn requires_confirmation(&self) -> bool {
        false
    }

    /// Declaration sent to the model
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(self.name(), self.description(), self.parameters())
    }

    /// Run the tool
    async fn execute(
        &self,
        args: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult>;
}
