//! Shell tool - runs commands through the process executor

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::core::{Result, ToolResult};
use crate::executor::{
    ignore_output, is_binary, ExecutionResult, OutputCallback, ShellExecutionService, SNIFF_LIMIT,
};
use crate::tools::Tool;

pub const SHELL_TOOL_NAME: &str = "run_shell_command";

/// Tool for executing shell commands inside a root directory
pub struct ShellTool {
    service: ShellExecutionService,
    root: PathBuf,
    use_pty: bool,
    require_confirmation: bool,
    on_output: OutputCallback,
}

#[derive(Debug, Deserialize)]
struct ShellInput {
    command: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    directory: Option<String>,
}

impl ShellTool {
    /// Create a shell tool rooted at `root`
    pub fn new(service: ShellExecutionService, root: impl Into<PathBuf>) -> Self {
        let use_pty = service.config().use_pty;
        Self {
            service,
            root: root.into(),
            use_pty,
            require_confirmation: false,
            on_output: ignore_output(),
        }
    }

    /// Forward live output events to `callback`
    pub fn with_output(mut self, callback: OutputCallback) -> Self {
        self.on_output = callback;
        self
    }

    pub fn with_pty(mut self, use_pty: bool) -> Self {
        self.use_pty = use_pty;
        self
    }

    pub fn with_confirmation(mut self, require_confirmation: bool) -> Self {
        self.require_confirmation = require_confirmation;
        self
    }

    /// Resolve a directory argument against the root.
    ///
    /// Absolute paths and paths that climb out of the root are rejected.
    fn resolve_directory(&self, directory: Option<&str>) -> std::result::Result<PathBuf, String> {
        let Some(directory) = directory.filter(|d| !d.trim().is_empty()) else {
            return Ok(self.root.clone());
        };

        let relative = Path::new(directory.trim());
        if relative.is_absolute() {
            return Err("Directory cannot be absolute. Please refer to workspace directories by their name.".into());
        }
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir))
        {
            return Err(format!("Directory '{}' is outside the workspace root.", directory));
        }
        Ok(self.root.join(relative))
    }

    /// Text reported back to the model
    fn llm_content(command: &str, directory: Option<&str>, result: &ExecutionResult) -> String {
        let output = if is_binary(&result.raw_output[..result.raw_output.len().min(SNIFF_LIMIT)]) {
            format!("[binary output, {} bytes]", result.raw_output.len())
        } else if result.output.trim().is_empty() {
            "(empty)".to_string()
        } else {
            result.output.trim_end().to_string()
        };

        let none = || "(none)".to_string();
        let mut lines = vec![
            format!("Command: {}", command),
            format!("Directory: {}", directory.unwrap_or("(root)")),
            format!("Output: {}", output),
            format!("Error: {}", result.error.clone().unwrap_or_else(none)),
            format!(
                "Exit Code: {}",
                result.exit_code.map(|c| c.to_string()).unwrap_or_else(none)
            ),
            format!("Signal: {}", result.signal.clone().unwrap_or_else(none)),
            format!(
                "Process Group PGID: {}",
                result.pid.map(|p| p.to_string()).unwrap_or_else(none)
            ),
        ];

        if result.aborted {
            lines.insert(0, "Command was cancelled before it could complete.".to_string());
        }

        lines.join("\n")
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        SHELL_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Executes a shell command with `bash -c <command>` in the workspace and returns \
         Command, Directory, Output, Error, Exit Code, Signal and Process Group PGID. \
         The command runs in its own process group; cancelling the call terminates the whole group."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Exact bash command to execute"
                },
                "description": {
                    "type": "string",
                    "description": "Brief description of the command for the user"
                },
                "directory": {
                    "type": "string",
                    "description": "Directory to run the command in, relative to the workspace root"
                }
            },
            "required": ["command"]
        })
    }

    fn requires_confirmation(&self) -> bool {
        self.require_confirmation
    }

    async fn execute(&self, args: serde_json::Value, cancel: CancellationToken) -> Result<ToolResult> {
        let input: ShellInput = match serde_json::from_value(args) {
            Ok(input) => input,
            Err(e) => return Ok(ToolResult::failure(SHELL_TOOL_NAME, format!("Invalid input: {}", e))),
        };

        let command = input.command.trim();
        if command.is_empty() {
            return Ok(ToolResult::failure(SHELL_TOOL_NAME, "Command cannot be empty."));
        }

        let cwd = match self.resolve_directory(input.directory.as_deref()) {
            Ok(cwd) => cwd,
            Err(message) => return Ok(ToolResult::failure(SHELL_TOOL_NAME, message)),
        };

        if let Some(ref description) = input.description {
            tracing::info!(command, description = %description, "running shell command");
        }

        let handle = self
            .service
            .execute(command, &cwd, self.on_output.clone(), cancel, self.use_pty);
        let result = handle.result().await;

        let llm_content = Self::llm_content(command, input.directory.as_deref(), &result);
        let display = if result.aborted {
            format!("Command cancelled.\n{}", result.output)
        } else if let Some(ref error) = result.error {
            format!("Command failed: {}", error)
        } else {
            result.output.clone()
        };

        let tool_result = ToolResult {
            tool_name: SHELL_TOOL_NAME.to_string(),
            success: result.is_clean_exit() && !result.aborted,
            llm_content,
            return_display: display,
            data: serde_json::to_value(&result).ok(),
        };
        Ok(tool_result)
    }
}
