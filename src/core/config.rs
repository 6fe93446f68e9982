//! Configuration management for gantry
//!
//! Defaults are pure; the outside world (`.env`, config file, environment
//! variables) is consulted only by [`Config::load`]. Runtime components take
//! the resolved sections, never the process environment.
//!
//! Config file location: ~/.config/gantry/config.toml

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::core::error::{GantryError, Result};

/// Main configuration for gantry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// How the session authenticated
    #[serde(default)]
    pub auth: AuthType,
    /// Model backend connection
    #[serde(default)]
    pub backend: BackendConfig,
    /// Model selection and sampling
    #[serde(default)]
    pub model: ModelSettings,
    /// Retry policy for unary and stream-opening requests
    #[serde(default)]
    pub retry: RetrySettings,
    /// Extra attempts for invalid or interrupted streams
    #[serde(default)]
    pub stream_retry: StreamRetrySettings,
    /// Shell execution
    #[serde(default)]
    pub shell: ShellConfig,
    /// Agent behavior
    #[serde(default)]
    pub agent: AgentConfig,
    /// Sub-agent budgets
    #[serde(default)]
    pub subagent: SubAgentDefaults,
}

/// Model backend server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Host address (default: localhost)
    pub host: String,
    /// Port number (default: 11434)
    pub port: u16,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 11434,
            timeout_secs: 120,
        }
    }
}

/// Model selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Model used for the main conversation
    pub model: String,
    /// Cheaper model offered after persistent rate limiting
    pub fallback_model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model: "qwen3:8b".to_string(),
            fallback_model: "qwen3:4b".to_string(),
            temperature: None,
            top_p: None,
        }
    }
}

/// How the current session authenticated with the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// Interactive login flow; the only mode eligible for model fallback
    InteractiveLogin,
    ApiKey,
    #[default]
    Local,
}

/// Exponential backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 5000,
            max_delay_ms: 30000,
        }
    }
}

/// Linear backoff settings for stream re-attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRetrySettings {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
}

impl Default for StreamRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
        }
    }
}

/// Shell execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Run commands in a pseudo-terminal
    pub use_pty: bool,
    /// Time between SIGTERM and SIGKILL on cancellation
    pub kill_grace_period_ms: u64,
    pub pty_rows: u16,
    pub pty_cols: u16,
    /// Require user confirmation before running commands
    pub require_confirmation: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            use_pty: false,
            kill_grace_period_ms: 200,
            pty_rows: 30,
            pty_cols: 80,
            require_confirmation: false,
        }
    }
}

/// Agent behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum tool round-trips per prompt
    /// Default: 25
    pub max_turns: usize,
    /// Whether to show debug output
    pub debug: bool,
    /// Stream model output as it arrives
    pub streaming: bool,
    /// System prompt override
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 25,
            debug: false,
            streaming: true,
            system_prompt: None,
        }
    }
}

/// Default budgets for delegated sub-agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentDefaults {
    pub max_turns: usize,
    pub max_time_minutes: f64,
}

impl Default for SubAgentDefaults {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_time_minutes: 5.0,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name).ok().map(|v| v == "true" || v == "1")
}

impl RetrySettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gantry")
    }

    /// Get the config file path
    pub fn config_file() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from file, environment, and defaults
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load() -> Self {
        // Try to load .env file if it exists
        let _ = dotenvy::dotenv();

        let mut config = match Self::load_from_file() {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(error = %e, "using default configuration");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config
    }

    /// Load configuration from file only
    pub fn load_from_file() -> Result<Self> {
        let config_path = Self::config_file();

        if !config_path.exists() {
            return Err(GantryError::config("Config file not found"));
        }

        Self::load_from_path(&config_path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            GantryError::with_context(format!("Failed to read {}", path.display()), e)
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| GantryError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply `GANTRY_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("GANTRY_BACKEND_HOST") {
            self.backend.host = host;
        }
        if let Some(port) = env::var("GANTRY_BACKEND_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.backend.port = port;
        }
        if let Ok(model) = env::var("GANTRY_MODEL") {
            self.model.model = model;
        }
        if let Ok(model) = env::var("GANTRY_FALLBACK_MODEL") {
            self.model.fallback_model = model;
        }
        if let Some(debug) = env_flag("GANTRY_DEBUG") {
            self.agent.debug = debug;
        }
        if let Some(streaming) = env_flag("GANTRY_STREAMING") {
            self.agent.streaming = streaming;
        }
        if let Some(use_pty) = env_flag("GANTRY_USE_PTY") {
            self.shell.use_pty = use_pty;
        }
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<PathBuf> {
        let config_path = Self::config_file();
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    /// Write configuration as TOML, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                GantryError::with_context(format!("Failed to create {}", dir.display()), e)
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| GantryError::config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, content).map_err(|e| {
            GantryError::with_context(format!("Failed to write {}", path.display()), e)
        })
    }

    /// Get the backend base URL
    pub fn backend_url(&self) -> Result<Url> {
        Url::parse(&format!("http://{}:{}", self.backend.host, self.backend.port))
            .map_err(|e| GantryError::config(format!("Invalid backend address: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend.port, 11434);
        assert_eq!(config.auth, AuthType::Local);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.stream_retry.max_attempts, 3);
        assert!(!config.shell.use_pty);
        assert!(config.agent.streaming);
    }

    #[test]
    fn test_backend_url() {
        let config = Config::default();
        assert_eq!(
            config.backend_url().unwrap().as_str(),
            "http://localhost:11434/"
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            auth = "interactive_login"

            [shell]
            use_pty = true
            kill_grace_period_ms = 50
            pty_rows = 24
            pty_cols = 120
            require_confirmation = false
            "#,
        )
        .unwrap();
        assert_eq!(config.auth, AuthType::InteractiveLogin);
        assert!(config.shell.use_pty);
        assert_eq!(config.model.model, "qwen3:8b");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("fallback_model"));
        assert!(toml_str.contains("kill_grace_period_ms"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.model.model = "llama3.2".to_string();
        config.subagent.max_turns = 4;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.model.model, "llama3.2");
        assert_eq!(loaded.subagent.max_turns, 4);
    }

    #[test]
    fn test_unreadable_file_carries_context() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from_path(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, GantryError::WithContext { .. }));
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn test_config_dir() {
        let dir = Config::config_dir();
        assert!(dir.to_string_lossy().contains("gantry"));
    }
}
