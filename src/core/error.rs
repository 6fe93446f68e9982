//! Custom error types for gantry
//!
//! Provides a unified error handling system across all modules.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

/// Main error type for gantry operations
#[derive(Error, Debug)]
pub enum GantryError {
    /// Failure reported by the model backend
    #[error("{message}")]
    Api {
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    /// A stream drained without valid content
    #[error("Model stream was invalid: {0}")]
    InvalidStream(String),

    /// Malformed conversation history
    #[error("Invalid history: {0}")]
    InvalidHistory(String),

    /// Request rejected because of tool schemas the backend could not handle
    #[error("{message}\nThe following tools have cyclic schemas that may be causing this error: {}", tools.join(", "))]
    SchemaDepth { message: String, tools: Vec<String> },

    /// Sub-agent template expansion failed
    #[error("Template error: {0}")]
    Template(String),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Tool execution errors
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pseudo-terminal backend errors
    #[error("PTY error: {0}")]
    Pty(String),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic error for other cases
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type for gantry operations
pub type Result<T> = std::result::Result<T, GantryError>;

fn server_error_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| Regex::new(r"\b5\d{2}\b").expect("server error regex must compile"))
}

impl GantryError {
    /// Create a backend error with a known status code
    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::Api {
            status: Some(status),
            message: msg.into(),
            retry_after: None,
        }
    }

    /// Create a backend error whose status is only known from its message
    pub fn api_message(msg: impl Into<String>) -> Self {
        Self::Api {
            status: None,
            message: msg.into(),
            retry_after: None,
        }
    }

    /// Create a tool execution error
    pub fn tool(msg: impl Into<String>) -> Self {
        Self::ToolExecution(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap an error with additional context
    pub fn with_context<E>(context: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::WithContext {
            context: context.into(),
            source: Box::new(error),
        }
    }

    /// HTTP-like status of the failure.
    ///
    /// Falls back to scanning the message, since generators surface
    /// failures as plain text.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api {
                status: Some(status),
                ..
            } => Some(*status),
            Self::SchemaDepth { .. } => None,
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            other => {
                let message = other.to_string();
                if message.contains("429") {
                    Some(429)
                } else {
                    server_error_regex()
                        .find(&message)
                        .and_then(|m| m.as_str().parse().ok())
                }
            }
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self.status(), Some(500..=599))
    }

    /// Whether the request may succeed if sent again
    pub fn is_retryable(&self) -> bool {
        if self.is_schema_depth() {
            return false;
        }
        self.is_rate_limited() || self.is_server_error()
    }

    /// Whether the backend rejected the request's tool schemas
    pub fn is_schema_depth(&self) -> bool {
        match self {
            Self::SchemaDepth { .. } => true,
            other => {
                let message = other.to_string();
                message.contains("maximum schema depth exceeded")
                    || message.contains("Request contains an invalid argument")
            }
        }
    }

    /// Server-provided delay before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
