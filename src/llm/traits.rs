//! Content generator trait for abstracting model backends
//!
//! The conversation engine only ever talks to a [`ContentGenerator`]; the
//! wire format behind it belongs to the implementation.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::core::{Content, FunctionCall, Part, Result, ToolDefinition};

/// Generation settings sent with every request
#[derive(Debug, Clone, Default)]
pub struct GenerateConfig {
    /// System instruction prepended by the backend
    pub system_instruction: Option<String>,
    /// Temperature for sampling (0.0 - 2.0)
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    /// Function declarations the model may call
    pub tools: Vec<ToolDefinition>,
}

/// A single request to the backend
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    /// Curated history followed by the new user turn
    pub contents: Vec<Content>,
    pub config: GenerateConfig,
}

/// Token usage information
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A full response, or one chunk of a streamed response
#[derive(Debug, Clone, Default)]
pub struct GenerateResponse {
    /// Candidate content; absent when the backend produced nothing
    pub content: Option<Content>,
    /// Trace of function calls the backend executed on its own
    pub automatic_function_calling_history: Option<Vec<Content>>,
    pub usage: Option<TokenUsage>,
    pub model_version: Option<String>,
}

impl GenerateResponse {
    /// Response wrapping a single model turn
    pub fn from_content(content: Content) -> Self {
        Self {
            content: Some(content),
            ..Default::default()
        }
    }

    /// Model text response
    pub fn text_response(text: impl Into<String>) -> Self {
        Self::from_content(Content::model(text))
    }

    /// Model response made of the given parts
    pub fn parts(parts: Vec<Part>) -> Self {
        Self::from_content(Content::new(crate::core::Role::Model, parts))
    }

    /// Concatenated non-thought text of the candidate
    pub fn text(&self) -> String {
        self.content.as_ref().map(Content::text).unwrap_or_default()
    }

    /// Function calls requested in the candidate
    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.content
            .as_ref()
            .map(Content::function_calls)
            .unwrap_or_default()
    }

    /// A chunk is valid when its candidate content is valid
    pub fn is_valid(&self) -> bool {
        self.content.as_ref().is_some_and(Content::is_valid)
    }
}

/// Type alias for a boxed stream of response chunks
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<GenerateResponse>> + Send>>;

/// Trait for model backends
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Generate a single response
    async fn generate_content(
        &self,
        request: GenerateRequest,
        prompt_id: &str,
    ) -> Result<GenerateResponse>;

    /// Open a streamed response
    async fn generate_content_stream(
        &self,
        request: GenerateRequest,
        prompt_id: &str,
    ) -> Result<ResponseStream>;

    /// Get the backend name
    fn name(&self) -> &str;
}
