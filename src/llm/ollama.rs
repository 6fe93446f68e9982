//! Ollama client implementation
//!
//! Async HTTP client for the Ollama chat API implementing [`ContentGenerator`],
//! with tool calling and NDJSON streaming.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::{
    Config, Content, FunctionCall, GantryError, Part, Result, Role, ToolDefinition,
};
use crate::llm::traits::{
    ContentGenerator, GenerateRequest, GenerateResponse, ResponseStream, TokenUsage,
};

/// Ollama API client
#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

/// Ollama chat request
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
    stream: bool,
}

/// Ollama message format
#[derive(Debug, Default, Serialize, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

/// Ollama tool call format
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

/// Ollama function in tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaFunction {
    name: String,
    arguments: serde_json::Value,
}

/// Ollama generation options
#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

/// Ollama chat response, streamed or not
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

impl OllamaClient {
    /// Create a new Ollama client from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.backend.timeout_secs))
            .build()?;

        let base_url = config.backend_url()?.as_str().trim_end_matches('/').to_string();

        Ok(Self { client, base_url })
    }

    /// Create a client with custom base URL
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(120)).build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Convert the request's turns to Ollama messages.
    ///
    /// Function responses travel as separate `tool` messages.
    fn to_ollama_messages(request: &GenerateRequest) -> Vec<OllamaMessage> {
        let mut messages = Vec::new();

        if let Some(ref system) = request.config.system_instruction {
            messages.push(OllamaMessage {
                role: "system".to_string(),
                content: system.clone(),
                ..Default::default()
            });
        }

        for content in &request.contents {
            let mut text = String::new();
            let mut thinking = String::new();
            let mut tool_calls = Vec::new();

            for part in &content.parts {
                match part {
                    Part::Text(t) => text.push_str(t),
                    Part::Thought(t) => thinking.push_str(t),
                    Part::FunctionCall(call) => tool_calls.push(OllamaToolCall {
                        function: OllamaFunction {
                            name: call.name.clone(),
                            arguments: call.args.clone(),
                        },
                    }),
                    Part::FunctionResponse(response) => messages.push(OllamaMessage {
                        role: "tool".to_string(),
                        content: response.response.to_string(),
                        tool_name: Some(response.name.clone()),
                        ..Default::default()
                    }),
                }
            }

            if text.is_empty() && tool_calls.is_empty() && content.role == Role::User {
                continue;
            }

            messages.push(OllamaMessage {
                role: match content.role {
                    Role::User => "user".to_string(),
                    Role::Model => "assistant".to_string(),
                },
                content: text,
                thinking: (!thinking.is_empty()).then_some(thinking),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_name: None,
            });
        }

        messages
    }

    /// Convert an Ollama message to model parts
    fn to_parts(message: OllamaMessage) -> Vec<Part> {
        let mut parts = Vec::new();

        if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
            parts.push(Part::Thought(thinking));
        }
        if !message.content.is_empty() {
            parts.push(Part::Text(message.content));
        }
        for tc in message.tool_calls.unwrap_or_default() {
            parts.push(Part::FunctionCall(FunctionCall::new(
                tc.function.name,
                tc.function.arguments,
            )));
        }

        parts
    }

    fn usage(response: &ChatResponse) -> Option<TokenUsage> {
        match (response.prompt_eval_count, response.eval_count) {
            (Some(prompt), Some(completion)) => Some(TokenUsage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            }),
            _ => None,
        }
    }

    /// Convert Ollama response to GenerateResponse
    fn to_generate_response(response: ChatResponse) -> GenerateResponse {
        let usage = Self::usage(&response);
        let content = response
            .message
            .map(|message| Content::new(Role::Model, Self::to_parts(message)));

        GenerateResponse {
            content,
            automatic_function_calling_history: None,
            usage,
            model_version: response.model,
        }
    }

    /// POST a chat request and map transport failures to API errors
    async fn post_chat(&self, request: &GenerateRequest, stream: bool) -> Result<Response> {
        let options = OllamaOptions {
            temperature: request.config.temperature,
            top_p: request.config.top_p,
        };

        let body = ChatRequest {
            model: &request.model,
            messages: Self::to_ollama_messages(request),
            tools: (!request.config.tools.is_empty()).then_some(request.config.tools.as_slice()),
            options: (options.temperature.is_some() || options.top_p.is_some()).then_some(options),
            stream,
        };

        tracing::trace!(request = %serde_json::to_string(&body)?, "ollama request");

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    GantryError::api_message(format!(
                        "Cannot connect to Ollama at {}. Is it running?",
                        self.base_url
                    ))
                } else {
                    GantryError::from(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let error_text = response.text().await.unwrap_or_default();

            return Err(GantryError::Api {
                status: Some(status.as_u16()),
                message: format!("Ollama API error ({}): {}", status, error_text),
                retry_after,
            });
        }

        Ok(response)
    }
}

/// Folds metadata-only chunks (the final `done` line) into the previous chunk
/// so that every yielded chunk carries content.
#[derive(Default)]
struct ChunkAssembler {
    pending: Option<GenerateResponse>,
}

impl ChunkAssembler {
    fn push(&mut self, response: ChatResponse) -> Result<Option<GenerateResponse>> {
        if let Some(error) = response.error {
            return Err(GantryError::api_message(error));
        }

        let done = response.done;
        let usage = OllamaClient::usage(&response);
        let model = response.model.clone();
        let parts = response
            .message
            .map(OllamaClient::to_parts)
            .unwrap_or_default();

        if parts.is_empty() {
            if done {
                if let Some(pending) = self.pending.as_mut() {
                    pending.usage = usage;
                    pending.model_version = model;
                }
            }
            return Ok(None);
        }

        let next = GenerateResponse {
            content: Some(Content::new(Role::Model, parts)),
            automatic_function_calling_history: None,
            usage,
            model_version: model,
        };
        Ok(self.pending.replace(next))
    }

    fn finish(&mut self) -> Option<GenerateResponse> {
        self.pending.take()
    }
}

#[async_trait]
impl ContentGenerator for OllamaClient {
    async fn generate_content(
        &self,
        request: GenerateRequest,
        prompt_id: &str,
    ) -> Result<GenerateResponse> {
        tracing::debug!(prompt_id, model = %request.model, "generate_content");

        let response = self.post_chat(&request, false).await?;
        let response_text = response.text().await?;

        let chat_response: ChatResponse = serde_json::from_str(&response_text)
            .map_err(|e| GantryError::api_message(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = chat_response.error {
            return Err(GantryError::api_message(error));
        }

        Ok(Self::to_generate_response(chat_response))
    }

    async fn generate_content_stream(
        &self,
        request: GenerateRequest,
        prompt_id: &str,
    ) -> Result<ResponseStream> {
        tracing::debug!(prompt_id, model = %request.model, "generate_content_stream");

        let response = self.post_chat(&request, true).await?;
        let mut bytes = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut assembler = ChunkAssembler::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(GantryError::api_message(format!("Stream error: {}", e)));
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                // Process complete JSON lines from buffer
                while let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    match serde_json::from_str::<ChatResponse>(line) {
                        Ok(parsed) => match assembler.push(parsed) {
                            Ok(Some(ready)) => yield Ok(ready),
                            Ok(None) => {}
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        },
                        Err(e) => tracing::debug!(error = %e, line, "skipping unparseable stream line"),
                    }
                }
            }

            // Process any remaining buffer content
            let rest = String::from_utf8_lossy(&buffer).trim().to_string();
            if !rest.is_empty() {
                if let Ok(parsed) = serde_json::from_str::<ChatResponse>(&rest) {
                    match assembler.push(parsed) {
                        Ok(Some(ready)) => yield Ok(ready),
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }

            if let Some(last) = assembler.finish() {
                yield Ok(last);
            }
        };

        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
