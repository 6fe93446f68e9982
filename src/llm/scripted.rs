//! Deterministic content generator
//!
//! Replays queued replies in order and records every request it receives.
//! Used by the test suites; it never touches the network.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{GantryError, Result};
use crate::llm::traits::{ContentGenerator, GenerateRequest, GenerateResponse, ResponseStream};

/// One queued reply
pub enum ScriptedReply {
    /// A complete response; streamed calls receive it as a single chunk
    Response(GenerateResponse),
    /// The call fails before any chunk is produced
    Error(GantryError),
    /// A stream of chunks, each of which may fail
    Stream(Vec<Result<GenerateResponse>>),
}

/// Content generator that replays a script
#[derive(Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<(String, GenerateRequest)>>,
    latency: Option<Duration>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before every reply and between stream chunks
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn push(&self, reply: ScriptedReply) -> &Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
        self
    }

    pub fn push_response(&self, response: GenerateResponse) -> &Self {
        self.push(ScriptedReply::Response(response))
    }

    pub fn push_text(&self, text: &str) -> &Self {
        self.push_response(GenerateResponse::text_response(text))
    }

    pub fn push_error(&self, error: GantryError) -> &Self {
        self.push(ScriptedReply::Error(error))
    }

    pub fn push_stream(&self, chunks: Vec<Result<GenerateResponse>>) -> &Self {
        self.push(ScriptedReply::Stream(chunks))
    }

    /// Requests received so far, in order
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .map(|requests| requests.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    /// Prompt ids received so far, in order
    pub fn prompt_ids(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|requests| requests.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Replies not yet consumed
    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn next(&self, request: GenerateRequest, prompt_id: &str) -> Result<ScriptedReply> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((prompt_id.to_string(), request));
        }
        self.replies
            .lock()
            .map_err(|_| GantryError::Other("scripted generator poisoned".into()))?
            .pop_front()
            .ok_or_else(|| GantryError::Other("scripted generator has no replies left".into()))
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate_content(
        &self,
        request: GenerateRequest,
        prompt_id: &str,
    ) -> Result<GenerateResponse> {
        let reply = self.next(request, prompt_id)?;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match reply {
            ScriptedReply::Response(response) => Ok(response),
            ScriptedReply::Error(error) => Err(error),
            ScriptedReply::Stream(_) => Err(GantryError::Other(
                "scripted stream queued for a unary call".into(),
            )),
        }
    }

    async fn generate_content_stream(
        &self,
        request: GenerateRequest,
        prompt_id: &str,
    ) -> Result<ResponseStream> {
        let reply = self.next(request, prompt_id)?;
        let latency = self.latency;

        let chunks = match reply {
            ScriptedReply::Response(response) => vec![Ok(response)],
            ScriptedReply::Error(error) => return Err(error),
            ScriptedReply::Stream(chunks) => chunks,
        };

        let stream = async_stream::stream! {
            for chunk in chunks {
                if let Some(latency) = latency {
                    tokio::time::sleep(latency).await;
                }
                yield chunk;
            }
        };

        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
