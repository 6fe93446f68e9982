//! Conversation engine
//!
//! Owns one session's comprehensive history and serializes every send
//! against it. A send takes the session's send lock, builds a request from
//! the curated history plus the new user turn, runs it through the retry
//! policy, and records the consolidated model output on success.
//!
//! Streaming sends append the user turn before the network call, forward
//! chunks as they arrive, and judge the stream only after it has drained.
//! An invalid stream is re-attempted; when attempts run out (or the caller
//! cancels) the optimistic user turn is rolled back.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::history::{cyclic_schema_tools, extract_curated_history, record_history};
use crate::agent::retry::{
    retry_with_backoff, FallbackHandler, RateLimitFallback, RetryPolicy, StreamRetryPolicy,
};
use crate::core::config::AuthType;
use crate::core::{Config, Content, GantryError, Part, Result, Role, ToolDefinition};
use crate::llm::{ContentGenerator, GenerateConfig, GenerateRequest, GenerateResponse, ResponseStream};

/// Session-level settings resolved from configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How the session authenticated; only interactive logins may fall back
    pub auth_type: AuthType,
    /// Model offered after persistent rate limiting
    pub fallback_model: String,
    pub retry: RetryPolicy,
    pub stream_retry: StreamRetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            auth_type: config.auth,
            fallback_model: config.model.fallback_model.clone(),
            retry: RetryPolicy::from(&config.retry),
            stream_retry: StreamRetryPolicy::from(&config.stream_retry),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared state behind a [`Conversation`]
struct SessionState {
    generator: Arc<dyn ContentGenerator>,
    config: SessionConfig,
    fallback_handler: RwLock<Option<Arc<dyn FallbackHandler>>>,
    model: RwLock<String>,
    generate_config: RwLock<GenerateConfig>,
    history: RwLock<Vec<Content>>,
    /// Held for the whole of a send, including a stream's drain
    send_lock: Arc<Mutex<()>>,
}

impl SessionState {
    fn model(&self) -> String {
        read(&self.model).clone()
    }

    fn history(&self) -> Vec<Content> {
        read(&self.history).clone()
    }

    fn build_request(&self, curated: &[Content], user_content: &Content) -> GenerateRequest {
        let mut contents = curated.to_vec();
        contents.push(user_content.clone());
        GenerateRequest {
            model: self.model(),
            contents,
            config: read(&self.generate_config).clone(),
        }
    }

    /// Name the tools with cyclic schemas when the backend rejected them
    fn annotate(&self, error: GantryError) -> GantryError {
        if matches!(error, GantryError::SchemaDepth { .. }) || !error.is_schema_depth() {
            return error;
        }
        let tools = cyclic_schema_tools(&read(&self.generate_config).tools);
        if tools.is_empty() {
            return error;
        }
        GantryError::SchemaDepth {
            message: error.to_string(),
            tools,
        }
    }

    /// Push the optimistic user turn and return its index
    fn push_optimistic(&self, user_content: &Content) -> usize {
        let mut history = write(&self.history);
        history.push(user_content.clone());
        history.len() - 1
    }

    fn remove_optimistic(history: &mut Vec<Content>, index: usize, user_content: &Content) {
        if history.get(index) == Some(user_content) {
            history.remove(index);
        }
    }

    fn rollback(&self, index: usize, user_content: &Content) {
        Self::remove_optimistic(&mut write(&self.history), index, user_content);
        tracing::debug!(index, "rolled back optimistic user turn");
    }

    fn commit(
        &self,
        index: usize,
        user_content: Content,
        outputs: Vec<Content>,
        afc_history: Option<Vec<Content>>,
        curated_len: usize,
    ) {
        let mut history = write(&self.history);
        Self::remove_optimistic(&mut history, index, &user_content);
        record_history(&mut history, user_content, outputs, afc_history, curated_len);
    }
}

#[async_trait]
impl RateLimitFallback for SessionState {
    async fn on_persistent_rate_limit(&self, error: &GantryError) -> bool {
        if self.config.auth_type != AuthType::InteractiveLogin {
            return false;
        }
        let Some(handler) = read(&self.fallback_handler).clone() else {
            return false;
        };

        let current = self.model();
        let fallback = self.config.fallback_model.as_str();
        if current == fallback {
            return false;
        }

        match handler.handle(&current, fallback, error).await {
            Some(accepted) => {
                tracing::warn!(from = %current, to = %accepted, "switching model after persistent rate limiting");
                *write(&self.model) = accepted;
                true
            }
            None => {
                tracing::info!(model = %current, "model fallback declined");
                false
            }
        }
    }
}

/// A multi-turn conversation with a content generator
pub struct Conversation {
    state: Arc<SessionState>,
}

impl Conversation {
    /// Create a conversation over an initial history
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        model: impl Into<String>,
        generate_config: GenerateConfig,
        history: Vec<Content>,
        config: SessionConfig,
    ) -> Self {
        Self {
            state: Arc::new(SessionState {
                generator,
                config,
                fallback_handler: RwLock::new(None),
                model: RwLock::new(model.into()),
                generate_config: RwLock::new(generate_config),
                history: RwLock::new(history),
                send_lock: Arc::new(Mutex::new(())),
            }),
        }
    }

    /// Install the handler consulted on persistent rate limiting
    pub fn with_fallback_handler(self, handler: Arc<dyn FallbackHandler>) -> Self {
        self.set_fallback_handler(Some(handler));
        self
    }

    pub fn set_fallback_handler(&self, handler: Option<Arc<dyn FallbackHandler>>) {
        *write(&self.state.fallback_handler) = handler;
    }

    /// Model used for the next request
    pub fn model(&self) -> String {
        self.state.model()
    }

    pub fn set_model(&self, model: impl Into<String>) {
        *write(&self.state.model) = model.into();
    }

    /// Replace the tool declarations sent with each request
    pub fn set_tools(&self, tools: Vec<ToolDefinition>) {
        write(&self.state.generate_config).tools = tools;
    }

    pub fn set_system_instruction(&self, instruction: Option<String>) {
        write(&self.state.generate_config).system_instruction = instruction;
    }

    /// Send one message and wait for the complete response.
    ///
    /// History is left untouched when the request fails.
    pub async fn send_message(&self, message: Vec<Part>, prompt_id: &str) -> Result<GenerateResponse> {
        let _guard = self.state.send_lock.lock().await;
        let state = &self.state;

        let user_content = Content::new(Role::User, message);
        let curated = extract_curated_history(&state.history());
        let curated_len = curated.len();

        tracing::debug!(prompt_id, curated_len, "sending message");

        let result = retry_with_backoff(
            &state.config.retry,
            Some(state.as_ref() as &dyn RateLimitFallback),
            || {
                let request = state.build_request(&curated, &user_content);
                let generator = state.generator.clone();
                async move { generator.generate_content(request, prompt_id).await }
            },
        )
        .await;

        let response = result.map_err(|e| state.annotate(e))?;

        let outputs = response.content.clone().into_iter().collect();
        let afc_history = response.automatic_function_calling_history.clone();
        record_history(
            &mut write(&state.history),
            user_content,
            outputs,
            afc_history,
            curated_len,
        );

        Ok(response)
    }

    /// Send one message and stream the response.
    ///
    /// The send lock is taken before this returns and released when the
    /// stream finishes or is dropped. Chunks are forwarded as they arrive,
    /// including chunks of an attempt that is later judged invalid.
    pub async fn send_message_stream(
        &self,
        message: Vec<Part>,
        prompt_id: &str,
        cancel: CancellationToken,
    ) -> Result<ResponseStream> {
        let guard = self.state.send_lock.clone().lock_owned().await;
        let state = self.state.clone();
        let prompt_id = prompt_id.to_string();
        let user_content = Content::new(Role::User, message);

        let stream = async_stream::stream! {
            let _guard = guard;

            let curated = extract_curated_history(&state.history());
            let curated_len = curated.len();
            let index = state.push_optimistic(&user_content);
            let policy = state.config.stream_retry.clone();
            let mut attempt = 0;

            loop {
                attempt += 1;
                if attempt > 1 {
                    tokio::time::sleep(policy.delay_for(attempt - 1)).await;
                }
                if cancel.is_cancelled() {
                    state.rollback(index, &user_content);
                    yield Err(GantryError::Cancelled);
                    return;
                }

                let opened = retry_with_backoff(
                    &state.config.retry,
                    Some(state.as_ref() as &dyn RateLimitFallback),
                    || {
                        let request = state.build_request(&curated, &user_content);
                        let generator = state.generator.clone();
                        let prompt_id = prompt_id.clone();
                        async move { generator.generate_content_stream(request, &prompt_id).await }
                    },
                )
                .await;

                let mut chunks = match opened {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        state.rollback(index, &user_content);
                        yield Err(state.annotate(e));
                        return;
                    }
                };

                let mut outputs: Vec<Content> = Vec::new();
                let mut afc_history = None;
                let mut received_any = false;
                let mut stream_valid = true;
                let mut drain_error = None;

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        next = chunks.next() => Some(next),
                    };

                    let chunk = match next {
                        None => {
                            state.rollback(index, &user_content);
                            yield Err(GantryError::Cancelled);
                            return;
                        }
                        Some(None) => break,
                        Some(Some(Err(e))) => {
                            drain_error = Some(e);
                            break;
                        }
                        Some(Some(Ok(chunk))) => chunk,
                    };

                    received_any = true;
                    if chunk.is_valid() {
                        if let Some(content) = chunk.content.as_ref() {
                            outputs.push(content.clone());
                        }
                    } else {
                        stream_valid = false;
                    }
                    if let Some(trace) = chunk.automatic_function_calling_history.as_ref() {
                        afc_history = Some(trace.clone());
                    }
                    yield Ok(chunk);
                }

                let error = match drain_error {
                    Some(e) => state.annotate(e),
                    None if !received_any => GantryError::InvalidStream("stream ended without any chunks".into()),
                    None if !stream_valid => GantryError::InvalidStream("stream contained an empty or malformed chunk".into()),
                    None => {
                        state.commit(index, user_content, outputs, afc_history, curated_len);
                        return;
                    }
                };

                let retryable = matches!(error, GantryError::InvalidStream(_)) || error.is_retryable();
                if retryable && attempt < policy.max_attempts {
                    tracing::warn!(attempt, max_attempts = policy.max_attempts, error = %error, "re-attempting stream");
                    continue;
                }

                state.rollback(index, &user_content);
                yield Err(error);
                return;
            }
        };

        Ok(Box::pin(stream))
    }

    /// Independent copy of the history, curated or comprehensive
    pub fn get_history(&self, curated: bool) -> Vec<Content> {
        let history = self.state.history();
        if curated {
            extract_curated_history(&history)
        } else {
            history
        }
    }

    pub fn clear_history(&self) {
        write(&self.state.history).clear();
    }

    /// Append a turn without validation
    pub fn add_history(&self, content: Content) {
        write(&self.state.history).push(content);
    }

    /// Replace the whole history without validation
    pub fn set_history(&self, history: Vec<Content>) {
        *write(&self.state.history) = history;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGenerator;

    fn conversation(generator: Arc<ScriptedGenerator>) -> Conversation {
        Conversation::new(
            generator,
            "main-model",
            GenerateConfig::default(),
            Vec::new(),
            SessionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_send_message_records_exchange() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_text("pong");
        let chat = conversation(generator.clone());

        let response = chat.send_message(vec![Part::text("ping")], "p1").await.unwrap();
        assert_eq!(response.text(), "pong");
        assert_eq!(chat.get_history(false), vec![Content::user("ping"), Content::model("pong")]);
        assert_eq!(generator.requests()[0].model, "main-model");
    }

    #[tokio::test]
    async fn test_failed_send_leaves_history_unchanged() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_error(GantryError::api(400, "bad request"));
        let chat = conversation(generator);

        assert!(chat.send_message(vec![Part::text("ping")], "p1").await.is_err());
        assert!(chat.get_history(false).is_empty());
    }

    #[tokio::test]
    async fn test_history_copies_are_independent() {
        let chat = conversation(Arc::new(ScriptedGenerator::new()));
        chat.add_history(Content::user("a"));

        let mut copy = chat.get_history(false);
        copy.push(Content::model("injected"));
        assert_eq!(chat.get_history(false).len(), 1);
    }

    #[tokio::test]
    async fn test_schema_depth_error_names_cyclic_tools() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_error(GantryError::api(400, "Request contains an invalid argument"));
        let chat = conversation(generator);
        chat.set_tools(vec![ToolDefinition::function(
            "tree",
            "walks a tree",
            serde_json::json!({
                "type": "object",
                "properties": {"child": {"$ref": "#"}}
            }),
        )]);

        let err = chat.send_message(vec![Part::text("go")], "p").await.unwrap_err();
        assert!(matches!(err, GantryError::SchemaDepth { ref tools, .. } if tools == &["tree"]));
    }
}
