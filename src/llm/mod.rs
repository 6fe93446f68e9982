//! LLM module - content generator seam and backends
//!
//! The conversation engine depends only on [`ContentGenerator`]. Ollama is
//! the network backend; the scripted generator replays canned replies.

pub mod ollama;
pub mod scripted;
pub mod traits;

pub use ollama::OllamaClient;
pub use scripted::{ScriptedGenerator, ScriptedReply};
pub use traits::{
    ContentGenerator, GenerateConfig, GenerateRequest, GenerateResponse, ResponseStream,
    TokenUsage,
};
