//! Agent module - conversation engine, sub-agents and orchestration
//!
//! Contains the history state machine, the retry policies around it, the
//! bounded sub-agent runner and the interactive agent loop.

pub mod conversation;
pub mod history;
pub mod loop_state;
pub mod orchestrator;
pub mod retry;
pub mod sub_agent;

pub use conversation::{Conversation, SessionConfig};
pub use loop_state::LoopState;
pub use orchestrator::{Agent, AgentEvent, EventCallback};
pub use retry::{AcceptFallback, FallbackHandler, RetryPolicy, StreamRetryPolicy};
pub use sub_agent::{
    AgentContext, ContextState, ModelConfig, OutputConfig, OutputObject, PromptConfig, RunConfig,
    SubAgentOptions, SubAgentScope, SubagentTerminateMode, ToolConfig,
};
