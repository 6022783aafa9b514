//! LLM provider failover and retry engine for Prospector.
//!
//! Keeps an agent's reasoning loop alive through rate limits, timeouts and
//! transient upstream errors: failures are classified, retried with
//! exponential backoff, or answered by cooling the model down and rotating to
//! the next one, with a handoff summary injected so the new model can pick up
//! the task.
//!
//! # Main types
//!
//! - [`FailoverEngine`]: drives one invocation through retries and switches.
//! - [`ModelPool`]: rotation order and per-model cooldown state.
//! - [`classify`] / [`ErrorKind`]: failure taxonomy.
//! - [`BackoffScheduler`] / [`RetryPolicy`]: delay curve.
//! - [`HandoffSnapshot`] / [`TaskContext`]: continuity across model swaps.
//! - [`EventBus`] / [`FailoverEvent`]: lifecycle notifications.

pub mod backends;
pub mod backoff;
pub mod classifier;
pub mod config;
pub mod context;
pub mod events;
pub mod failover;
pub mod handoff;
pub mod pool;

pub use backends::openai::OpenAiBackend;
pub use backends::LlmBackend;
pub use backoff::{BackoffScheduler, RetryPolicy};
pub use classifier::{classify, Classification, ErrorKind, UpstreamFailure};
pub use config::{CooldownPolicy, FailoverConfig, LlmProvider, ProviderConfig};
pub use context::TaskContext;
pub use events::{EventBus, FailoverEvent};
pub use failover::{EngineStats, FailoverEngine, InvocationResult};
pub use handoff::{
    build_snapshot, inject_into_conversation, is_handoff_message, HandoffSnapshot,
    ToolResultDigest,
};
pub use pool::{resolve_model_order, ModelEntry, ModelPool, ModelStatus};
pub use tokio_util::sync::CancellationToken;
