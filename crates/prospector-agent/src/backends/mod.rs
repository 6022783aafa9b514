//! Upstream model adapters.

/// OpenAI-compatible chat completions over HTTP.
pub mod openai;

use crate::classifier::UpstreamFailure;
use async_trait::async_trait;
use prospector_core::Message;

/// Trait for upstream LLM backends driven by the failover engine.
///
/// One backend serves every model in the pool; the engine names the model per
/// call. Implementations translate whatever their client library reports into
/// an [`UpstreamFailure`] so the classifier never sees vendor-specific shapes.
///
/// To add a new provider:
/// 1. Create a new module in `backends/`
/// 2. Implement `LlmBackend` for your struct, filling `UpstreamFailure`
///    fields (status, message, vendor code/type, retry-after) from the response
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Send `messages` to `model` and return the assistant's text.
    async fn invoke(&self, model: &str, messages: &[Message]) -> Result<String, UpstreamFailure>;
}
