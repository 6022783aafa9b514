//! The failover engine: retries, cooldowns and model rotation around a
//! single [`LlmBackend`](crate::backends::LlmBackend).
//!
//! Each [`FailoverEngine::invoke`] classifies every upstream failure and then
//! either retries the same model after a backoff delay or puts it on cooldown
//! and rotates to the next available one. After a rotation the caller's
//! [`HandoffSnapshot`](crate::handoff::HandoffSnapshot) is injected so the new
//! model can continue the task.

use crate::backends::LlmBackend;
use crate::backoff::BackoffScheduler;
use crate::classifier::{classify, Classification, ErrorKind, UpstreamFailure};
use crate::config::{CooldownPolicy, FailoverConfig};
use crate::events::{EventBus, FailoverEvent};
use crate::handoff::{inject_into_conversation, HandoffSnapshot};
use crate::pool::{ModelPool, ModelStatus};
use prospector_core::{Message, ProspectorResult};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Terminal outcome of one [`FailoverEngine::invoke`] call.
///
/// Expected failures never surface as `Err`: they come back here with the
/// classified kind so the caller can react (summarize on `context_length`,
/// ask for credentials on `auth_error`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    /// Whether a model produced content.
    pub success: bool,
    /// Model output; empty on failure.
    pub content: String,
    /// Model that produced the content, or the last model attempted.
    pub model_used: String,
    /// Same-model retries performed during this call.
    pub retry_count: u32,
    /// Model switches performed during this call.
    pub switch_count: u32,
    /// Last upstream error message on failure.
    pub error: Option<String>,
    /// Classified kind of the last error; `None` on success or cancellation.
    pub error_kind: Option<ErrorKind>,
    /// Set when the caller's stop signal ended the call early.
    #[serde(default)]
    pub cancelled: bool,
}

impl InvocationResult {
    fn succeeded(content: String, model: String, retry_count: u32, switch_count: u32) -> Self {
        Self {
            success: true,
            content,
            model_used: model,
            retry_count,
            switch_count,
            error: None,
            error_kind: None,
            cancelled: false,
        }
    }

    fn failed(
        model: String,
        retry_count: u32,
        switch_count: u32,
        error: String,
        error_kind: Option<ErrorKind>,
    ) -> Self {
        Self {
            success: false,
            content: String::new(),
            model_used: model,
            retry_count,
            switch_count,
            error: Some(error),
            error_kind,
            cancelled: false,
        }
    }

    /// A short, kind-specific explanation suitable for end users. `None` on
    /// success.
    pub fn user_message(&self) -> Option<String> {
        if self.success {
            return None;
        }
        if self.cancelled {
            return Some("The request was stopped before a model answered.".into());
        }
        let text = match self.error_kind {
            Some(ErrorKind::AuthError) => {
                "The model provider rejected the API credentials. Check your API key."
            }
            Some(ErrorKind::ContextLength) => {
                "The conversation is too long for the model. Summarize or trim it and try again."
            }
            Some(ErrorKind::BadRequest) => "The model provider rejected the request as invalid.",
            Some(ErrorKind::RateLimit) => {
                "All models are rate limited right now. Try again in a few minutes."
            }
            Some(ErrorKind::Timeout) => "The model provider did not respond in time.",
            Some(ErrorKind::ServerError) => "The model provider is having server problems.",
            Some(ErrorKind::Unknown) | None => "No model could complete the request.",
        };
        Some(text.to_string())
    }
}

/// Cumulative counters plus per-model state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Invocations started since creation or the last reset.
    pub total_invocations: u64,
    /// Invocations that returned content.
    pub successful_invocations: u64,
    /// Invocations that failed or were cancelled.
    pub failed_invocations: u64,
    /// Same-model retries across all invocations.
    pub total_retries: u64,
    /// Model switches across all invocations.
    pub total_switches: u64,
    /// Model the next invocation will start on.
    pub active_model: String,
    /// Per-model cooldown and failure state.
    pub models: Vec<ModelStatus>,
}

#[derive(Default)]
struct Counters {
    invocations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    switches: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [
            &self.invocations,
            &self.successes,
            &self.failures,
            &self.retries,
            &self.switches,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// What to do after a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextStep {
    RetrySame { delay_ms: u64 },
    Switch { cooldown_ms: u64 },
}

/// Keeps an agent's model calls alive across rate limits, timeouts and
/// server errors by retrying with backoff and rotating through a pool of
/// interchangeable models.
///
/// Construct one per host application and share it as `Arc<FailoverEngine>`;
/// every holder then sees the same cooldowns, so a rate limit hit by one
/// caller steers the next caller away from that model.
pub struct FailoverEngine {
    backend: Arc<dyn LlmBackend>,
    pool: ModelPool,
    backoff: BackoffScheduler,
    cooldowns: CooldownPolicy,
    events: Arc<EventBus>,
    counters: Counters,
}

impl FailoverEngine {
    /// Create an engine over the rotation described by `config`.
    ///
    /// # Panics
    /// Panics if the configuration resolves to no models.
    pub fn new(config: FailoverConfig, backend: Arc<dyn LlmBackend>) -> Self {
        Self::with_events(config, backend, Arc::new(EventBus::new()))
    }

    /// Like [`new`](Self::new) but publishing to an existing event bus.
    pub fn with_events(
        config: FailoverConfig,
        backend: Arc<dyn LlmBackend>,
        events: Arc<EventBus>,
    ) -> Self {
        let pool = ModelPool::new(config.rotation(), events.clone());
        Self {
            backend,
            pool,
            backoff: BackoffScheduler::new(config.retry_policy),
            cooldowns: config.cooldowns,
            events,
            counters: Counters::default(),
        }
    }

    /// Event bus the engine and its pool publish to.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The shared model pool.
    pub fn pool(&self) -> &ModelPool {
        &self.pool
    }

    /// Model the next invocation will start on.
    pub fn active_model(&self) -> String {
        self.pool.active_model()
    }

    /// Manually select a model, bypassing cooldowns.
    pub fn force_model(&self, model: &str) -> ProspectorResult<()> {
        self.pool.force_model(model)
    }

    /// Clear all cooldowns and counters, e.g. at the start of a new session.
    pub fn reset(&self) {
        self.pool.reset();
        self.counters.reset();
        info!(model = %self.pool.active_model(), "Failover engine reset");
    }

    /// Cumulative counters plus a per-model snapshot.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            total_invocations: self.counters.invocations.load(Ordering::Relaxed),
            successful_invocations: self.counters.successes.load(Ordering::Relaxed),
            failed_invocations: self.counters.failures.load(Ordering::Relaxed),
            total_retries: self.counters.retries.load(Ordering::Relaxed),
            total_switches: self.counters.switches.load(Ordering::Relaxed),
            active_model: self.pool.active_model(),
            models: self.pool.snapshot(),
        }
    }

    /// Run one invocation to completion. See
    /// [`invoke_with_cancel`](Self::invoke_with_cancel).
    pub async fn invoke(
        &self,
        messages: &[Message],
        handoff: Option<&HandoffSnapshot>,
    ) -> InvocationResult {
        self.invoke_with_cancel(messages, handoff, &CancellationToken::new())
            .await
    }

    /// Send `messages` to the active model, retrying and failing over until a
    /// model answers, a non-recoverable error occurs, the attempt budget
    /// (`models * max_retries`) runs out, or `cancel` fires.
    ///
    /// `handoff` is injected into the conversation only on calls made after
    /// at least one switch during this invocation.
    pub async fn invoke_with_cancel(
        &self,
        messages: &[Message],
        handoff: Option<&HandoffSnapshot>,
        cancel: &CancellationToken,
    ) -> InvocationResult {
        self.counters.invocations.fetch_add(1, Ordering::Relaxed);

        let model_count = self.pool.len();
        let max_retries = self.backoff.policy().max_retries;
        let budget = (model_count as u32).saturating_mul(max_retries).max(1);

        let mut retry_count = 0u32;
        let mut switch_count = 0u32;
        let mut model_retries = 0u32;
        let mut attempts = 0u32;
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_failure: Option<(UpstreamFailure, Classification)> = None;
        let mut model = self.pool.active_model();

        while attempts < budget {
            if cancel.is_cancelled() {
                return self.finish_cancelled(model, retry_count, switch_count);
            }

            model = self.pool.active_model();

            // Every model has had a go: let the active one cool down before
            // starting another lap instead of spinning.
            if tried.len() >= model_count {
                if let Some(wait) = self.pool.cooldown_remaining(&model) {
                    info!(model = %model, wait_ms = wait.as_millis() as u64, "All models tried, waiting for cooldown");
                    if !pause(wait, cancel).await {
                        return self.finish_cancelled(model, retry_count, switch_count);
                    }
                }
                tried.clear();
            }

            let mut cooling = self.pool.cooldown_remaining(&model);
            if let Some(wait) = cooling {
                if wait >= Duration::from_millis(self.cooldowns.max_inline_wait_ms) {
                    let next = self.pool.advance_past(&model, "cooldown too long");
                    if next != model {
                        switch_count += 1;
                        model_retries = 0;
                        model = next;
                        cooling = self.pool.cooldown_remaining(&model);
                    }
                }
            }
            if let Some(wait) = cooling {
                info!(model = %model, wait_ms = wait.as_millis() as u64, "Waiting for model cooldown");
                if !pause(wait, cancel).await {
                    return self.finish_cancelled(model, retry_count, switch_count);
                }
            }

            tried.insert(model.clone());
            let outbound: Cow<'_, [Message]> = match handoff {
                Some(snapshot) if switch_count > 0 => {
                    Cow::Owned(inject_into_conversation(messages, snapshot))
                }
                _ => Cow::Borrowed(messages),
            };

            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.finish_cancelled(model, retry_count, switch_count);
                }
                outcome = self.backend.invoke(&model, &outbound) => outcome,
            };

            let failure = match outcome {
                Ok(content) => {
                    self.pool.record_success(&model);
                    self.record_totals(true, retry_count, switch_count);
                    info!(model = %model, attempts, retry_count, switch_count, "Invocation succeeded");
                    return InvocationResult::succeeded(content, model, retry_count, switch_count);
                }
                Err(failure) => failure,
            };

            let classification = classify(&failure);
            self.events.emit(FailoverEvent::ErrorClassified {
                kind: classification.kind,
                message: failure.message.clone(),
                recoverable: classification.recoverable(),
            });

            if !classification.recoverable() {
                warn!(model = %model, kind = %classification.kind, error = %failure, "Non-recoverable error, giving up");
                self.record_totals(false, retry_count, switch_count);
                return InvocationResult::failed(
                    model,
                    retry_count,
                    switch_count,
                    failure.message,
                    Some(classification.kind),
                );
            }

            let step = self.next_step(&classification, model_retries);
            last_failure = Some((failure, classification));

            match step {
                NextStep::RetrySame { delay_ms } => {
                    if attempts >= budget {
                        break;
                    }
                    model_retries += 1;
                    retry_count += 1;
                    self.events.emit(FailoverEvent::RetryAttempt {
                        model: model.clone(),
                        attempt: model_retries,
                        max_retries,
                        delay_ms,
                    });
                    if !pause(Duration::from_millis(delay_ms), cancel).await {
                        return self.finish_cancelled(model, retry_count, switch_count);
                    }
                }
                NextStep::Switch { cooldown_ms } => {
                    let reason = classification.kind.as_str();
                    self.pool.put_on_cooldown(&model, cooldown_ms, reason);
                    let next = self.pool.advance_past(&model, reason);
                    if next != model {
                        switch_count += 1;
                    }
                    model_retries = 0;
                }
            }
        }

        warn!(model = %model, attempts, budget, "Attempt budget exhausted");
        self.record_totals(false, retry_count, switch_count);
        let (error, kind) = match last_failure {
            Some((failure, classification)) => (failure.message, Some(classification.kind)),
            None => ("attempt budget exhausted".to_string(), None),
        };
        InvocationResult::failed(model, retry_count, switch_count, error, kind)
    }

    /// Retry the same model or cool it down and switch.
    fn next_step(&self, classification: &Classification, model_retries: u32) -> NextStep {
        let retries_left = model_retries < self.backoff.policy().max_retries;
        let attempt = model_retries + 1;

        match classification.kind {
            ErrorKind::RateLimit => {
                let cooldown_ms = classification
                    .retry_after_ms
                    .unwrap_or(self.cooldowns.rate_limit_cooldown_ms);
                if retries_left && cooldown_ms < self.cooldowns.short_cooldown_ms {
                    // The server hint is a floor for the backoff curve.
                    NextStep::RetrySame {
                        delay_ms: cooldown_ms.max(self.backoff.delay(attempt, None)),
                    }
                } else {
                    NextStep::Switch { cooldown_ms }
                }
            }
            _ if retries_left => NextStep::RetrySame {
                delay_ms: self.backoff.delay(attempt, None),
            },
            _ => NextStep::Switch {
                cooldown_ms: self.cooldowns.error_cooldown_ms,
            },
        }
    }

    fn record_totals(&self, success: bool, retries: u32, switches: u32) {
        let outcome = if success {
            &self.counters.successes
        } else {
            &self.counters.failures
        };
        outcome.fetch_add(1, Ordering::Relaxed);
        self.counters
            .retries
            .fetch_add(u64::from(retries), Ordering::Relaxed);
        self.counters
            .switches
            .fetch_add(u64::from(switches), Ordering::Relaxed);
    }

    fn finish_cancelled(&self, model: String, retries: u32, switches: u32) -> InvocationResult {
        info!(model = %model, "Invocation cancelled");
        self.record_totals(false, retries, switches);
        let mut result =
            InvocationResult::failed(model, retries, switches, "invocation cancelled".into(), None);
        result.cancelled = true;
        result
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backoff::RetryPolicy;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    /// A mock backend that replays scripted results per model.
    #[derive(Default)]
    struct ScriptedBackend {
        scripts: Mutex<HashMap<String, VecDeque<Result<String, UpstreamFailure>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn script(self, model: &str, results: Vec<Result<String, UpstreamFailure>>) -> Self {
            self.scripts.lock().insert(model.to_string(), results.into());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedBackend {
        async fn invoke(&self, model: &str, _messages: &[Message]) -> Result<String, UpstreamFailure> {
            self.calls.lock().push(model.to_string());
            self.scripts
                .lock()
                .get_mut(model)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Err(UpstreamFailure::new("script exhausted")))
        }
    }

    fn instant_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.0,
        }
    }

    fn engine(backend: Arc<ScriptedBackend>, max_retries: u32) -> FailoverEngine {
        FailoverEngine::new(
            FailoverConfig::new(["a", "b"]).with_retry_policy(instant_policy(max_retries)),
            backend,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_second_try() {
        let backend = Arc::new(ScriptedBackend::default().script(
            "a",
            vec![Err(UpstreamFailure::status(503)), Ok("ok".into())],
        ));
        let result = engine(backend.clone(), 2).invoke(&[], None).await;

        assert!(result.success);
        assert_eq!(result.content, "ok");
        assert_eq!(result.model_used, "a");
        assert_eq!(result.retry_count, 1);
        assert_eq!(result.switch_count, 0);
        assert_eq!(backend.calls(), vec!["a", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failover_to_second_model_after_retries() {
        let backend = Arc::new(
            ScriptedBackend::default()
                .script("a", vec![Err(UpstreamFailure::status(502)); 3])
                .script("b", vec![Ok("second model".into())]),
        );
        let engine = engine(backend.clone(), 2);
        let result = engine.invoke(&[], None).await;

        assert!(result.success);
        assert_eq!(result.content, "second model");
        assert_eq!(result.model_used, "b");
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.switch_count, 1);
        assert_eq!(engine.active_model(), "b");

        let a = &engine.stats().models[0];
        assert_eq!(a.consecutive_failures, 1);
        assert_eq!(a.last_error.as_deref(), Some("server_error"));
        assert_eq!(a.cooldown_remaining_ms, 30_000);
    }

    #[tokio::test(start_paused = true)]
    async fn non_recoverable_stops_immediately() {
        let backend = Arc::new(
            ScriptedBackend::default()
                .script("a", vec![Err(UpstreamFailure::new("prompt has too many tokens").with_status(400))])
                .script("b", vec![Ok("should not reach".into())]),
        );
        let result = engine(backend.clone(), 2).invoke(&[], None).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::ContextLength));
        assert_eq!(backend.calls(), vec!["a"]);
        assert!(result.user_message().unwrap().contains("too long"));
    }

    #[tokio::test(start_paused = true)]
    async fn next_step_policy() {
        let engine = engine(Arc::new(ScriptedBackend::default()), 2);
        let rate_limit = |ms| Classification {
            kind: ErrorKind::RateLimit,
            retry_after_ms: Some(ms),
        };
        let server = Classification {
            kind: ErrorKind::ServerError,
            retry_after_ms: None,
        };

        assert_eq!(engine.next_step(&rate_limit(1_000), 0), NextStep::RetrySame { delay_ms: 1_000 });
        assert_eq!(engine.next_step(&rate_limit(1_000), 2), NextStep::Switch { cooldown_ms: 1_000 });
        assert_eq!(engine.next_step(&rate_limit(15_000), 0), NextStep::Switch { cooldown_ms: 15_000 });
        assert_eq!(engine.next_step(&server, 1), NextStep::RetrySame { delay_ms: 0 });
        assert_eq!(engine.next_step(&server, 2), NextStep::Switch { cooldown_ms: 30_000 });

        let no_hint = Classification {
            kind: ErrorKind::RateLimit,
            retry_after_ms: None,
        };
        assert_eq!(engine.next_step(&no_hint, 0), NextStep::RetrySame { delay_ms: 5_000 });
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_counters_and_cooldowns() {
        let backend = Arc::new(
            ScriptedBackend::default()
                .script("a", vec![Err(UpstreamFailure::status(429).with_retry_after("120"))])
                .script("b", vec![Ok("ok".into())]),
        );
        let engine = engine(backend, 2);
        assert!(engine.invoke(&[], None).await.success);
        assert_eq!(engine.stats().total_switches, 1);

        engine.reset();
        let stats = engine.stats();
        assert_eq!(stats.total_invocations, 0);
        assert_eq!(stats.total_switches, 0);
        assert_eq!(stats.active_model, "a");
        assert!(stats.models.iter().all(|m| m.available));
    }
}
