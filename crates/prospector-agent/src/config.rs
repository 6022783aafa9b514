//! Engine, retry and provider configuration, loadable from TOML.

use crate::backoff::RetryPolicy;
use crate::pool::resolve_model_order;
use prospector_core::{ProspectorError, ProspectorResult};
use serde::{Deserialize, Serialize};

/// Supported OpenAI-compatible provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI's hosted API.
    OpenAi,
    /// OpenRouter's multi-vendor gateway.
    OpenRouter,
    /// Groq cloud inference over its OpenAI-compatible API.
    Groq,
    /// Any other OpenAI-compatible endpoint; requires `api_base_url`.
    Custom,
}

/// Connection and sampling settings passed through to the upstream API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Which provider family to talk to.
    pub provider: LlmProvider,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub api_key: String,
    /// Overrides the provider's default endpoint.
    pub api_base_url: Option<String>,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Completion token limit per call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-request HTTP timeout, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl ProviderConfig {
    /// Settings for `provider` with default sampling parameters.
    pub fn new(provider: LlmProvider, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            api_base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// Endpoint root, without the `/v1/...` path.
    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.api_base_url {
            url
        } else {
            match self.provider {
                LlmProvider::OpenAi | LlmProvider::Custom => "https://api.openai.com",
                LlmProvider::OpenRouter => "https://openrouter.ai/api",
                LlmProvider::Groq => "https://api.groq.com/openai",
            }
        }
    }
}

/// Thresholds that decide between waiting, retrying and switching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownPolicy {
    /// Rate-limit waits below this are absorbed by retrying the same model.
    #[serde(default = "default_short_cooldown_ms")]
    pub short_cooldown_ms: u64,
    /// A cooling model is waited for in place only if it frees up within this.
    #[serde(default = "default_max_inline_wait_ms")]
    pub max_inline_wait_ms: u64,
    /// Cooldown for a rate limit without any hint.
    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u64,
    /// Cooldown after exhausting retries on timeouts, 5xx or unknown errors.
    #[serde(default = "default_error_cooldown_ms")]
    pub error_cooldown_ms: u64,
}

fn default_short_cooldown_ms() -> u64 {
    10_000
}

fn default_max_inline_wait_ms() -> u64 {
    60_000
}

fn default_rate_limit_cooldown_ms() -> u64 {
    5_000
}

fn default_error_cooldown_ms() -> u64 {
    30_000
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            short_cooldown_ms: default_short_cooldown_ms(),
            max_inline_wait_ms: default_max_inline_wait_ms(),
            rate_limit_cooldown_ms: default_rate_limit_cooldown_ms(),
            error_cooldown_ms: default_error_cooldown_ms(),
        }
    }
}

/// Everything needed to build a [`FailoverEngine`](crate::FailoverEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Configured models in default rotation order.
    pub models: Vec<String>,
    /// Model to try first; the rest follow in default order.
    #[serde(default)]
    pub preferred_model: Option<String>,
    /// Explicit rotation order, used verbatim when set.
    #[serde(default)]
    pub model_order: Option<Vec<String>>,
    /// Same-model retry behaviour.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Wait, retry and switch thresholds.
    #[serde(default)]
    pub cooldowns: CooldownPolicy,
    /// Upstream connection, used by the CLI to build an HTTP backend.
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
}

impl FailoverConfig {
    /// Configuration over `models` with default policies.
    pub fn new(models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            models: models.into_iter().map(Into::into).collect(),
            preferred_model: None,
            model_order: None,
            retry_policy: RetryPolicy::default(),
            cooldowns: CooldownPolicy::default(),
            provider: None,
        }
    }

    /// Put `model` first in the rotation.
    pub fn with_preferred_model(mut self, model: impl Into<String>) -> Self {
        self.preferred_model = Some(model.into());
        self
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Replace the cooldown thresholds.
    pub fn with_cooldowns(mut self, cooldowns: CooldownPolicy) -> Self {
        self.cooldowns = cooldowns;
        self
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> ProspectorResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ProspectorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The rotation order after applying `model_order` / `preferred_model`.
    pub fn rotation(&self) -> Vec<String> {
        resolve_model_order(
            &self.models,
            self.model_order.as_deref(),
            self.preferred_model.as_deref(),
        )
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> ProspectorResult<()> {
        let rotation = self.rotation();
        if rotation.is_empty() {
            return Err(ProspectorError::Config(
                "at least one model must be configured".into(),
            ));
        }
        if rotation.iter().any(|m| m.trim().is_empty()) {
            return Err(ProspectorError::Config("model identifiers must not be empty".into()));
        }
        let policy = &self.retry_policy;
        if !(policy.backoff_multiplier.is_finite() && policy.backoff_multiplier >= 1.0) {
            return Err(ProspectorError::Config(
                "backoff_multiplier must be a finite number >= 1".into(),
            ));
        }
        if policy.base_delay_ms > policy.max_delay_ms {
            return Err(ProspectorError::Config(
                "base_delay_ms must not exceed max_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&policy.jitter_ratio) {
            return Err(ProspectorError::Config("jitter_ratio must be within 0..=1".into()));
        }
        if let Some(provider) = &self.provider {
            if provider.provider == LlmProvider::Custom && provider.api_base_url.is_none() {
                return Err(ProspectorError::Config(
                    "custom provider requires api_base_url".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_fills_defaults() {
        let config: FailoverConfig = toml::from_str(r#"models = ["a", "b"]"#).unwrap();
        assert_eq!(config.retry_policy, RetryPolicy::default());
        assert_eq!(config.cooldowns, CooldownPolicy::default());
        assert_eq!(config.cooldowns.short_cooldown_ms, 10_000);
        assert_eq!(config.cooldowns.max_inline_wait_ms, 60_000);
        assert_eq!(config.cooldowns.error_cooldown_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_toml() {
        let config: FailoverConfig = toml::from_str(
            r#"
            models = ["llama-3.3-70b", "mixtral-8x7b", "gemma2-9b"]
            preferred_model = "mixtral-8x7b"

            [retry_policy]
            max_retries = 2
            base_delay_ms = 250

            [cooldowns]
            short_cooldown_ms = 5000

            [provider]
            provider = "groq"
            api_key = "gsk-test"
            temperature = 0.2
            "#,
        )
        .unwrap();

        assert_eq!(
            config.rotation(),
            vec!["mixtral-8x7b", "llama-3.3-70b", "gemma2-9b"]
        );
        assert_eq!(config.retry_policy.max_retries, 2);
        assert_eq!(config.retry_policy.max_delay_ms, 30_000);
        assert_eq!(config.cooldowns.short_cooldown_ms, 5_000);
        let provider = config.provider.unwrap();
        assert_eq!(provider.base_url(), "https://api.groq.com/openai");
        assert_eq!(provider.max_tokens, 4096);
    }

    #[test]
    fn from_toml_str_validates() {
        assert!(FailoverConfig::from_toml_str(r#"models = ["a"]"#).is_ok());
        let err = FailoverConfig::from_toml_str("models = []").unwrap_err();
        assert!(matches!(err, ProspectorError::Config(_)));
        let err = FailoverConfig::from_toml_str("models = 3").unwrap_err();
        assert!(matches!(err, ProspectorError::Config(_)));
    }

    #[test]
    fn validation_failures() {
        assert!(FailoverConfig::new(Vec::<String>::new()).validate().is_err());
        assert!(FailoverConfig::new([" "]).validate().is_err());

        let mut config = FailoverConfig::new(["a"]);
        config.retry_policy.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = FailoverConfig::new(["a"]);
        config.retry_policy.base_delay_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = FailoverConfig::new(["a"]);
        config.provider = Some(ProviderConfig::new(LlmProvider::Custom, "k"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("api_base_url"));
    }

    #[test]
    fn provider_base_url_override() {
        let mut provider = ProviderConfig::new(LlmProvider::OpenAi, "k");
        assert_eq!(provider.base_url(), "https://api.openai.com");
        provider.api_base_url = Some("http://localhost:11434".into());
        assert_eq!(provider.base_url(), "http://localhost:11434");
        assert_eq!(
            serde_json::to_string(&LlmProvider::OpenRouter).unwrap(),
            "\"openrouter\""
        );
    }
}
