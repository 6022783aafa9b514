//! Maps upstream model failures onto a fixed error taxonomy.
//!
//! Backends normalize whatever their client library reports into an
//! [`UpstreamFailure`]; [`classify`] then decides which [`ErrorKind`] it is and
//! extracts a retry hint for rate limits. Classification is a pure function of
//! its input.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Wait used for a rate limit that carries no usable hint.
pub const DEFAULT_RATE_LIMIT_WAIT_MS: u64 = 3_000;

static TRY_AGAIN_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)try again in\s+(\d+(?:\.\d+)?)\s*s").ok()
});

/// Normalized view of a failed upstream call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamFailure {
    /// HTTP-equivalent status code, when the transport produced one.
    pub status: Option<u16>,
    /// Human-readable error message.
    pub message: String,
    /// Vendor-specific error code (e.g. `rate_limit_exceeded`).
    pub code: Option<String>,
    /// Vendor-specific error type (e.g. `rate_limit_error`).
    pub error_type: Option<String>,
    /// Raw `retry-after` header or field value.
    pub retry_after: Option<String>,
}

impl UpstreamFailure {
    /// A failure carrying only `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// A failure with only a status code and a generic message.
    pub fn status(status: u16) -> Self {
        Self::new(format!("upstream returned status {status}")).with_status(status)
    }

    /// A transport-level timeout.
    pub fn timeout() -> Self {
        Self::new("request timed out")
    }

    /// Set the status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the vendor error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Set the vendor error type.
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Set the raw `retry-after` value.
    pub fn with_retry_after(mut self, retry_after: impl Into<String>) -> Self {
        self.retry_after = Some(retry_after.into());
        self
    }
}

/// The fixed set of failure kinds the engine reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The provider throttled the caller.
    RateLimit,
    /// No response in time, or the connection dropped.
    Timeout,
    /// 5xx from the provider.
    ServerError,
    /// The conversation exceeds the model's context window.
    ContextLength,
    /// Credentials were rejected.
    AuthError,
    /// The request was malformed.
    BadRequest,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Whether retrying or failing over can help with this kind.
    ///
    /// `Unknown` is treated optimistically: stranding the agent on an
    /// ambiguous error is worse than one more attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::ServerError | ErrorKind::Unknown
        )
    }

    /// Stable snake_case name, also used as the cooldown reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ContextLength => "context_length",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying an [`UpstreamFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Failure kind.
    pub kind: ErrorKind,
    /// Suggested wait before the model is usable again. Only set for
    /// [`ErrorKind::RateLimit`].
    pub retry_after_ms: Option<u64>,
}

impl Classification {
    fn of(kind: ErrorKind) -> Self {
        Self {
            kind,
            retry_after_ms: None,
        }
    }

    /// Shorthand for [`ErrorKind::is_recoverable`].
    pub fn recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

/// Classify a failure. Checks run in priority order: rate limit, auth, bad
/// request (including context overflow), server error, timeout, unknown.
pub fn classify(failure: &UpstreamFailure) -> Classification {
    if is_rate_limit(failure) {
        return Classification {
            kind: ErrorKind::RateLimit,
            retry_after_ms: Some(rate_limit_wait_ms(failure)),
        };
    }

    let message = failure.message.to_lowercase();

    match failure.status {
        Some(401) | Some(403) => return Classification::of(ErrorKind::AuthError),
        Some(400) => {
            let overflow = failure.code.as_deref() == Some("context_length_exceeded")
                || ["context", "token", "length"]
                    .iter()
                    .any(|needle| message.contains(needle));
            return Classification::of(if overflow {
                ErrorKind::ContextLength
            } else {
                ErrorKind::BadRequest
            });
        }
        Some(status) if (500..600).contains(&status) => {
            return Classification::of(ErrorKind::ServerError)
        }
        _ => {}
    }

    if is_timeout_message(&message) {
        return Classification::of(ErrorKind::Timeout);
    }

    Classification::of(ErrorKind::Unknown)
}

fn is_rate_limit(failure: &UpstreamFailure) -> bool {
    if failure.status == Some(429) {
        return true;
    }
    [&failure.code, &failure.error_type]
        .into_iter()
        .flatten()
        .any(|field| {
            let field = field.to_lowercase();
            field.contains("rate_limit") || field.contains("ratelimit")
        })
}

fn is_timeout_message(lower: &str) -> bool {
    ["timeout", "timed out", "etimedout", "econnreset", "connection reset"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Derive the wait for a rate limit: header seconds, then a "try again in N
/// seconds" message, then the default.
fn rate_limit_wait_ms(failure: &UpstreamFailure) -> u64 {
    if let Some(secs) = failure
        .retry_after
        .as_deref()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
    {
        return secs.saturating_mul(1_000);
    }

    TRY_AGAIN_RE
        .as_ref()
        .and_then(|re| re.captures(&failure.message))
        .and_then(|caps| caps.get(1))
        .and_then(|m| seconds_to_ms_ceil(m.as_str()))
        .unwrap_or(DEFAULT_RATE_LIMIT_WAIT_MS)
}

/// Converts a decimal seconds string (`"15"`, `"1.0005"`) to milliseconds,
/// rounding any sub-millisecond remainder up.
fn seconds_to_ms_ceil(raw: &str) -> Option<u64> {
    let (whole, frac) = raw.split_once('.').unwrap_or((raw, ""));
    let secs: u64 = whole.parse().ok()?;
    let (ms_digits, rest) = frac.split_at(frac.len().min(3));
    let mut ms: u64 = if ms_digits.is_empty() {
        0
    } else {
        format!("{ms_digits:0<3}").parse().ok()?
    };
    if rest.bytes().any(|b| b != b'0') {
        ms += 1;
    }
    Some(secs.saturating_mul(1_000).saturating_add(ms))
}
