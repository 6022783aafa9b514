//! Failover lifecycle events and their delivery.

use crate::classifier::ErrorKind;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lifecycle events emitted while the failover engine works.
///
/// These are observability signals for UIs and logs; the engine's correctness
/// never depends on anyone consuming them. Within one invocation they are
/// delivered in the exact order the transitions happen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailoverEvent {
    /// The active model pointer moved to a different model.
    ModelSwitch {
        /// Model that was active before the switch.
        from: String,
        /// Model that is active now.
        to: String,
        /// Error kind or other cause, e.g. `rate_limit` or `manual override`.
        reason: String,
    },

    /// A model was excluded from selection for a while.
    ModelCooldown {
        /// Model placed on cooldown.
        model: String,
        /// Wall-clock time at which the model becomes selectable again.
        until: DateTime<Utc>,
        /// Cooldown length in milliseconds.
        cooldown_ms: u64,
        /// Error kind that triggered the cooldown.
        reason: String,
    },

    /// The engine is about to retry the same model after a delay.
    RetryAttempt {
        /// Model being retried.
        model: String,
        /// Retry number on this model, starting at 1.
        attempt: u32,
        /// Configured retry limit per model.
        max_retries: u32,
        /// Pause before the retry, in milliseconds.
        delay_ms: u64,
    },

    /// An upstream failure was classified.
    ErrorClassified {
        /// Classified failure kind.
        kind: ErrorKind,
        /// Upstream error message.
        message: String,
        /// Whether retry or failover will be attempted.
        recoverable: bool,
    },
}

impl FailoverEvent {
    /// Stable event name, e.g. `model:switch`.
    pub fn name(&self) -> &'static str {
        match self {
            FailoverEvent::ModelSwitch { .. } => "model:switch",
            FailoverEvent::ModelCooldown { .. } => "model:cooldown",
            FailoverEvent::RetryAttempt { .. } => "retry:attempt",
            FailoverEvent::ErrorClassified { .. } => "error:classified",
        }
    }
}

type Listener = Arc<dyn Fn(&FailoverEvent) + Send + Sync>;

/// Fan-out for [`FailoverEvent`]s: synchronous listeners plus channel
/// subscribers.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Listener>>,
    subscribers: RwLock<Vec<mpsc::UnboundedSender<FailoverEvent>>>,
}

impl EventBus {
    /// Create a bus with no listeners or subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked for every event, on the emitting task.
    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&FailoverEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Open a channel receiving every subsequent event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FailoverEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Log `event` and deliver it to every listener, then every live
    /// subscriber. Subscribers whose receiver was dropped are removed.
    pub fn emit(&self, event: FailoverEvent) {
        log_event(&event);

        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener(&event);
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn log_event(event: &FailoverEvent) {
    match event {
        FailoverEvent::ModelSwitch { from, to, reason } => {
            info!(from = %from, to = %to, reason = %reason, "Switching model");
        }
        FailoverEvent::ModelCooldown {
            model,
            until,
            cooldown_ms,
            reason,
        } => {
            warn!(model = %model, cooldown_ms, until = %until, reason = %reason, "Model on cooldown");
        }
        FailoverEvent::RetryAttempt {
            model,
            attempt,
            max_retries,
            delay_ms,
        } => {
            info!(model = %model, attempt, max_retries, delay_ms, "Retrying same model");
        }
        FailoverEvent::ErrorClassified {
            kind,
            message,
            recoverable,
        } => {
            debug!(kind = %kind, recoverable, error = %message, "Classified upstream error");
        }
    }
}
