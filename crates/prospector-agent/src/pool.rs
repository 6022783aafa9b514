//! The model rotation and its per-model cooldown state.

use crate::events::{EventBus, FailoverEvent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prospector_core::{ProspectorError, ProspectorResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Mutable state for one candidate model in the rotation.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    /// Model name as sent upstream.
    pub identifier: String,
    /// The model is skipped for new calls while `now < cooldown_until`.
    pub cooldown_until: Option<Instant>,
    /// Reset on success, incremented on every cooldown.
    pub consecutive_failures: u32,
    /// Reason recorded with the most recent cooldown.
    pub last_error: Option<String>,
    /// Time of the last successful call.
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ModelEntry {
    fn new(identifier: String) -> Self {
        Self {
            identifier,
            cooldown_until: None,
            consecutive_failures: 0,
            last_error: None,
            last_used_at: None,
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn is_available(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }

    fn clear(&mut self) {
        self.cooldown_until = None;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.last_used_at = None;
    }
}

/// Point-in-time view of a [`ModelEntry`] for stats and UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    /// Model name.
    pub identifier: String,
    /// Whether this is the pool's active model.
    pub active: bool,
    /// Whether the model's cooldown has expired.
    pub available: bool,
    /// Milliseconds left on the cooldown; 0 when available.
    pub cooldown_remaining_ms: u64,
    /// Cooldowns since the last success.
    pub consecutive_failures: u32,
    /// Reason recorded with the most recent cooldown.
    pub last_error: Option<String>,
    /// Time of the last successful call.
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Builds the rotation order.
///
/// An explicit ordering wins verbatim. Otherwise a preferred model goes first
/// followed by the remaining configured models in their default order.
/// Otherwise the configured order is used as-is.
pub fn resolve_model_order(
    configured: &[String],
    explicit: Option<&[String]>,
    preferred: Option<&str>,
) -> Vec<String> {
    if let Some(order) = explicit.filter(|order| !order.is_empty()) {
        return order.to_vec();
    }
    match preferred {
        Some(first) => std::iter::once(first.to_string())
            .chain(configured.iter().filter(|m| *m != first).cloned())
            .collect(),
        None => configured.to_vec(),
    }
}

fn wall_clock_deadline(duration_ms: u64) -> DateTime<Utc> {
    i64::try_from(duration_ms)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

struct PoolState {
    entries: Vec<ModelEntry>,
    active: usize,
}

impl PoolState {
    fn index_of(&self, model: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.identifier == model)
    }

    /// First available model scanning circularly from `start` (inclusive);
    /// falls back to the model whose cooldown ends soonest.
    fn resolve_from(&self, start: usize, now: Instant) -> usize {
        let n = self.entries.len();
        (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| self.entries[i].is_available(now))
            .unwrap_or_else(|| self.soonest(now))
    }

    fn soonest(&self, now: Instant) -> usize {
        self.entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.remaining(now))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

/// Ordered pool of interchangeable models with per-model cooldowns.
///
/// All mutation goes through an internal mutex, so a pool shared by several
/// concurrent invocations never loses cooldown or failure-count updates.
/// Events are emitted after the lock is released.
pub struct ModelPool {
    state: Mutex<PoolState>,
    events: Arc<EventBus>,
}

impl ModelPool {
    /// Create a pool over `models` in rotation order.
    ///
    /// # Panics
    /// Panics if `models` is empty.
    pub fn new(models: Vec<String>, events: Arc<EventBus>) -> Self {
        assert!(!models.is_empty(), "ModelPool requires at least one model");
        let entries: Vec<ModelEntry> = models.into_iter().map(ModelEntry::new).collect();
        let mut state = PoolState { entries, active: 0 };
        state.active = state.resolve_from(0, Instant::now());
        Self {
            state: Mutex::new(state),
            events,
        }
    }

    /// Number of models in the rotation.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Always `false` for a constructed pool.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `model` is part of the rotation.
    pub fn contains(&self, model: &str) -> bool {
        self.state.lock().index_of(model).is_some()
    }

    /// Model names in rotation order.
    pub fn models(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| e.identifier.clone())
            .collect()
    }

    /// The currently selected model.
    pub fn active_model(&self) -> String {
        let state = self.state.lock();
        state.entries[state.active].identifier.clone()
    }

    /// Position of the active model in the rotation.
    pub fn active_index(&self) -> usize {
        self.state.lock().active
    }

    /// Move to the first model after `from_index` (circularly) whose cooldown
    /// has expired, or to the one that frees up soonest when none has.
    ///
    /// Never blocks. A switch event is emitted only when the active index
    /// actually changes.
    pub fn advance_to_next(&self, from_index: usize, reason: &str) -> String {
        self.move_active(reason, |state, now| {
            state.resolve_from((from_index + 1) % state.entries.len(), now)
        })
    }

    /// [`advance_to_next`](Self::advance_to_next) from the active index.
    pub fn advance(&self, reason: &str) -> String {
        self.move_active(reason, |state, now| {
            state.resolve_from((state.active + 1) % state.entries.len(), now)
        })
    }

    /// Rotate away from `failed`, scanning from its position.
    ///
    /// The pointer only moves if `failed` is still the active model. When a
    /// concurrent caller has already rotated away from it, the current
    /// active model is returned unchanged and no event is emitted.
    pub fn advance_past(&self, failed: &str, reason: &str) -> String {
        self.move_active(reason, |state, now| match state.index_of(failed) {
            Some(i) if i == state.active => {
                state.resolve_from((i + 1) % state.entries.len(), now)
            }
            _ => state.active,
        })
    }

    /// Select a new active index under a single lock, then emit a switch
    /// event if it changed.
    fn move_active<F>(&self, reason: &str, select: F) -> String
    where
        F: FnOnce(&PoolState, Instant) -> usize,
    {
        let (from, to) = {
            let mut state = self.state.lock();
            let previous = state.active;
            let next = select(&*state, Instant::now());
            state.active = next;
            let from = (next != previous).then(|| state.entries[previous].identifier.clone());
            (from, state.entries[next].identifier.clone())
        };

        match from {
            Some(from) => self.events.emit(FailoverEvent::ModelSwitch {
                from,
                to: to.clone(),
                reason: reason.to_string(),
            }),
            None => debug!(model = %to, "Active model unchanged"),
        }
        to
    }

    /// Exclude `model` from selection for `duration_ms`.
    pub fn put_on_cooldown(&self, model: &str, duration_ms: u64, reason: &str) {
        let applied = {
            let mut state = self.state.lock();
            match state.index_of(model) {
                Some(i) => {
                    let entry = &mut state.entries[i];
                    let now = Instant::now();
                    entry.cooldown_until = Some(
                        now.checked_add(Duration::from_millis(duration_ms))
                            .unwrap_or(now + Duration::from_secs(86_400 * 365)),
                    );
                    entry.consecutive_failures += 1;
                    entry.last_error = Some(reason.to_string());
                    true
                }
                None => false,
            }
        };

        if applied {
            self.events.emit(FailoverEvent::ModelCooldown {
                model: model.to_string(),
                until: wall_clock_deadline(duration_ms),
                cooldown_ms: duration_ms,
                reason: reason.to_string(),
            });
        }
    }

    /// Clear the failure state of `model` after a successful call.
    pub fn record_success(&self, model: &str) {
        let mut state = self.state.lock();
        if let Some(i) = state.index_of(model) {
            let entry = &mut state.entries[i];
            entry.consecutive_failures = 0;
            entry.last_error = None;
            entry.last_used_at = Some(Utc::now());
        }
    }

    /// Time left before `model` is usable, or `None` if it already is.
    pub fn cooldown_remaining(&self, model: &str) -> Option<Duration> {
        let state = self.state.lock();
        let i = state.index_of(model)?;
        let remaining = state.entries[i].remaining(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Whether `model` is out of cooldown. Unknown models count as available.
    pub fn is_available(&self, model: &str) -> bool {
        self.cooldown_remaining(model).is_none()
    }

    /// Time until at least one model is usable; zero if one already is.
    pub fn soonest_available_in(&self) -> Duration {
        let state = self.state.lock();
        let now = Instant::now();
        state
            .entries
            .iter()
            .map(|e| e.remaining(now))
            .min()
            .unwrap_or_default()
    }

    /// Manually point the pool at `model`, ignoring cooldowns.
    pub fn force_model(&self, model: &str) -> ProspectorResult<()> {
        let switched = {
            let mut state = self.state.lock();
            let target = state
                .index_of(model)
                .ok_or_else(|| ProspectorError::Config(format!("Unknown model '{model}'")))?;
            let previous = state.active;
            state.active = target;
            (previous != target).then(|| state.entries[previous].identifier.clone())
        };

        if let Some(from) = switched {
            self.events.emit(FailoverEvent::ModelSwitch {
                from,
                to: model.to_string(),
                reason: "manual override".to_string(),
            });
        }
        Ok(())
    }

    /// Clear every cooldown and counter and re-select the first model.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.entries.iter_mut().for_each(ModelEntry::clear);
        state.active = state.resolve_from(0, Instant::now());
    }

    /// Per-model status in rotation order.
    pub fn snapshot(&self) -> Vec<ModelStatus> {
        let state = self.state.lock();
        let now = Instant::now();
        state
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| ModelStatus {
                identifier: e.identifier.clone(),
                active: i == state.active,
                available: e.is_available(now),
                cooldown_remaining_ms: e.remaining(now).as_millis() as u64,
                consecutive_failures: e.consecutive_failures,
                last_error: e.last_error.clone(),
                last_used_at: e.last_used_at,
            })
            .collect()
    }
}
