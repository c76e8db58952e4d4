//! Circuit breaker for provider health tracking.
//!
//! Tracks consecutive failures per provider key and refuses calls after a
//! failure threshold trips. After a cooldown the circuit goes half-open and
//! exactly one caller gets a trial call; success closes the circuit, failure
//! reopens it. The breaker never performs calls itself — it only gates and
//! records.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::schema::CircuitBreakerConfig;

/// Externally visible circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-provider health state.
struct ProviderState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// When the half-open trial slot was handed out, if a trial is pending.
    trial_started_at: Option<Instant>,
}

impl ProviderState {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            opened_at: None,
            trial_started_at: None,
        }
    }
}

/// Tracks provider health and trips when failures exceed a threshold.
///
/// Thread-safe: the state map is mutex-protected so concurrent requests can
/// share one breaker. Transitions are monotonic within a cooldown window —
/// while one caller holds the half-open trial slot, everyone else sees the
/// circuit as open.
pub struct CircuitBreaker {
    states: Mutex<HashMap<String, ProviderState>>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Create a new circuit breaker from config (defaults: 5 failures, 30s cooldown).
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self::with_settings(config.threshold, Duration::from_secs(config.cooldown_secs))
    }

    /// Create with custom threshold and cooldown.
    pub fn with_settings(threshold: u32, cooldown: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    /// Check whether a call to `provider` may proceed.
    ///
    /// On an open circuit whose cooldown has elapsed, the first caller is
    /// granted the single half-open trial; concurrent callers are refused
    /// until that trial resolves. A trial whose caller vanished without ever
    /// recording an outcome (cancelled future, embedder-side timeout) is
    /// reclaimed after one more cooldown, so an abandoned slot can't starve
    /// the provider forever.
    pub fn allow_call(&self, provider: &str) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = match states.get_mut(provider) {
            Some(s) => s,
            None => return true, // never seen = closed
        };

        if state.consecutive_failures < self.threshold {
            return true;
        }

        // Tripped. A pending trial holds the slot for one cooldown window.
        if let Some(started) = state.trial_started_at {
            if started.elapsed() < self.cooldown {
                return false;
            }
            state.trial_started_at = Some(Instant::now());
            debug!("Reclaiming abandoned trial slot for '{}'", provider);
            return true;
        }

        // Refuse until the cooldown has elapsed.
        let elapsed = match state.opened_at {
            Some(t) => t.elapsed() >= self.cooldown,
            None => true,
        };
        if !elapsed {
            return false;
        }

        state.trial_started_at = Some(Instant::now());
        debug!("Circuit for '{}' half-open, granting trial call", provider);
        true
    }

    /// Record a successful call, closing the circuit and resetting the counter.
    pub fn record_success(&self, provider: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = states.get_mut(provider) {
            if state.trial_started_at.is_some() {
                info!("Circuit for '{}' closed after successful trial", provider);
            }
            state.consecutive_failures = 0;
            state.opened_at = None;
            state.trial_started_at = None;
        }
    }

    /// Record a failed call.
    ///
    /// A failed half-open trial reopens the circuit and restarts the
    /// cooldown; so does any failure at or past the threshold.
    pub fn record_failure(&self, provider: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states
            .entry(provider.to_string())
            .or_insert_with(ProviderState::new);

        state.consecutive_failures += 1;
        if state.trial_started_at.is_some() {
            info!("Circuit for '{}' reopened after failed trial", provider);
            state.trial_started_at = None;
        }
        if state.consecutive_failures >= self.threshold {
            if state.opened_at.is_none() {
                info!(
                    "Circuit for '{}' opened after {} consecutive failures",
                    provider, state.consecutive_failures
                );
            }
            state.opened_at = Some(Instant::now());
        }
    }

    /// Current state of a provider's circuit, for metrics and tests.
    pub fn state(&self, provider: &str) -> CircuitState {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = match states.get(provider) {
            Some(s) => s,
            None => return CircuitState::Closed,
        };

        if state.consecutive_failures < self.threshold {
            return CircuitState::Closed;
        }
        if state.trial_started_at.is_some() {
            return CircuitState::HalfOpen;
        }
        CircuitState::Open
    }

    /// Drop all recorded state (tests, explicit resets).
    pub fn reset(&self) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(&CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_provider_is_available() {
        let cb = CircuitBreaker::default();
        assert!(cb.allow_call("llm"));
        assert_eq!(cb.state("llm"), CircuitState::Closed);
    }

    #[test]
    fn test_failures_below_threshold() {
        let cb = CircuitBreaker::default();
        for _ in 0..4 {
            cb.record_failure("llm");
        }
        // 4 failures < threshold of 5, still closed.
        assert!(cb.allow_call("llm"));
    }

    #[test]
    fn test_threshold_trips_circuit() {
        let cb = CircuitBreaker::default();
        for _ in 0..5 {
            cb.record_failure("llm");
        }
        assert!(!cb.allow_call("llm"));
        assert_eq!(cb.state("llm"), CircuitState::Open);
    }

    #[test]
    fn test_half_open_single_trial() {
        let cb = CircuitBreaker::with_settings(2, Duration::from_millis(10));
        cb.record_failure("llm");
        cb.record_failure("llm");
        assert!(!cb.allow_call("llm"));

        std::thread::sleep(Duration::from_millis(15));

        // Exactly one caller gets the trial; the next is refused.
        assert!(cb.allow_call("llm"));
        assert_eq!(cb.state("llm"), CircuitState::HalfOpen);
        assert!(!cb.allow_call("llm"));
    }

    #[test]
    fn test_trial_success_closes() {
        let cb = CircuitBreaker::with_settings(2, Duration::from_millis(10));
        cb.record_failure("llm");
        cb.record_failure("llm");
        std::thread::sleep(Duration::from_millis(15));

        assert!(cb.allow_call("llm"));
        cb.record_success("llm");
        assert_eq!(cb.state("llm"), CircuitState::Closed);
        assert!(cb.allow_call("llm"));
    }

    #[test]
    fn test_trial_failure_reopens() {
        let cb = CircuitBreaker::with_settings(2, Duration::from_millis(10));
        cb.record_failure("llm");
        cb.record_failure("llm");
        std::thread::sleep(Duration::from_millis(15));

        assert!(cb.allow_call("llm"));
        cb.record_failure("llm");
        assert_eq!(cb.state("llm"), CircuitState::Open);
        // Cooldown restarted: immediately refused again.
        assert!(!cb.allow_call("llm"));
    }

    #[test]
    fn test_open_never_goes_directly_to_closed() {
        let cb = CircuitBreaker::with_settings(2, Duration::from_millis(10));
        cb.record_failure("llm");
        cb.record_failure("llm");
        assert_eq!(cb.state("llm"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(15));
        // Still not closed until a trial succeeds.
        assert_ne!(cb.state("llm"), CircuitState::Closed);
        assert!(cb.allow_call("llm"));
        assert_eq!(cb.state("llm"), CircuitState::HalfOpen);
        cb.record_success("llm");
        assert_eq!(cb.state("llm"), CircuitState::Closed);
    }

    #[test]
    fn test_abandoned_trial_slot_is_reclaimed() {
        let cb = CircuitBreaker::with_settings(1, Duration::from_millis(10));
        cb.record_failure("llm");
        std::thread::sleep(Duration::from_millis(15));

        // Trial granted, but the caller vanishes without recording anything.
        assert!(cb.allow_call("llm"));
        assert!(!cb.allow_call("llm"));

        // After one more cooldown the slot is reclaimed instead of refusing
        // forever.
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.allow_call("llm"));
        cb.record_success("llm");
        assert_eq!(cb.state("llm"), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_counter() {
        let cb = CircuitBreaker::with_settings(3, Duration::from_secs(60));
        cb.record_failure("llm");
        cb.record_failure("llm");
        cb.record_success("llm");
        cb.record_failure("llm");
        cb.record_failure("llm");
        assert!(cb.allow_call("llm")); // only 2 since last reset
    }

    #[test]
    fn test_independent_providers() {
        let cb = CircuitBreaker::with_settings(2, Duration::from_secs(60));
        cb.record_failure("tool:shell");
        cb.record_failure("tool:shell");
        assert!(!cb.allow_call("tool:shell"));
        assert!(cb.allow_call("tool:papers"));
    }

    #[test]
    fn test_reset_clears_state() {
        let cb = CircuitBreaker::with_settings(1, Duration::from_secs(60));
        cb.record_failure("llm");
        assert!(!cb.allow_call("llm"));
        cb.reset();
        assert!(cb.allow_call("llm"));
    }
}
