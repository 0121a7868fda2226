use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::model::{CircuitBreakerState, CircuitState};

/// Per-provider availability tracker. Closed -> Open after `threshold`
/// consecutive failures; Open -> HalfOpen after `cooldown` elapses and admits
/// a single probe; success restores Closed, failure returns to Open with an
/// extended cooldown.
///
/// Default threshold/cooldown are this crate's own choice: the spec notes
/// the exact numbers are "configurable but ... not stated in the sources
/// beyond 'open after repeated failures'" (open question, resolved in
/// DESIGN.md).
pub struct CircuitBreaker {
    provider: String,
    threshold: u32,
    base_cooldown: chrono::Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    cooldown: chrono::Duration,
    half_open_probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>) -> Self {
        Self::with_params(provider, 10, chrono::Duration::seconds(30))
    }

    pub fn with_params(
        provider: impl Into<String>,
        threshold: u32,
        base_cooldown: chrono::Duration,
    ) -> Self {
        Self {
            provider: provider.into(),
            threshold,
            base_cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                next_retry_at: None,
                cooldown: base_cooldown,
                half_open_probe_in_flight: false,
            }),
        }
    }

    /// Whether a new call may proceed against this provider right now. A
    /// call to an Open breaker whose cooldown has elapsed transitions it to
    /// HalfOpen and admits exactly one probe.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if inner.half_open_probe_in_flight {
                    false
                } else {
                    inner.half_open_probe_in_flight = true;
                    true
                }
            }
            CircuitState::Open => {
                let now = Utc::now();
                if inner.next_retry_at.is_some_and(|t| now >= t) {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.next_retry_at = None;
        inner.cooldown = self.base_cooldown;
        inner.half_open_probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        inner.failure_count += 1;
        inner.last_failure_at = Some(now);
        inner.half_open_probe_in_flight = false;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.cooldown = inner.cooldown * 2;
                inner.next_retry_at = Some(now + inner.cooldown);
            }
            CircuitState::Closed if inner.failure_count >= self.threshold => {
                inner.state = CircuitState::Open;
                inner.next_retry_at = Some(now + inner.cooldown);
            }
            _ => {}
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().state == CircuitState::Open
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.inner.lock().unwrap();
        CircuitBreakerState {
            provider: self.provider.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
            next_retry_at: inner.next_retry_at,
        }
    }
}
