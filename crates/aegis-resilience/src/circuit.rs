//! C10: Circuit Breaker.
//!
//! Three states per exchange. Closed tracks a plain consecutive-failure
//! count and opens once it crosses `failure_threshold`. Open auto-transitions
//! to HalfOpen once `timeout` has elapsed since it opened. HalfOpen tallies
//! attempts/successes and closes once the success ratio reaches
//! `success_threshold`, but only after at least `min_requests_for_success_rate`
//! samples -- any single half-open failure reopens immediately regardless of
//! how many samples have been seen.

use aegis_common::events::{EventBus, ResilienceEvent};
use aegis_common::model::CircuitState;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
    pub success_threshold: f64,
    pub min_requests_for_success_rate: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 0.5,
            min_requests_for_success_rate: 10,
        }
    }
}

pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    opened_at: RwLock<Option<Instant>>,
    consecutive_failures: AtomicU32,
    half_open_attempts: AtomicU32,
    half_open_successes: AtomicU32,
    config: CircuitBreakerConfig,
    events: Option<(EventBus, String)>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            opened_at: RwLock::new(None),
            consecutive_failures: AtomicU32::new(0),
            half_open_attempts: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            config,
            events: None,
        }
    }

    /// Attaches a labeled event-bus publisher: every state transition after
    /// this call publishes a `ResilienceEvent::Circuit{Opened,HalfOpen,Closed}`
    /// carrying `label`, per the spec's "all transitions invoke
    /// circuit_callback(old, new)".
    pub fn with_events(mut self, events: EventBus, label: impl Into<String>) -> Self {
        self.events = Some((events, label.into()));
        self
    }

    fn publish(&self, build: impl FnOnce(String, chrono::DateTime<Utc>) -> ResilienceEvent) {
        if let Some((events, label)) = &self.events {
            events.publish(build(label.clone(), Utc::now()));
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    /// Whether a call may proceed right now. Open transitions itself to
    /// HalfOpen as a side effect once the timeout has elapsed.
    pub fn can_execute(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .read()
                    .map(|opened| opened.elapsed() >= self.config.timeout)
                    .unwrap_or(false);
                if elapsed {
                    self.transition_to_half_open();
                    true
                } else {
                    false
                }
            }
        }
    }

    fn transition_to_half_open(&self) {
        *self.state.write() = CircuitState::HalfOpen;
        self.half_open_attempts.store(0, Ordering::SeqCst);
        self.half_open_successes.store(0, Ordering::SeqCst);
        self.publish(|circuit, at| ResilienceEvent::CircuitHalfOpen { circuit, at });
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let attempts = self.half_open_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if attempts >= self.config.min_requests_for_success_rate {
                    let ratio = successes as f64 / attempts as f64;
                    if ratio >= self.config.success_threshold {
                        *self.state.write() = CircuitState::Closed;
                        self.consecutive_failures.store(0, Ordering::SeqCst);
                        self.publish(|circuit, at| ResilienceEvent::CircuitClosed { circuit, at });
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.open();
                }
            }
            CircuitState::HalfOpen => {
                self.half_open_attempts.fetch_add(1, Ordering::SeqCst);
                self.open();
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self) {
        *self.state.write() = CircuitState::Open;
        *self.opened_at.write() = Some(Instant::now());
        self.publish(|circuit, at| ResilienceEvent::CircuitOpened { circuit, at });
    }

    pub fn reset(&self) {
        *self.state.write() = CircuitState::Closed;
        *self.opened_at.write() = None;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.half_open_attempts.store(0, Ordering::SeqCst);
        self.half_open_successes.store(0, Ordering::SeqCst);
        self.publish(|circuit, at| ResilienceEvent::CircuitClosed { circuit, at });
    }

    pub fn manually_open(&self) {
        self.open();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            timeout: Duration::from_millis(20),
            success_threshold: 0.5,
            min_requests_for_success_rate: 4,
        })
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let cb = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn single_success_in_closed_state_resets_failure_count() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_single_failure_reopens_regardless_of_sample_size() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_closes_once_ratio_meets_threshold_with_enough_samples() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.can_execute());

        // min_requests_for_success_rate is 4; stay HalfOpen until then.
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // 4th sample: ratio is 4/4 = 1.0 >= 0.5, closes.
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn open_blocks_calls_until_timeout_elapses() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.can_execute());
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.can_execute());
    }
}
