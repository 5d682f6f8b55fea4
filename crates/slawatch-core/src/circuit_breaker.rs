//! Circuit breaker guarding the alert sink.
//!
//! Closed until `failure_threshold` consecutive failures, then open for
//! `open_cooldown`; the first call after the cooldown runs as a half-open
//! probe and `success_threshold` probe successes close it again.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes required to close from half-open.
    pub success_threshold: u32,
    /// Cooldown duration while the circuit is open.
    pub open_cooldown: Duration,
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn new(failure_threshold: u32, success_threshold: u32, open_cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            open_cooldown,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { successes: u32 },
}

/// Public-facing circuit state for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of circuit breaker status for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_cooldown_ms: u64,
    pub open_for_ms: Option<u64>,
    pub cooldown_remaining_ms: Option<u64>,
    pub half_open_successes: Option<u32>,
}

/// Circuit breaker state machine.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    #[must_use]
    pub fn with_name(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether an operation is allowed to proceed.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and
    /// allows the call through as a probe.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen { .. } => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.open_cooldown {
                    self.state = CircuitState::HalfOpen { successes: 0 };
                    info!(circuit = %self.name, "Circuit transitioned to half-open after cooldown");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Milliseconds until an open circuit admits a probe; zero otherwise.
    #[must_use]
    pub fn retry_after_ms(&self) -> u64 {
        match self.state {
            CircuitState::Open { opened_at } => self
                .config
                .open_cooldown
                .saturating_sub(opened_at.elapsed())
                .as_millis() as u64,
            _ => 0,
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.config.success_threshold {
                    self.consecutive_failures = 0;
                    self.state = CircuitState::Closed;
                    info!(circuit = %self.name, "Circuit closed after successful probe");
                } else {
                    self.state = CircuitState::HalfOpen { successes };
                }
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    warn!(
                        circuit = %self.name,
                        failures = self.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit opened after consecutive failures"
                    );
                    metrics::counter!("alerts.circuit_opened", "circuit" => self.name.clone())
                        .increment(1);
                }
            }
            CircuitState::HalfOpen { .. } => {
                self.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                warn!(circuit = %self.name, "Circuit re-opened after half-open failure");
                metrics::counter!("alerts.circuit_opened", "circuit" => self.name.clone())
                    .increment(1);
            }
            CircuitState::Open { .. } => {}
        }
    }

    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        let (state, open_for_ms, cooldown_remaining_ms, half_open_successes) = match self.state {
            CircuitState::Closed => (CircuitStateKind::Closed, None, None, None),
            CircuitState::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                (
                    CircuitStateKind::Open,
                    Some(elapsed.as_millis() as u64),
                    self.config
                        .open_cooldown
                        .checked_sub(elapsed)
                        .map(|d| d.as_millis() as u64),
                    None,
                )
            }
            CircuitState::HalfOpen { successes } => {
                (CircuitStateKind::HalfOpen, None, None, Some(successes))
            }
        };
        CircuitBreakerStatus {
            name: self.name.clone(),
            state,
            consecutive_failures: self.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            open_cooldown_ms: self.config.open_cooldown.as_millis() as u64,
            open_for_ms,
            cooldown_remaining_ms,
            half_open_successes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, successes: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::with_name(
            "alert_sink",
            CircuitBreakerConfig::new(failures, successes, cooldown),
        )
    }

    #[test]
    fn circuit_opens_after_threshold() {
        let mut breaker = breaker(2, 1, Duration::from_secs(10));

        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.status().state, CircuitStateKind::Closed);

        breaker.record_failure();
        let status = breaker.status();
        assert_eq!(status.state, CircuitStateKind::Open);
        assert!(status.cooldown_remaining_ms.is_some());
        assert!(!breaker.allow());
        assert!(breaker.retry_after_ms() > 0);
    }

    #[test]
    fn half_open_closes_on_success() {
        let mut breaker = breaker(1, 1, Duration::ZERO);
        breaker.record_failure();
        // Zero cooldown: the next allow() is the probe.
        assert!(breaker.allow());
        assert_eq!(breaker.status().state, CircuitStateKind::HalfOpen);

        breaker.record_success();
        let status = breaker.status();
        assert_eq!(status.state, CircuitStateKind::Closed);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut breaker = breaker(1, 2, Duration::ZERO);
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.status().half_open_successes, Some(1));

        breaker.record_failure();
        assert_eq!(breaker.status().state, CircuitStateKind::Open);
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut breaker = breaker(3, 1, Duration::from_secs(10));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.status().state, CircuitStateKind::Closed);
        assert_eq!(breaker.status().consecutive_failures, 1);
    }

    #[test]
    fn thresholds_are_clamped_to_one() {
        let config = CircuitBreakerConfig::new(0, 0, Duration::ZERO);
        assert_eq!(config.failure_threshold, 1);
        assert_eq!(config.success_threshold, 1);
    }
}
