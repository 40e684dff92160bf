//! Circuit breaker guarding the graph store.
//!
//! # States
//! - **Closed**: normal operation, requests pass through
//! - **Open**: the store is failing, requests are rejected immediately
//! - **HalfOpen**: probing recovery after the cooldown, admitting at most
//!   `half_open_max_calls` trial calls per cooldown-long window
//!
//! One breaker is shared (behind an `Arc`) by every caller in the process.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::{MemoryError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Trial calls admitted in the current half-open window
    half_open_calls: u32,
    /// First failure of the current streak
    streak_started: Option<Instant>,
    last_state_change: Instant,
}

/// Snapshot for health reporting
#[derive(Debug, Clone)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_rejections: u64,
    pub time_in_current_state: Duration,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    total_calls: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_calls: 0,
                streak_started: None,
                last_state_change: Instant::now(),
            }),
            total_calls: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Admit a call, or fail fast with `CircuitOpen` while the cooldown runs
    pub fn check(&self) -> Result<()> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if state.half_open_calls < self.config.half_open_max_calls {
                    state.half_open_calls += 1;
                    return Ok(());
                }
                // Trials that never reported back must not wedge the breaker
                let elapsed = state.last_state_change.elapsed();
                if elapsed >= self.config.open_duration {
                    state.half_open_calls = 1;
                    state.last_state_change = Instant::now();
                    Ok(())
                } else {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    Err(MemoryError::CircuitOpen {
                        retry_in: self.config.open_duration - elapsed,
                    })
                }
            }
            CircuitState::Open => {
                let elapsed = state.last_state_change.elapsed();
                if elapsed >= self.config.open_duration {
                    info!(
                        "Circuit breaker transitioning from Open to HalfOpen after {:?}",
                        self.config.open_duration
                    );
                    state.state = CircuitState::HalfOpen;
                    state.consecutive_successes = 0;
                    state.half_open_calls = 1;
                    state.last_state_change = Instant::now();
                    Ok(())
                } else {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    Err(MemoryError::CircuitOpen {
                        retry_in: self.config.open_duration - elapsed,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.streak_started = None;
        state.consecutive_successes = state.consecutive_successes.saturating_add(1);

        if state.state == CircuitState::HalfOpen
            && state.consecutive_successes >= self.config.success_threshold
        {
            info!(
                "Circuit breaker closing after {} consecutive successes",
                state.consecutive_successes
            );
            state.state = CircuitState::Closed;
            state.last_state_change = Instant::now();
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.consecutive_successes = 0;

        // A streak that started outside the window no longer counts
        match state.streak_started {
            Some(started) if now.duration_since(started) <= self.config.failure_window => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            }
            _ => {
                state.streak_started = Some(now);
                state.consecutive_failures = 1;
            }
        }

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker opening after {} consecutive failures",
                        state.consecutive_failures
                    );
                    state.state = CircuitState::Open;
                    state.last_state_change = now;
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker trial call failed, reopening");
                state.state = CircuitState::Open;
                state.last_state_change = now;
            }
            CircuitState::Open => {}
        }
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let state = self.state.lock();
        BreakerMetrics {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            time_in_current_state: state.last_state_change.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(open_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            failure_window: Duration::from_secs(60),
            open_duration: Duration::from_millis(open_ms),
            half_open_max_calls: 3,
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(config(10_000));
        for _ in 0..2 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        match breaker.check() {
            Err(MemoryError::CircuitOpen { retry_in }) => {
                assert!(retry_in <= Duration::from_secs(10));
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
        assert_eq!(breaker.metrics().total_rejections, 1);
    }

    #[test]
    fn test_success_resets_streak() {
        let breaker = CircuitBreaker::new(config(10_000));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failures_outside_window_do_not_accumulate() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_window: Duration::from_millis(0),
            ..config(10_000)
        });
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(2));
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let breaker = CircuitBreaker::new(config(20));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(breaker.check().is_err());

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let breaker = CircuitBreaker::new(config(20));
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.check().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.check(), Err(MemoryError::CircuitOpen { .. })));
    }

    #[test]
    fn test_half_open_admits_limited_trials() {
        let breaker = CircuitBreaker::new(config(50));
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));

        let admitted = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4).map(|_| scope.spawn(|| breaker.check().is_ok())).collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(false))
                .filter(|ok| *ok)
                .count()
        });
        assert_eq!(admitted, 3);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.metrics().total_rejections, 1);

        // Unreported trials free up once a full cooldown has passed
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn test_counters_saturate() {
        let breaker = CircuitBreaker::new(config(10_000));
        breaker.state.lock().consecutive_successes = u32::MAX;
        breaker.record_success();
        assert_eq!(breaker.metrics().consecutive_successes, u32::MAX);

        {
            let mut state = breaker.state.lock();
            state.consecutive_failures = u32::MAX;
            state.streak_started = Some(Instant::now());
            state.state = CircuitState::Open;
        }
        breaker.record_failure();
        assert_eq!(breaker.metrics().consecutive_failures, u32::MAX);
    }
}
