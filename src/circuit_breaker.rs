//! Per-target circuit breakers.
//!
//! Each delivery target gets its own breaker so a failing speech engine
//! cannot slow down notifications. Only retryable failures count toward
//! tripping: a malformed record says nothing about the target's health.
//!
//! # States
//!
//! - **Closed**: calls pass through
//! - **Open**: calls are rejected with [`FanoutError::CircuitOpen`], which
//!   is retryable, so the record is redelivered later
//! - **HalfOpen**: a few trial calls decide whether to close again
//!
//! # Usage
//!
//! ```rust,no_run
//! # use insight_fanout::circuit_breaker::{CircuitBreaker, CircuitConfig};
//! # async fn example() -> insight_fanout::error::Result<()> {
//! let circuit = CircuitBreaker::new("tts", CircuitConfig::default());
//! let n = circuit.call(|| async { Ok(42) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::DeliveryConfig;
use crate::error::{FanoutError, Result};
use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive retryable failures that trip the circuit.
    pub failure_threshold: u32,
    /// Probe calls evaluated while half-open.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    pub fn from_delivery(config: &DeliveryConfig) -> Self {
        Self {
            failure_threshold: config.circuit_failure_threshold.max(1),
            success_threshold: 2,
            recovery_timeout: config.circuit_reset_duration(),
        }
    }

    /// Fast recovery for testing.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    /// Set by a rejection, cleared by the next successful call.
    open: AtomicBool,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("calls_total", &self.calls_total())
            .field("rejections", &self.rejections())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        // recloser only evaluates the rate once its ring buffer of
        // `closed_len` calls is full, so a rate just under 1.0 turns the
        // threshold into "the last N calls all failed". The named presets
        // trip on a fraction of a larger window instead.
        let recloser = Recloser::custom()
            .error_rate(0.99)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        let name = name.into();
        metrics::set_circuit_state(&name, &CircuitState::Closed.to_string());

        Self {
            name,
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            open: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// A rejected call surfaces as [`FanoutError::CircuitOpen`]. Errors from
    /// the operation are returned unchanged; only retryable ones are counted
    /// against the circuit.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let trips = |e: &FanoutError| e.is_retryable();
        match self.inner.call_with(trips, f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                if self.open.swap(false, Ordering::Relaxed) {
                    info!(circuit = %self.name, "Circuit breaker closed");
                    metrics::set_circuit_state(&self.name, &CircuitState::Closed.to_string());
                }
                metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                self.open.store(true, Ordering::Relaxed);
                metrics::record_circuit_rejection(&self.name);
                metrics::set_circuit_state(&self.name, &CircuitState::Open.to_string());
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(FanoutError::CircuitOpen {
                    target: self.name.clone(),
                })
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, error = %e, "Circuit call failed");
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Calls where the operation itself returned an error.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Calls rejected without running (circuit open).
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// True from the last rejection until a call succeeds again.
    #[must_use]
    pub fn is_likely_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn down() -> FanoutError {
        FanoutError::transient("speech", "503")
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("tts", CircuitConfig::test());

        let result = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
    }

    #[tokio::test]
    async fn test_inner_error_is_returned_unchanged() {
        let cb = CircuitBreaker::new("tts", CircuitConfig::test());

        let result: Result<()> = cb
            .call(|| async { Err(FanoutError::validation("summary", "missing")) })
            .await;

        assert!(matches!(result, Err(FanoutError::Validation { .. })));
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_retryable_failures() {
        let config = CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("tts", config);

        let mut rejected = false;
        for _ in 0..5 {
            let result: Result<()> = cb.call(|| async { Err(down()) }).await;
            if let Err(FanoutError::CircuitOpen { target }) = result {
                assert_eq!(target, "tts");
                rejected = true;
            }
        }

        assert!(rejected);
        assert!(cb.rejections() >= 1);
        assert!(cb.is_likely_open());
    }

    #[tokio::test]
    async fn test_rejection_is_retryable() {
        let err = FanoutError::CircuitOpen {
            target: "tts".into(),
        };
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_permanent_failures_do_not_trip() {
        let config = CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("tts", config);

        for _ in 0..10 {
            let _: Result<()> = cb
                .call(|| async { Err(FanoutError::validation("summary", "blank")) })
                .await;
        }

        assert_eq!(cb.rejections(), 0);
        assert_eq!(cb.failures(), 10);
    }

    #[tokio::test]
    async fn test_circuit_recovers_after_timeout() {
        let cb = CircuitBreaker::new("tts", CircuitConfig::test());

        for _ in 0..4 {
            let _: Result<()> = cb.call(|| async { Err(down()) }).await;
        }
        assert!(cb.is_likely_open());
        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = cb.call(|| async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);
        assert!(!cb.is_likely_open());
    }

    #[test]
    fn test_from_delivery_config() {
        let delivery = DeliveryConfig::default();
        let config = CircuitConfig::from_delivery(&delivery);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(CircuitState::Open.to_string(), "open");
    }
}
