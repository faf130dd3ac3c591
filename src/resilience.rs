//! Circuit breaker for flaky external dependencies.
//!
//! Classic three-state breaker: `Closed` counts consecutive failures and
//! trips at a threshold; `Open` rejects calls outright until a cool-down
//! elapses; `HalfOpen` lets probes through and closes again after enough
//! consecutive successes. Wrapped around the LLM client so a provider
//! outage stops burning the per-call timeout on every message.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::llm::{ChatRequest, LlmClient, LlmError};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow; consecutive failures are counted.
    Closed,
    /// Calls are rejected until the cool-down elapses.
    Open,
    /// Probe calls flow; successes close, any failure re-opens.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    open_for: Duration,
    half_open_success_threshold: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Default consecutive failures before tripping.
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    /// Default cool-down before probing again.
    pub const DEFAULT_OPEN_SECS: u64 = 20;
    /// Default probe successes required to close.
    pub const DEFAULT_HALF_OPEN_SUCCESSES: u32 = 2;

    /// Create a breaker with the default thresholds.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_thresholds(
            name,
            Self::DEFAULT_FAILURE_THRESHOLD,
            Duration::from_secs(Self::DEFAULT_OPEN_SECS),
            Self::DEFAULT_HALF_OPEN_SUCCESSES,
        )
    }

    /// Create a breaker with explicit thresholds.
    pub fn with_thresholds(
        name: impl Into<String>,
        failure_threshold: u32,
        open_for: Duration,
        half_open_success_threshold: u32,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            open_for,
            half_open_success_threshold: half_open_success_threshold.max(1),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Current state (the open → half-open transition happens on
    /// [`allow_request`](Self::allow_request), not here).
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Whether a call may proceed right now.
    ///
    /// While open, flips to half-open once the cool-down elapsed.
    pub async fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.open_for);
                if elapsed >= self.open_for {
                    info!(breaker = %self.name, "cool-down elapsed, probing half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes = inner.half_open_successes.saturating_add(1);
                if inner.half_open_successes >= self.half_open_success_threshold {
                    info!(breaker = %self.name, "probes succeeded, closing circuit");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub async fn record_failure(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(breaker = %self.name, reason, "failure threshold reached, opening circuit");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, reason, "probe failed, re-opening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

/// [`LlmClient`] decorator guarded by a [`CircuitBreaker`].
///
/// A rejected call surfaces as [`LlmError::Timeout`]-equivalent
/// unavailability, so callers keep their existing fail-open/closed
/// behavior without knowing about the breaker.
pub struct GuardedLlm {
    inner: Arc<dyn LlmClient>,
    breaker: CircuitBreaker,
}

impl GuardedLlm {
    /// Wrap `inner` with a breaker using default thresholds.
    pub fn new(inner: Arc<dyn LlmClient>) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new("llm"),
        }
    }

    /// Wrap `inner` with an explicit breaker.
    pub fn with_breaker(inner: Arc<dyn LlmClient>, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    /// The breaker, for observation.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl LlmClient for GuardedLlm {
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
        if !self.breaker.allow_request().await {
            return Err(LlmError::Timeout);
        }
        match self.inner.complete(request).await {
            Ok(answer) => {
                self.breaker.record_success().await;
                Ok(answer)
            }
            Err(e) => {
                self.breaker.record_failure(&e.to_string()).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_starts_closed_and_allows() {
        let breaker = CircuitBreaker::new("test");
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(breaker.allow_request().await);
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let breaker =
            CircuitBreaker::with_thresholds("test", 3, Duration::from_secs(20), 1);
        for _ in 0..2 {
            breaker.record_failure("boom").await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
        breaker.record_failure("boom").await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.allow_request().await);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker =
            CircuitBreaker::with_thresholds("test", 2, Duration::from_secs(20), 1);
        breaker.record_failure("boom").await;
        breaker.record_success().await;
        breaker.record_failure("boom").await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown_then_closes() {
        let breaker =
            CircuitBreaker::with_thresholds("test", 1, Duration::from_secs(10), 2);
        breaker.record_failure("boom").await;
        assert!(!breaker.allow_request().await);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.allow_request().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker =
            CircuitBreaker::with_thresholds("test", 1, Duration::from_secs(10), 1);
        breaker.record_failure("boom").await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.allow_request().await);

        breaker.record_failure("still broken").await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.allow_request().await);
    }

    struct FlakyLlm {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl LlmClient for FlakyLlm {
        async fn complete(&self, _request: ChatRequest) -> Result<String, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(LlmError::Api(503))
            } else {
                Ok("ok".to_owned())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_llm_short_circuits_and_recovers() {
        let flaky = Arc::new(FlakyLlm {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let guarded = GuardedLlm::with_breaker(
            Arc::clone(&flaky) as Arc<dyn LlmClient>,
            CircuitBreaker::with_thresholds("llm", 2, Duration::from_secs(10), 1),
        );

        // Two failures trip the breaker.
        for _ in 0..2 {
            assert!(guarded.complete(ChatRequest::new("s", "u")).await.is_err());
        }
        assert_eq!(guarded.breaker().state().await, CircuitState::Open);

        // While open, the inner client is not called at all.
        let calls_before = flaky.calls.load(Ordering::SeqCst);
        assert!(guarded.complete(ChatRequest::new("s", "u")).await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), calls_before);

        // After the cool-down a probe succeeds and the circuit closes.
        tokio::time::advance(Duration::from_secs(11)).await;
        let answer = guarded.complete(ChatRequest::new("s", "u")).await.expect("probe");
        assert_eq!(answer, "ok");
        assert_eq!(guarded.breaker().state().await, CircuitState::Closed);
    }
}
