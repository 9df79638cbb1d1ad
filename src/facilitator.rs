//! Process-boundary abstractions for the external collaborators this
//! core talks to but does not implement: `Facilitator` (on-chain
//! settlement submission), `OwnershipProvider` (NFT ownership lookups),
//! and `AuditTrail` (read-only, consumed by dashboards). The core
//! defines the explicit interface each is expected to satisfy, composed
//! at the process boundary rather than via ad-hoc duck-typed option
//! objects.
//!
//! `FacilitatorClient` wraps whatever `Facilitator` implementation the
//! caller provides with retry-with-backoff-and-jitter and a circuit
//! breaker, so a flaky or down facilitator degrades into fast
//! `FacilitatorTimeout` errors instead of retrying forever — the
//! caller is expected to fall back to the credit-note compensation
//! path (`crate::credit::CreditNoteIssuer`) on that error.

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::{sleep, timeout};

use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct SettlementReceipt {
    pub receipt_id: String,
    pub tx_hash: Option<String>,
}

/// The on-chain settlement facilitator. `direct_submit` is consulted
/// only if `submit` fails, as an optional direct-submit fallback.
#[async_trait]
pub trait Facilitator: Send + Sync {
    async fn submit(&self, authorization: &str, quote_id: &str) -> Result<SettlementReceipt, String>;
    async fn direct_submit(&self, authorization: &str) -> Result<SettlementReceipt, String> {
        let _ = authorization;
        Err("direct submit not supported".to_string())
    }
}

#[async_trait]
pub trait OwnershipProvider: Send + Sync {
    async fn owner_of(&self, collection: &str, token_id: &str) -> Result<String, String>;
}

#[derive(Debug, Clone)]
pub struct AuditFilter {
    pub account_id: Option<String>,
    pub from_sequence: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AuditVerification {
    pub valid: bool,
    pub broken_at: Option<u64>,
}

/// Read-only, consumed by dashboards; not part of this core's write
/// path. Declared here so a dashboard collaborator has a stable
/// interface to implement against without reaching into WAL internals.
#[async_trait]
pub trait AuditTrail: Send + Sync {
    async fn get_records(&self, filter: AuditFilter) -> Result<Vec<serde_json::Value>, String>;
    async fn verify_chain(&self) -> Result<AuditVerification, String>;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);
        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        Duration::from_millis((clamped + jitter).max(0.0) as u64)
    }
}

/// Retries a fallible async operation with exponential backoff and
/// jitter, independent of the circuit breaker above it.
pub async fn retry_async<F, Fut, T>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut last_error = None;
    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt < config.max_retries {
                    sleep(config.delay_for_attempt(attempt)).await;
                }
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| format!("{operation_name} exhausted retries without an error")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

/// Opens after `threshold` consecutive failures so a down facilitator is
/// reached quickly instead of retried into indefinitely. Once
/// `reset_timeout_ms` has elapsed since opening, the next caller is let
/// through as a probe and the breaker moves to `HalfOpen`; a success on
/// that probe closes it, a failure reopens it and restarts the timeout.
pub struct CircuitBreaker {
    state: AtomicU8,
    failures: AtomicU32,
    threshold: u32,
    opened_at_ms: AtomicI64,
    reset_timeout_ms: i64,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            threshold,
            opened_at_ms: AtomicI64::new(0),
            reset_timeout_ms,
            clock,
        }
    }

    /// `Closed`/`HalfOpen` always allow. `Open` allows once
    /// `reset_timeout_ms` has passed since it opened, transitioning the
    /// breaker to `HalfOpen` for the caller that observes the timeout
    /// first.
    pub fn allow(&self) -> bool {
        if self.state.load(Ordering::SeqCst) != CircuitState::Open as u8 {
            return true;
        }
        let elapsed = self.clock.now_ms() - self.opened_at_ms.load(Ordering::SeqCst);
        if elapsed < self.reset_timeout_ms {
            return false;
        }
        self.state
            .compare_exchange(
                CircuitState::Open as u8,
                CircuitState::HalfOpen as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        if self.state.load(Ordering::SeqCst) == CircuitState::HalfOpen as u8 {
            self.opened_at_ms.store(self.clock.now_ms(), Ordering::SeqCst);
            self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
            return;
        }
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold {
            self.opened_at_ms.store(self.clock.now_ms(), Ordering::SeqCst);
            self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
        }
    }
}

pub struct FacilitatorClient {
    inner: Arc<dyn Facilitator>,
    retry: RetryConfig,
    breaker: CircuitBreaker,
    call_timeout: Duration,
}

impl FacilitatorClient {
    pub fn new(
        inner: Arc<dyn Facilitator>,
        retry: RetryConfig,
        breaker_threshold: u32,
        breaker_reset_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self::with_clock(
            inner,
            retry,
            breaker_threshold,
            breaker_reset_timeout,
            call_timeout,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        inner: Arc<dyn Facilitator>,
        retry: RetryConfig,
        breaker_threshold: u32,
        breaker_reset_timeout: Duration,
        call_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            retry,
            breaker: CircuitBreaker::new(breaker_threshold, breaker_reset_timeout.as_millis() as i64, clock),
            call_timeout,
        }
    }

    /// Submits via the facilitator with retry+backoff, falling back to
    /// `direct_submit` if every retry of `submit` fails. A caller-
    /// supplied timeout wraps the whole attempt; exceeding it returns
    /// `FacilitatorTimeout` regardless of which path was in flight,
    /// settlement is treated as failed once this timeout is exceeded.
    pub async fn submit(&self, authorization: &str, quote_id: &str) -> CoreResult<SettlementReceipt> {
        if !self.breaker.allow() {
            return Err(CoreError::FacilitatorTimeout(
                "circuit breaker open, facilitator=skipped".to_string(),
            ));
        }

        let attempt = async {
            let primary = retry_async(&self.retry, "facilitator.submit", || {
                self.inner.submit(authorization, quote_id)
            })
            .await;
            match primary {
                Ok(receipt) => Ok(receipt),
                Err(primary_err) => self
                    .inner
                    .direct_submit(authorization)
                    .await
                    .map_err(|direct_err| format!("facilitator={primary_err} direct={direct_err}")),
            }
        };

        match timeout(self.call_timeout, attempt).await {
            Ok(Ok(receipt)) => {
                self.breaker.record_success();
                Ok(receipt)
            }
            Ok(Err(cause)) => {
                self.breaker.record_failure();
                Err(CoreError::DirectSubmitFailed(cause))
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(CoreError::FacilitatorTimeout(format!(
                    "facilitator={}ms",
                    self.call_timeout.as_millis()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyFacilitator {
        fail_times: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Facilitator for FlakyFacilitator {
        async fn submit(&self, _auth: &str, _quote: &str) -> Result<SettlementReceipt, String> {
            let remaining = self.fail_times.fetch_sub(1, Ordering::SeqCst);
            if remaining > 0 {
                Err("transient".to_string())
            } else {
                Ok(SettlementReceipt {
                    receipt_id: "r1".to_string(),
                    tx_hash: None,
                })
            }
        }
    }

    struct AlwaysDown;

    #[async_trait]
    impl Facilitator for AlwaysDown {
        async fn submit(&self, _auth: &str, _quote: &str) -> Result<SettlementReceipt, String> {
            Err("down".to_string())
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let facilitator = Arc::new(FlakyFacilitator {
            fail_times: std::sync::atomic::AtomicU32::new(2),
        });
        let client = FacilitatorClient::new(
            facilitator,
            RetryConfig {
                max_retries: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
                jitter_factor: 0.0,
            },
            5,
            Duration::from_secs(30),
            Duration::from_secs(1),
        );
        let receipt = client.submit("auth", "q1").await.unwrap();
        assert_eq!(receipt.receipt_id, "r1");
    }

    #[tokio::test]
    async fn circuit_opens_after_repeated_failures() {
        let client = FacilitatorClient::new(
            Arc::new(AlwaysDown),
            RetryConfig {
                max_retries: 0,
                base_delay_ms: 1,
                max_delay_ms: 1,
                jitter_factor: 0.0,
            },
            2,
            Duration::from_secs(30),
            Duration::from_millis(50),
        );
        let _ = client.submit("a", "q").await;
        let _ = client.submit("a", "q").await;
        let third = client.submit("a", "q").await;
        assert!(matches!(third, Err(CoreError::FacilitatorTimeout(_))));
    }

    #[tokio::test]
    async fn half_open_probe_closes_circuit_on_success() {
        let clock = Arc::new(crate::clock::FrozenClock::at(0));
        let client = FacilitatorClient::with_clock(
            Arc::new(FlakyFacilitator {
                fail_times: std::sync::atomic::AtomicU32::new(2),
            }),
            RetryConfig {
                max_retries: 0,
                base_delay_ms: 1,
                max_delay_ms: 1,
                jitter_factor: 0.0,
            },
            2,
            Duration::from_millis(100),
            Duration::from_millis(50),
            clock.clone(),
        );

        // Two consecutive failures trip the breaker open.
        let _ = client.submit("a", "q").await;
        let _ = client.submit("a", "q").await;
        let blocked = client.submit("a", "q").await;
        assert!(matches!(blocked, Err(CoreError::FacilitatorTimeout(_))));

        // Before the reset timeout elapses the breaker still rejects.
        clock.advance(50);
        let still_blocked = client.submit("a", "q").await;
        assert!(matches!(still_blocked, Err(CoreError::FacilitatorTimeout(_))));

        // Past the timeout, the next call probes half-open; the
        // underlying facilitator has exhausted its failures by now and
        // succeeds, closing the circuit.
        clock.advance(100);
        let probe = client.submit("a", "q").await;
        assert!(probe.is_ok());
        assert!(client.breaker.allow());
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_circuit() {
        let clock = Arc::new(crate::clock::FrozenClock::at(0));
        let client = FacilitatorClient::with_clock(
            Arc::new(AlwaysDown),
            RetryConfig {
                max_retries: 0,
                base_delay_ms: 1,
                max_delay_ms: 1,
                jitter_factor: 0.0,
            },
            1,
            Duration::from_millis(100),
            Duration::from_millis(50),
            clock.clone(),
        );

        let _ = client.submit("a", "q").await;
        assert!(!client.breaker.allow());

        clock.advance(150);
        let probe = client.submit("a", "q").await;
        assert!(probe.is_err());
        // The failed probe reopened the circuit and restarted the
        // timeout, so an immediate retry is still rejected.
        assert!(!client.breaker.allow());
    }
}
