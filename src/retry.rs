//! Retry policy for remote store calls.
//!
//! [`RetryPolicy`] decides whether a failed attempt is retried and how long to
//! wait first. [`RetryingStore`] owns the loop: it wraps an [`ItemStore`] and runs
//! every request through the policy.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;

use crate::codec::Item;
use crate::config::{RetryConfig, RetryMode};
use crate::error::Result;
use crate::transport::{
    ItemStore, Operation, ScanPage, ScanRequest, TransportError, TransportErrorKind,
    UpdateRequest,
};

/// Codes the service uses when it is shedding load
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottledException",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "TransactionInProgressException",
    "RequestLimitExceeded",
    "BandwidthLimitExceeded",
    "LimitExceededException",
    "RequestThrottled",
    "SlowDown",
    "PriorRequestNotComplete",
    "EC2ThrottledException",
];

const TRANSIENT_CODES: &[&str] = &["RequestTimeout", "RequestTimeoutException"];

const TRANSIENT_STATUS: &[u16] = &[500, 502, 503, 504];

/// Weight of the newest outcome in the adaptive failure rate
const FEEDBACK_WEIGHT: f64 = 0.2;

/// Adaptive delays stretch up to `1 + ADAPTIVE_GAIN` times the standard delay
const ADAPTIVE_GAIN: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    NotRetryable,
    AttemptsExhausted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRetryable => f.write_str("not retryable"),
            Self::AttemptsExhausted => f.write_str("attempts exhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Stop(StopReason),
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempt(s), {reason}: {source}")]
    GaveUp {
        attempts: u32,
        reason: StopReason,
        #[source]
        source: TransportError,
    },

    #[error("call deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

/// Failure rate shared by every call issued through one policy
#[derive(Debug, Default)]
struct Feedback {
    failure_rate: Mutex<f64>,
}

impl Feedback {
    fn observe(&self, outcome: f64) {
        let mut rate = self.failure_rate.lock().unwrap_or_else(PoisonError::into_inner);
        *rate = ((1.0 - FEEDBACK_WEIGHT) * *rate + FEEDBACK_WEIGHT * outcome).clamp(0.0, 1.0);
    }

    fn rate(&self) -> f64 {
        *self.failure_rate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Retry decisions for remote calls. Immutable after construction apart from
/// the adaptive failure rate.
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    feedback: Option<Feedback>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Result<Self> {
        config.validate()?;
        let feedback = match config.mode {
            RetryMode::Standard => None,
            RetryMode::Adaptive => Some(Feedback::default()),
        };
        Ok(Self { config, feedback })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn is_retryable(&self, err: &TransportError) -> bool {
        let extra = err
            .code()
            .is_some_and(|code| self.config.retryable_codes.iter().any(|c| c == code));
        extra || base_retryable(err)
    }

    /// Decide what to do after attempt number `attempt` (1-based) failed with `err`
    pub fn decide(&self, attempt: u32, err: &TransportError) -> RetryDecision {
        if !self.is_retryable(err) {
            return RetryDecision::Stop(StopReason::NotRetryable);
        }
        if attempt >= self.config.max_attempts {
            return RetryDecision::Stop(StopReason::AttemptsExhausted);
        }
        RetryDecision::Retry(self.backoff_delay(attempt))
    }

    /// Wait before the retry that follows attempt `attempt`, never above the ceiling
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.config.max_backoff();
        let exponent = attempt.saturating_sub(1);
        let mut delay = self
            .config
            .base_delay()
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(ceiling);

        if self.config.jitter {
            delay = delay.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
        }

        if let Some(feedback) = &self.feedback {
            delay = delay.mul_f64(1.0 + ADAPTIVE_GAIN * feedback.rate());
        }

        delay.min(ceiling)
    }

    pub fn record_success(&self) {
        if let Some(feedback) = &self.feedback {
            feedback.observe(0.0);
        }
    }

    pub fn record_failure(&self, err: &TransportError) {
        if let Some(feedback) = &self.feedback {
            feedback.observe(if is_throttling(err) { 2.0 } else { 1.0 });
        }
    }

    /// Observed failure rate in `[0, 1]`; always zero in standard mode
    pub fn failure_rate(&self) -> f64 {
        self.feedback.as_ref().map_or(0.0, Feedback::rate)
    }

    /// Run `call` until it succeeds or the policy stops it
    pub async fn run<T, F, Fut>(&self, operation: Operation, mut call: F) -> std::result::Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        let attempts = async {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match call().await {
                    Ok(value) => {
                        self.record_success();
                        if attempt > 1 {
                            tracing::debug!(%operation, attempt, "request succeeded after retry");
                        }
                        return Ok(value);
                    }
                    Err(err) => {
                        self.record_failure(&err);
                        match self.decide(attempt, &err) {
                            RetryDecision::Retry(delay) => {
                                tracing::warn!(
                                    %operation,
                                    attempt,
                                    max_attempts = self.config.max_attempts,
                                    delay_ms = delay.as_millis() as u64,
                                    error = %err,
                                    "retrying request"
                                );
                                sleep(delay).await;
                            }
                            RetryDecision::Stop(reason) => {
                                return Err(RetryError::GaveUp {
                                    attempts: attempt,
                                    reason,
                                    source: err,
                                });
                            }
                        }
                    }
                }
            }
        };

        match self.config.call_timeout() {
            Some(limit) => tokio::time::timeout(limit, attempts)
                .await
                .unwrap_or_else(|_| {
                    tracing::warn!(%operation, deadline_ms = limit.as_millis() as u64, "call deadline exceeded");
                    Err(RetryError::DeadlineExceeded(limit))
                }),
            None => attempts.await,
        }
    }
}

fn is_throttling(err: &TransportError) -> bool {
    err.code().is_some_and(|code| THROTTLING_CODES.contains(&code))
}

/// Classification used when the code is not in the configured extra set
fn base_retryable(err: &TransportError) -> bool {
    match err.kind {
        TransportErrorKind::Timeout | TransportErrorKind::Dispatch => true,
        TransportErrorKind::Construction => false,
        TransportErrorKind::Service | TransportErrorKind::Response => {
            is_throttling(err)
                || err.code().is_some_and(|code| TRANSIENT_CODES.contains(&code))
                || err.status.is_some_and(|status| TRANSIENT_STATUS.contains(&status))
        }
    }
}

/// An [`ItemStore`] whose requests go through a shared [`RetryPolicy`]
pub struct RetryingStore<S> {
    inner: S,
    policy: Arc<RetryPolicy>,
}

impl<S: ItemStore> RetryingStore<S> {
    pub fn new(inner: S, policy: Arc<RetryPolicy>) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub async fn put_item(&self, table: &str, item: Item) -> std::result::Result<(), RetryError> {
        let inner = &self.inner;
        self.policy
            .run(Operation::PutItem, move || inner.put_item(table, item.clone()))
            .await
    }

    pub async fn get_item(
        &self,
        table: &str,
        key: Item,
    ) -> std::result::Result<Option<Item>, RetryError> {
        let inner = &self.inner;
        self.policy
            .run(Operation::GetItem, move || inner.get_item(table, key.clone()))
            .await
    }

    pub async fn update_item(
        &self,
        table: &str,
        key: Item,
        update: UpdateRequest,
    ) -> std::result::Result<(), RetryError> {
        let inner = &self.inner;
        self.policy
            .run(Operation::UpdateItem, move || {
                inner.update_item(table, key.clone(), update.clone())
            })
            .await
    }

    pub async fn delete_item(&self, table: &str, key: Item) -> std::result::Result<(), RetryError> {
        let inner = &self.inner;
        self.policy
            .run(Operation::DeleteItem, move || inner.delete_item(table, key.clone()))
            .await
    }

    pub async fn scan(
        &self,
        table: &str,
        request: ScanRequest,
    ) -> std::result::Result<ScanPage, RetryError> {
        let inner = &self.inner;
        self.policy
            .run(Operation::Scan, move || inner.scan(table, request.clone()))
            .await
    }

    pub async fn batch_put(
        &self,
        table: &str,
        items: Vec<Item>,
    ) -> std::result::Result<Vec<Item>, RetryError> {
        let inner = &self.inner;
        self.policy
            .run(Operation::BatchWriteItem, move || {
                inner.batch_put(table, items.clone())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, AttributeValue};
    use crate::transport::MockItemStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(mode: RetryMode) -> RetryConfig {
        RetryConfig {
            mode,
            max_attempts: 4,
            max_backoff_ms: 2_000,
            base_delay_ms: 100,
            jitter: false,
            ..RetryConfig::default()
        }
    }

    fn policy(mode: RetryMode) -> Arc<RetryPolicy> {
        Arc::new(RetryPolicy::new(config(mode)).unwrap())
    }

    fn throttled() -> TransportError {
        TransportError::service("ThrottlingException", Some(400), "rate exceeded")
    }

    fn validation() -> TransportError {
        TransportError::service("ValidationException", Some(400), "bad key")
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let cfg = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert!(RetryPolicy::new(cfg).is_err());
    }

    #[test]
    fn test_classification() {
        let policy = policy(RetryMode::Standard);
        assert!(policy.is_retryable(&throttled()));
        assert!(policy.is_retryable(&TransportError::timeout("slow")));
        assert!(policy.is_retryable(&TransportError::dispatch("refused")));
        assert!(policy.is_retryable(&TransportError::response(Some(503), "unavailable")));
        assert!(policy.is_retryable(&TransportError::service(
            "InternalServerError",
            Some(500),
            "oops"
        )));
        assert!(!policy.is_retryable(&validation()));
        assert!(!policy.is_retryable(&TransportError::construction("bad input")));
        assert!(!policy.is_retryable(&TransportError::service(
            "ConditionalCheckFailedException",
            Some(400),
            "condition"
        )));
    }

    #[test]
    fn test_extra_codes_override_base_judgment() {
        let err = TransportError::service("ItemCollectionSizeLimitExceeded", Some(400), "full");
        assert!(!policy(RetryMode::Standard).is_retryable(&err));

        let mut cfg = config(RetryMode::Standard);
        cfg.retryable_codes.push("ItemCollectionSizeLimitExceeded".into());
        let policy = RetryPolicy::new(cfg).unwrap();
        assert!(policy.is_retryable(&err));
        assert!(matches!(policy.decide(1, &err), RetryDecision::Retry(_)));
    }

    #[test]
    fn test_decide_schedule_and_ceiling() {
        let policy = policy(RetryMode::Standard);
        let err = throttled();
        assert_eq!(policy.decide(1, &err), RetryDecision::Retry(Duration::from_millis(100)));
        assert_eq!(policy.decide(2, &err), RetryDecision::Retry(Duration::from_millis(200)));
        assert_eq!(policy.decide(3, &err), RetryDecision::Retry(Duration::from_millis(400)));
        assert_eq!(
            policy.decide(4, &err),
            RetryDecision::Stop(StopReason::AttemptsExhausted)
        );
        assert_eq!(
            policy.decide(1, &validation()),
            RetryDecision::Stop(StopReason::NotRetryable)
        );
        assert_eq!(policy.backoff_delay(30), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_under_ceiling() {
        let cfg = RetryConfig {
            jitter: true,
            ..config(RetryMode::Adaptive)
        };
        let policy = RetryPolicy::new(cfg).unwrap();
        for _ in 0..20 {
            policy.record_failure(&throttled());
        }
        for attempt in 1..10 {
            assert!(policy.backoff_delay(attempt) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_adaptive_backs_off_harder_under_failures() {
        let standard = policy(RetryMode::Standard);
        let adaptive = policy(RetryMode::Adaptive);
        assert_eq!(adaptive.backoff_delay(1), standard.backoff_delay(1));

        for _ in 0..5 {
            standard.record_failure(&throttled());
            adaptive.record_failure(&throttled());
        }
        assert_eq!(standard.failure_rate(), 0.0);
        assert!(adaptive.failure_rate() > 0.5);
        assert!(adaptive.backoff_delay(1) > standard.backoff_delay(1));

        let after_failures = adaptive.failure_rate();
        for _ in 0..10 {
            adaptive.record_success();
        }
        assert!(adaptive.failure_rate() < after_failures);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = policy(RetryMode::Standard);
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result = policy
            .run(Operation::GetItem, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 2 {
                        Err(throttled())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let ceiling = policy.config().max_backoff() * policy.max_attempts();
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() <= ceiling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_exactly_max_attempts() {
        let policy = policy(RetryMode::Adaptive);
        let calls = AtomicU32::new(0);

        let result: std::result::Result<(), _> = policy
            .run(Operation::PutItem, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(throttled()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(RetryError::GaveUp {
                attempts, reason, ..
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(reason, StopReason::AttemptsExhausted);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let policy = policy(RetryMode::Standard);
        let calls = AtomicU32::new(0);

        let result: std::result::Result<(), _> = policy
            .run(Operation::UpdateItem, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(validation()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(RetryError::GaveUp {
                attempts: 1,
                reason: StopReason::NotRetryable,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retrying() {
        let cfg = RetryConfig {
            max_attempts: 10,
            call_timeout_ms: Some(250),
            ..config(RetryMode::Standard)
        };
        let policy = RetryPolicy::new(cfg).unwrap();
        let calls = AtomicU32::new(0);

        let result: std::result::Result<(), _> = policy
            .run(Operation::Scan, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::timeout("slow")) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::DeadlineExceeded(d)) if d == Duration::from_millis(250)));
        // attempts at t=0, 100ms, 300ms would exceed the deadline before the third
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_store_resends_extra_code_failures() {
        let mut cfg = config(RetryMode::Standard);
        cfg.retryable_codes = vec!["CustomTransientException".to_string()];
        let policy = Arc::new(RetryPolicy::new(cfg).unwrap());

        let calls = Arc::new(AtomicU32::new(0));
        let mut mock = MockItemStore::new();
        let counter = Arc::clone(&calls);
        mock.expect_get_item()
            .times(2)
            .returning(move |_: &str, key: Item| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TransportError::service(
                        "CustomTransientException",
                        Some(400),
                        "try again",
                    ))
                } else {
                    Ok(Some(key))
                }
            });

        let store = RetryingStore::new(mock, policy);
        let item = store.get_item("Users", codec::key("user123")).await.unwrap();
        assert_eq!(
            item.unwrap()[codec::USER_ID],
            AttributeValue::S("user123".into())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
