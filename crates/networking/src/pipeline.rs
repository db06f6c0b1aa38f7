//! Outbound call pipeline: RateLimiter -> CircuitBreaker -> RetryPolicy -> SessionGuard
//!
//! Every broker and market call goes through [`CallPipeline::call`], which
//! composes the four protections uniformly instead of scattering retry and
//! auth handling across call sites.

use crate::session::SessionGuard;
use neodip_core::errors::{EndpointClass, Error, Result};
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

// ─── RateLimiter ─────────────────────────────────────────────────────

/// One process-global token: every outbound call waits until at least
/// `min_interval` has passed since the previous call, regardless of which
/// task issues it. The sleep happens while the lock is held, which is what
/// serializes the spacing.
pub struct RateLimiter {
    last_call: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_call: Mutex::new(None),
            min_interval,
        }
    }

    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

// ─── CircuitBreaker ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerCell {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl BreakerCell {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Per-endpoint-class fault isolation. Three consecutive counted failures
/// open the circuit; after the cooldown one probe request is let through
/// (half-open) and its outcome decides the next state.
pub struct CircuitBreaker {
    cells: HashMap<EndpointClass, Mutex<BreakerCell>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        let mut cells = HashMap::new();
        for class in [
            EndpointClass::Historical,
            EndpointClass::Fundamentals,
            EndpointClass::Orders,
        ] {
            cells.insert(class, Mutex::new(BreakerCell::new()));
        }
        Self {
            cells,
            failure_threshold,
            cooldown,
        }
    }

    fn cell(&self, class: EndpointClass) -> &Mutex<BreakerCell> {
        self.cells.get(&class).expect("all classes registered")
    }

    /// Gate a request. Fails fast with `CircuitOpen` while cooling down;
    /// past the cooldown the circuit moves to half-open and lets one
    /// request probe the endpoint.
    pub async fn check(&self, class: EndpointClass) -> Result<()> {
        let mut cell = self.cell(class).lock().await;
        match cell.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let opened = cell.opened_at.expect("open circuit has a timestamp");
                if opened.elapsed() >= self.cooldown {
                    debug!("{} circuit half-open, probing", class);
                    cell.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen { endpoint: class })
                }
            }
        }
    }

    pub async fn on_success(&self, class: EndpointClass) {
        let mut cell = self.cell(class).lock().await;
        if cell.state != BreakerState::Closed {
            debug!("{} circuit closed again", class);
        }
        cell.state = BreakerState::Closed;
        cell.consecutive_failures = 0;
        cell.opened_at = None;
    }

    /// Record a counted failure. The caller filters out results that are
    /// answers rather than faults (`InsufficientData`, `NoData`).
    pub async fn on_failure(&self, class: EndpointClass) {
        let mut cell = self.cell(class).lock().await;
        match cell.state {
            BreakerState::HalfOpen => {
                warn!("{} circuit re-opened after failed probe", class);
                cell.state = BreakerState::Open;
                cell.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                cell.consecutive_failures += 1;
                if cell.consecutive_failures >= self.failure_threshold {
                    warn!(
                        "{} circuit opened after {} consecutive failures",
                        class, cell.consecutive_failures
                    );
                    cell.state = BreakerState::Open;
                    cell.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    #[cfg(test)]
    pub async fn state(&self, class: EndpointClass) -> BreakerState {
        self.cell(class).lock().await.state
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

// ─── RetryPolicy ─────────────────────────────────────────────────────

/// Exponential backoff with jitter: base * 2^(attempt-1) * (1 + j), j in [0, 0.25]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before the attempt following `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
        let jitter = rand::thread_rng().gen_range(0.0..=0.25);
        Duration::from_secs_f64(exp * (1.0 + jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

// ─── CallPipeline ────────────────────────────────────────────────────

/// Uniform wrapper for every outbound broker/market operation
pub struct CallPipeline {
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    session: Arc<SessionGuard>,
    attempt_timeout: Duration,
}

impl CallPipeline {
    pub fn new(
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        session: Arc<SessionGuard>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            limiter,
            breaker,
            retry,
            session,
            attempt_timeout,
        }
    }

    /// Run `op` under rate limiting, the endpoint's circuit breaker, the
    /// retry policy, and single-flight auth recovery. Each attempt gets its
    /// own hard timeout.
    pub async fn call<T, F, Fut>(&self, class: EndpointClass, op: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let timeout = self.attempt_timeout;
        let timed_op = || async {
            match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Transient(format!(
                    "call timed out after {:?}",
                    timeout
                ))),
            }
        };

        let mut last_err = None;
        for attempt in 1..=self.retry.max_attempts {
            self.limiter.acquire().await;
            self.breaker.check(class).await?;

            match self.session.with_auth(&timed_op).await {
                Ok(value) => {
                    self.breaker.on_success(class).await;
                    return Ok(value);
                }
                Err(e) => {
                    if e.counts_toward_breaker() {
                        self.breaker.on_failure(class).await;
                    }
                    if e.is_retryable() && attempt < self.retry.max_attempts {
                        let delay = self.retry.delay_after(attempt);
                        debug!(
                            "{} attempt {}/{} failed ({}), retrying in {:?}",
                            class, attempt, self.retry.max_attempts, e, delay
                        );
                        tokio::time::sleep(delay).await;
                        last_err = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Err(last_err.expect("loop exits early unless a retryable error was stored"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BrokerApi, ScripTable, SessionToken};
    use async_trait::async_trait;
    use neodip_core::config::Credentials;
    use neodip_core::models::{BrokerOrder, Holding, OrderAck, OrderRequest, Quote};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    /// Broker stub; the pipeline tests drive failures through `op`, so no
    /// broker method is ever reached.
    struct NullBroker;

    #[async_trait]
    impl BrokerApi for NullBroker {
        async fn login(&self, _c: &Credentials) -> Result<SessionToken> {
            Ok(SessionToken {
                session_id: "s".into(),
                jwt: "j".into(),
                issued_at: chrono::Utc::now(),
            })
        }
        async fn holdings(&self) -> Result<Vec<Holding>> {
            Ok(vec![])
        }
        async fn orders(&self) -> Result<Vec<BrokerOrder>> {
            Ok(vec![])
        }
        async fn order_status(&self, _id: &str) -> Result<BrokerOrder> {
            Err(Error::NoData("none".into()))
        }
        async fn place_order(&self, _r: &OrderRequest) -> Result<OrderAck> {
            Ok(OrderAck {
                order_id: "1".into(),
            })
        }
        async fn modify_order(&self, _id: &str, _p: Option<f64>, _q: Option<u32>) -> Result<OrderAck> {
            Ok(OrderAck {
                order_id: "1".into(),
            })
        }
        async fn cancel_order(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn quote(&self, _s: &str) -> Result<Quote> {
            Ok(Quote {
                ltp: 0.0,
                avg_volume: None,
            })
        }
        async fn limits(&self) -> Result<f64> {
            Ok(0.0)
        }
        async fn scrip_master(&self) -> Result<ScripTable> {
            Ok(ScripTable::new())
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            mobile_number: "m".into(),
            password: "p".into(),
            mpin: "0".into(),
            consumer_key: "k".into(),
        }
    }

    fn pipeline(min_interval: Duration, retry: RetryPolicy) -> (CallPipeline, Arc<CircuitBreaker>) {
        let breaker = Arc::new(CircuitBreaker::default());
        let session = Arc::new(SessionGuard::new(
            Arc::new(NullBroker),
            credentials(),
            Arc::new(RwLock::new(None)),
        ));
        (
            CallPipeline::new(
                Arc::new(RateLimiter::new(min_interval)),
                breaker.clone(),
                retry,
                session,
                Duration::from_secs(10),
            ),
            breaker,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_enforces_min_spacing() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(1)));
        let started = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        // first call free, then two enforced gaps
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spacing_holds_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(1)));
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            let stamps = stamps.clone();
            tasks.push(tokio::spawn(async move {
                limiter.acquire().await;
                stamps.lock().await.push(Instant::now());
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let mut stamps = stamps.lock().await.clone();
        stamps.sort();
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(999));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_after_three_failures_and_recovers() {
        let (pipeline, breaker) = pipeline(Duration::ZERO, RetryPolicy::new(1, Duration::from_millis(1)));
        let class = EndpointClass::Historical;

        for _ in 0..3 {
            let result: Result<()> = pipeline
                .call(class, || async { Err(Error::Transient("boom".into())) })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(class).await, BreakerState::Open);

        // fail fast while cooling down
        let result: Result<()> = pipeline.call(class, || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));

        // past the cooldown the probe succeeds and the circuit closes
        tokio::time::sleep(Duration::from_secs(61)).await;
        let result: Result<()> = pipeline.call(class, || async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(class).await, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_the_circuit() {
        let breaker = CircuitBreaker::default();
        let class = EndpointClass::Orders;
        for _ in 0..3 {
            breaker.on_failure(class).await;
        }
        assert_eq!(breaker.state(class).await, BreakerState::Open);

        tokio::time::sleep(Duration::from_secs(61)).await;
        breaker.check(class).await.unwrap();
        assert_eq!(breaker.state(class).await, BreakerState::HalfOpen);
        breaker.on_failure(class).await;
        assert_eq!(breaker.state(class).await, BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_data_never_trips_the_breaker() {
        let (pipeline, breaker) = pipeline(Duration::ZERO, RetryPolicy::new(1, Duration::from_millis(1)));
        let class = EndpointClass::Historical;

        for _ in 0..5 {
            let result: Result<()> = pipeline
                .call(class, || async {
                    Err(Error::InsufficientData {
                        ticker: "X".into(),
                        got: 50,
                        need: 200,
                    })
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(class).await, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_up_to_budget() {
        let (pipeline, _) = pipeline(Duration::ZERO, RetryPolicy::new(3, Duration::from_millis(10)));
        let calls = Arc::new(AtomicUsize::new(0));
        let op_calls = calls.clone();
        let result: Result<()> = pipeline
            .call(EndpointClass::Orders, move || {
                let op_calls = op_calls.clone();
                async move {
                    op_calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Transient("503".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_rejections_do_not_retry() {
        let (pipeline, _) = pipeline(Duration::ZERO, RetryPolicy::new(3, Duration::from_millis(10)));
        let calls = Arc::new(AtomicUsize::new(0));
        let op_calls = calls.clone();
        let result: Result<()> = pipeline
            .call(EndpointClass::Orders, move || {
                let op_calls = op_calls.clone();
                async move {
                    op_calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::BrokerReject("bad symbol".into()))
                }
            })
            .await;
        assert!(matches!(result, Err(Error::BrokerReject(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_exponentially_with_bounded_jitter() {
        let retry = RetryPolicy::new(3, Duration::from_secs(1));
        for attempt in 1..=3u32 {
            let base = 2f64.powi(attempt as i32 - 1);
            let delay = retry.delay_after(attempt).as_secs_f64();
            assert!(delay >= base && delay <= base * 1.25, "attempt {}: {}", attempt, delay);
        }
    }
}
