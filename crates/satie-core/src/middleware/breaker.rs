//! Circuit breaker.
//!
//! A CALL wrapper guarding the handler with three defenses:
//!
//! 1. **Probabilistic rejection** before the breaker ever trips, driven by
//!    a two-window rolling estimate of total/succeeded/failed rates:
//!    `rate(x) = prev_x * (W - elapsed) / W + cur_x`.
//! 2. **Tripping**: `rate_failed > max(rate_total * failure_threshold, 1)`
//!    while CLOSED or HALF_OPEN opens the breaker. OPEN decays to
//!    HALF_OPEN after `failure_window` without a further trip, HALF_OPEN
//!    to CLOSED after another quiet window.
//! 3. **Handler timeout**: the wrapped invocation is cancelled after
//!    `handler_timeout` and mapped to 503, counted as a failure.
//!
//! Status >= 400 counts as failure, anything else as success; rejections
//! are not counted. Every pass stamps `x-mercury-sync-overload` so clients
//! can observe breaker pressure.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Env;
use crate::error::ServerError;
use crate::handler::Reply;
use crate::middleware::{Context, Middleware, MiddlewareKind, Next};

pub const OVERLOAD_HEADER: &str = "x-mercury-sync-overload";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

#[derive(Debug)]
struct BreakerCore {
    state: BreakerState,

    failed: f64,
    succeeded: f64,
    total_completed: f64,

    previous_count: f64,
    previous_succeeded: f64,
    previous_failed: f64,

    rate: f64,
    rate_succeeded: f64,
    rate_failed: f64,

    current_time: f64,

    closed_window_start: f64,
    closed_elapsed: f64,

    half_open_window_start: f64,
    half_open_elapsed: f64,
}

impl BreakerCore {
    fn new() -> Self {
        BreakerCore {
            state: BreakerState::Closed,
            failed: 0.0,
            succeeded: 0.0,
            total_completed: 0.0,
            previous_count: 0.0,
            previous_succeeded: 0.0,
            previous_failed: 0.0,
            rate: 0.0,
            rate_succeeded: 0.0,
            rate_failed: 0.0,
            current_time: 0.0,
            closed_window_start: 0.0,
            closed_elapsed: 0.0,
            half_open_window_start: 0.0,
            half_open_elapsed: 0.0,
        }
    }

    /// Roll the two-window counters when the window expires, then refresh
    /// the rate estimates.
    fn refresh_rates(&mut self, now: f64, window: f64) {
        if now - self.current_time > window {
            self.current_time = (now / window).floor() * window;

            self.previous_count = self.total_completed;
            self.previous_succeeded = self.succeeded;
            self.previous_failed = self.failed;

            self.failed = 0.0;
            self.succeeded = 0.0;
            self.total_completed = 0.0;
        }

        let weight = (window - (now - self.current_time)) / window;
        self.rate = self.previous_count * weight + self.total_completed;
        self.rate_succeeded = self.previous_succeeded * weight + self.succeeded;
        self.rate_failed = self.previous_failed * weight + self.failed;
    }

    /// Pre-trip rejection probability from the refreshed rates.
    fn rejection_probability(&mut self, now: f64, window: f64, threshold: f64, sensitivity: f64) -> f64 {
        self.refresh_rates(now, window);

        let success_rate = self.rate_succeeded / (1.0 - threshold);
        let pressure = ((self.rate - success_rate) / (self.rate + 1.0)).max(0.0);
        pressure.powf(1.0 / sensitivity)
    }

    fn trip_breaker(&self, threshold: f64) -> bool {
        let failed_rate_threshold = (self.rate * threshold).max(1.0);
        (self.rate_failed as i64) > (failed_rate_threshold as i64)
    }

    /// Walk the OPEN → HALF_OPEN → CLOSED ladder. Returns `true` while the
    /// breaker is OPEN and the quiet window has not yet elapsed.
    fn advance_state(&mut self, now: f64, window: f64) -> bool {
        let mut force_reject = false;

        if self.state == BreakerState::Open && self.closed_elapsed < window {
            self.closed_elapsed = now - self.closed_window_start;
            force_reject = true;
        } else if self.state == BreakerState::Open {
            self.state = BreakerState::HalfOpen;
            self.half_open_window_start = now;
            self.closed_elapsed = 0.0;
        }

        if self.state == BreakerState::HalfOpen && self.half_open_elapsed < window {
            self.half_open_elapsed = now - self.half_open_window_start;
        } else if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Closed;
            self.half_open_elapsed = 0.0;
        }

        force_reject
    }

    fn record(&mut self, failed: bool) {
        if failed {
            self.failed += 1.0;
        } else {
            self.succeeded += 1.0;
        }
        self.total_completed += 1.0;
    }
}

pub struct CircuitBreaker {
    failure_threshold: f64,
    rejection_sensitivity: f64,
    failure_window: f64,
    handler_timeout: Duration,
    epoch: tokio::time::Instant,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    pub fn new(env: &Env) -> Self {
        CircuitBreaker::with_settings(
            env.circuit_breaker_failure_threshold,
            env.circuit_breaker_failure_window,
            env.handler_timeout,
            env.circuit_breaker_rejection_sensitivity,
        )
    }

    pub fn with_settings(
        failure_threshold: f64,
        failure_window: Duration,
        handler_timeout: Duration,
        rejection_sensitivity: f64,
    ) -> Self {
        CircuitBreaker {
            failure_threshold,
            rejection_sensitivity,
            failure_window: failure_window.as_secs_f64(),
            handler_timeout,
            epoch: tokio::time::Instant::now(),
            core: Mutex::new(BreakerCore::new()),
        }
    }

    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn state(&self) -> BreakerState {
        self.core.lock().unwrap().state
    }
}

#[async_trait]
impl Middleware for CircuitBreaker {
    fn name(&self) -> &str {
        "CircuitBreaker"
    }

    fn kind(&self) -> MiddlewareKind {
        MiddlewareKind::Call
    }

    fn response_headers(&self) -> HashMap<String, String> {
        HashMap::from([(OVERLOAD_HEADER.to_string(), "true".to_string())])
    }

    async fn call(&self, ctx: &mut Context, next: Next<'_>) -> Result<Option<Reply>, ServerError> {
        let now = self.now();
        let mut reject = {
            let mut core = self.core.lock().unwrap();
            let probability = core.rejection_probability(
                now,
                self.failure_window,
                self.failure_threshold,
                self.rejection_sensitivity,
            );
            let rejected = rand::random::<f64>() < probability;
            rejected | core.advance_state(now, self.failure_window)
        };

        let mut reply = None;

        if reject {
            ctx.response_headers
                .insert(OVERLOAD_HEADER.to_string(), "true".to_string());
            ctx.status = Some(503);
            tracing::debug!(path = %ctx.path, "circuit breaker rejected request");
        } else {
            match tokio::time::timeout(self.handler_timeout, next.invoke(ctx)).await {
                Ok(Ok(inner)) => {
                    reply = inner;
                    ctx.response_headers
                        .insert(OVERLOAD_HEADER.to_string(), "false".to_string());
                }
                Ok(Err(err)) => return Err(err),
                Err(_elapsed) => {
                    ctx.response_headers
                        .insert(OVERLOAD_HEADER.to_string(), "true".to_string());
                    ctx.status = Some(503);
                    tracing::debug!(path = %ctx.path, "handler timed out");
                }
            }

            // Rejections are not counted toward the failure stats.
            let failed = ctx.status.is_some_and(|status| status >= 400);
            self.core.lock().unwrap().record(failed);
        }

        {
            let mut core = self.core.lock().unwrap();
            let armed = matches!(core.state, BreakerState::Closed | BreakerState::HalfOpen);
            if armed && core.trip_breaker(self.failure_threshold) {
                core.state = BreakerState::Open;
                core.closed_window_start = self.now();
                core.half_open_elapsed = 0.0;
                reject = true;
                tracing::warn!(path = %ctx.path, "request tripped circuit breaker");
            }
        }

        if reject {
            ctx.errors.push("Err. - request temporarily rejected.".to_string());
        }

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerArgs, HandlerFn};
    use crate::http::{Headers, Method};
    use crate::middleware::{Scheme, run_chain};
    use std::sync::Arc;

    fn test_context() -> Context {
        Context {
            path: "/".to_string(),
            method: Method::Get,
            request_headers: Headers::new(),
            params: HashMap::new(),
            query: String::new(),
            body: Vec::new(),
            args: Some(HandlerArgs::default()),
            ip_address: "127.0.0.1".parse().unwrap(),
            scheme: Scheme::Http,
            local_addr: None,
            upgrade_port: None,
            response_headers: HashMap::new(),
            status: None,
            errors: Vec::new(),
            compressor: None,
            compression_level: None,
        }
    }

    #[test]
    fn test_rates_roll_between_windows() {
        let mut core = BreakerCore::new();
        core.record(false);
        core.record(false);
        core.record(true);

        core.refresh_rates(0.5, 10.0);
        assert_eq!(core.rate, 3.0);
        assert_eq!(core.rate_failed, 1.0);

        // Crossing the window moves current counts into the previous slot.
        core.refresh_rates(11.0, 10.0);
        assert_eq!(core.previous_count, 3.0);
        assert_eq!(core.total_completed, 0.0);
        assert!(core.rate <= 3.0);
    }

    #[test]
    fn test_trip_rule_needs_failures_above_floor() {
        let mut core = BreakerCore::new();
        core.record(true);
        core.refresh_rates(0.1, 10.0);
        // One failure never trips: the threshold floor is 1.
        assert!(!core.trip_breaker(0.2));

        for _ in 0..9 {
            core.record(true);
        }
        core.refresh_rates(0.2, 10.0);
        assert!(core.trip_breaker(0.2));
    }

    #[test]
    fn test_all_success_never_rejects() {
        let mut core = BreakerCore::new();
        for _ in 0..100 {
            core.record(false);
        }
        let probability = core.rejection_probability(1.0, 10.0, 0.2, 2.0);
        assert_eq!(probability, 0.0);
    }

    #[test]
    fn test_state_ladder() {
        let mut core = BreakerCore::new();
        core.state = BreakerState::Open;
        core.closed_window_start = 0.0;

        // Quiet window not yet elapsed: stay OPEN and force rejection.
        assert!(core.advance_state(5.0, 10.0));
        assert_eq!(core.state, BreakerState::Open);

        // Window elapsed: decay to HALF_OPEN.
        assert!(!core.advance_state(11.0, 10.0));
        assert_eq!(core.state, BreakerState::HalfOpen);

        // Another quiet window closes the breaker.
        core.half_open_elapsed = 10.0;
        assert!(!core.advance_state(25.0, 10.0));
        assert_eq!(core.state, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_maps_to_503() {
        let breaker: Arc<dyn Middleware> = Arc::new(CircuitBreaker::with_settings(
            0.2,
            Duration::from_secs(60),
            Duration::from_millis(50),
            2.0,
        ));
        let chain = vec![breaker];
        let handler: HandlerFn = Arc::new(|_args| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Reply::Text("late".to_string()))
            })
        });

        let mut ctx = test_context();
        let reply = run_chain(&chain, &handler, &mut ctx, None).await.unwrap();

        assert!(reply.is_none());
        assert_eq!(ctx.status, Some(503));
        assert_eq!(
            ctx.response_headers.get(OVERLOAD_HEADER).map(String::as_str),
            Some("true")
        );
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_invoking_handler() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let breaker = CircuitBreaker::with_settings(
            0.2,
            Duration::from_secs(60),
            Duration::from_secs(1),
            2.0,
        );
        {
            let mut core = breaker.core.lock().unwrap();
            core.state = BreakerState::Open;
            core.closed_window_start = breaker.now();
        }

        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let handler: HandlerFn = Arc::new(move |_args| {
            let flag = flag.clone();
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(Reply::Empty)
            })
        });

        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(breaker)];
        let mut ctx = test_context();
        let reply = run_chain(&chain, &handler, &mut ctx, None).await.unwrap();

        assert!(reply.is_none());
        assert!(!invoked.load(Ordering::SeqCst), "handler must not run while OPEN");
        assert_eq!(ctx.status, Some(503));
        assert_eq!(ctx.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_successful_pass_clears_overload_header() {
        let breaker: Arc<dyn Middleware> = Arc::new(CircuitBreaker::with_settings(
            0.2,
            Duration::from_secs(60),
            Duration::from_secs(1),
            2.0,
        ));
        let chain = vec![breaker];
        let handler: HandlerFn =
            Arc::new(|_args| Box::pin(async { Ok(Reply::Text("ok".to_string())) }));

        let mut ctx = test_context();
        let reply = run_chain(&chain, &handler, &mut ctx, None).await.unwrap();

        assert!(matches!(reply, Some(Reply::Text(text)) if text == "ok"));
        assert!(ctx.errors.is_empty());
        assert_eq!(
            ctx.response_headers.get(OVERLOAD_HEADER).map(String::as_str),
            Some("false")
        );
    }
}
