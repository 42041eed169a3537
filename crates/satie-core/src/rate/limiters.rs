//! Admission-control algorithms.
//!
//! Every limiter exposes the same contract: `acquire()` returns `true` when
//! the request is rejected. Limiters whose `Limit` disables rejection sleep
//! until capacity frees up instead of rejecting, which makes `acquire` a
//! legitimate suspension point.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::LimiterKind;
use crate::rate::Limit;

pub enum RateLimiter {
    SlidingWindow(SlidingWindowLimiter),
    TokenBucket(TokenBucketLimiter),
    LeakyBucket(LeakyBucketLimiter),
    Adaptive(AdaptiveLimiter),
    RateAdaptive(RateAdaptiveLimiter),
    CpuAdaptive(CpuAdaptiveLimiter),
}

impl RateLimiter {
    pub fn new(kind: LimiterKind, limit: &Limit) -> Self {
        match kind {
            LimiterKind::SlidingWindow => RateLimiter::SlidingWindow(SlidingWindowLimiter::new(limit)),
            LimiterKind::TokenBucket => RateLimiter::TokenBucket(TokenBucketLimiter::new(limit)),
            LimiterKind::LeakyBucket => RateLimiter::LeakyBucket(LeakyBucketLimiter::new(limit)),
            LimiterKind::Adaptive => RateLimiter::Adaptive(AdaptiveLimiter::new(limit)),
            LimiterKind::RateAdaptive => RateLimiter::RateAdaptive(RateAdaptiveLimiter::new(limit)),
            LimiterKind::CpuAdaptive => RateLimiter::CpuAdaptive(CpuAdaptiveLimiter::new(limit)),
        }
    }

    /// Admit or reject one request. Returns `true` on rejection.
    pub async fn acquire(&self) -> bool {
        match self {
            RateLimiter::SlidingWindow(limiter) => limiter.acquire().await,
            RateLimiter::TokenBucket(limiter) => limiter.acquire().await,
            RateLimiter::LeakyBucket(limiter) => limiter.acquire().await,
            RateLimiter::Adaptive(limiter) => limiter.acquire().await,
            RateLimiter::RateAdaptive(limiter) => limiter.acquire().await,
            RateLimiter::CpuAdaptive(limiter) => limiter.acquire().await,
        }
    }
}

fn prune(hits: &mut VecDeque<Instant>, now: Instant, period: Duration) {
    while let Some(front) = hits.front() {
        if now.duration_since(*front) >= period {
            hits.pop_front();
        } else {
            break;
        }
    }
}

/// Rolling count over `period`; reject when the count reaches `max_requests`.
pub struct SlidingWindowLimiter {
    max_requests: u64,
    period: Duration,
    reject_requests: bool,
    hits: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: &Limit) -> Self {
        SlidingWindowLimiter {
            max_requests: limit.max_requests,
            period: limit.request_period,
            reject_requests: limit.reject_requests,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn acquire(&self) -> bool {
        loop {
            let wait = {
                let now = Instant::now();
                let mut hits = self.hits.lock().unwrap();
                prune(&mut hits, now, self.period);

                if (hits.len() as u64) < self.max_requests {
                    hits.push_back(now);
                    return false;
                }
                if self.reject_requests {
                    return true;
                }
                // Wait for the oldest hit to slide out, then retry.
                hits.front()
                    .map(|front| self.period.saturating_sub(now.duration_since(*front)))
                    .unwrap_or(self.period)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Bucket of `max_requests` tokens refilled at `max_requests / period`.
pub struct TokenBucketLimiter {
    capacity: f64,
    refill_per_sec: f64,
    reject_requests: bool,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucketLimiter {
    pub fn new(limit: &Limit) -> Self {
        let capacity = limit.max_requests as f64;
        TokenBucketLimiter {
            capacity,
            refill_per_sec: capacity / limit.request_period.as_secs_f64().max(f64::EPSILON),
            reject_requests: limit.reject_requests,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) -> bool {
        loop {
            let wait = {
                let now = Instant::now();
                let mut state = self.state.lock().unwrap();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return false;
                }
                if self.reject_requests {
                    return true;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Bounded queue draining at a fixed rate; reject on overflow.
pub struct LeakyBucketLimiter {
    capacity: f64,
    drain_per_sec: f64,
    reject_requests: bool,
    state: Mutex<LevelState>,
}

struct LevelState {
    level: f64,
    last_drain: Instant,
}

impl LeakyBucketLimiter {
    pub fn new(limit: &Limit) -> Self {
        let capacity = limit.max_requests as f64;
        LeakyBucketLimiter {
            capacity,
            drain_per_sec: capacity / limit.request_period.as_secs_f64().max(f64::EPSILON),
            reject_requests: limit.reject_requests,
            state: Mutex::new(LevelState {
                level: 0.0,
                last_drain: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) -> bool {
        loop {
            let wait = {
                let now = Instant::now();
                let mut state = self.state.lock().unwrap();
                let elapsed = now.duration_since(state.last_drain).as_secs_f64();
                state.level = (state.level - elapsed * self.drain_per_sec).max(0.0);
                state.last_drain = now;

                if state.level + 1.0 <= self.capacity {
                    state.level += 1.0;
                    return false;
                }
                if self.reject_requests {
                    return true;
                }
                Duration::from_secs_f64(1.0 / self.drain_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Sliding window whose effective limit adapts to observed pressure: every
/// rejection shrinks the limit toward `min_requests` and backs off for
/// `request_backoff`; accepted traffic regrows it toward `max_requests`.
pub struct AdaptiveLimiter {
    max_requests: f64,
    min_requests: f64,
    period: Duration,
    backoff: Duration,
    state: Mutex<AdaptiveState>,
}

struct AdaptiveState {
    hits: VecDeque<Instant>,
    current_limit: f64,
}

impl AdaptiveLimiter {
    pub fn new(limit: &Limit) -> Self {
        AdaptiveLimiter {
            max_requests: limit.max_requests as f64,
            min_requests: (limit.min_requests.max(1)) as f64,
            period: limit.request_period,
            backoff: limit.request_backoff,
            state: Mutex::new(AdaptiveState {
                hits: VecDeque::new(),
                current_limit: limit.max_requests as f64,
            }),
        }
    }

    pub async fn acquire(&self) -> bool {
        let rejected = {
            let now = Instant::now();
            let mut state = self.state.lock().unwrap();
            prune(&mut state.hits, now, self.period);

            if (state.hits.len() as f64) < state.current_limit {
                state.hits.push_back(now);
                state.current_limit =
                    (state.current_limit + (self.max_requests - state.current_limit) * 0.1)
                        .min(self.max_requests);
                false
            } else {
                state.current_limit = (state.current_limit * 0.9).max(self.min_requests);
                true
            }
        };

        if rejected {
            tokio::time::sleep(self.backoff).await;
        }
        rejected
    }
}

/// Adaptive limiter keyed on the measured request rate: an exponentially
/// weighted arrival-rate estimate scales the effective limit down whenever
/// the observed rate exceeds the configured quota.
pub struct RateAdaptiveLimiter {
    max_requests: f64,
    min_requests: f64,
    target_rate: f64,
    period: Duration,
    backoff: Duration,
    state: Mutex<RateState>,
}

struct RateState {
    hits: VecDeque<Instant>,
    ewma_rate: f64,
    last_arrival: Option<Instant>,
}

impl RateAdaptiveLimiter {
    pub fn new(limit: &Limit) -> Self {
        let max_requests = limit.max_requests as f64;
        RateAdaptiveLimiter {
            max_requests,
            min_requests: (limit.min_requests.max(1)) as f64,
            target_rate: max_requests / limit.request_period.as_secs_f64().max(f64::EPSILON),
            period: limit.request_period,
            backoff: limit.request_backoff,
            state: Mutex::new(RateState {
                hits: VecDeque::new(),
                ewma_rate: 0.0,
                last_arrival: None,
            }),
        }
    }

    pub async fn acquire(&self) -> bool {
        let rejected = {
            let now = Instant::now();
            let mut state = self.state.lock().unwrap();

            if let Some(last) = state.last_arrival {
                let gap = now.duration_since(last).as_secs_f64().max(1e-6);
                state.ewma_rate = 0.2 * (1.0 / gap) + 0.8 * state.ewma_rate;
            }
            state.last_arrival = Some(now);

            let effective = if state.ewma_rate > self.target_rate {
                (self.max_requests * self.target_rate / state.ewma_rate).max(self.min_requests)
            } else {
                self.max_requests
            };

            prune(&mut state.hits, now, self.period);
            if (state.hits.len() as f64) < effective {
                state.hits.push_back(now);
                false
            } else {
                true
            }
        };

        if rejected {
            tokio::time::sleep(self.backoff).await;
        }
        rejected
    }
}

/// Sliding window whose effective limit scales inversely with process CPU
/// once usage crosses `cpu_limit`.
pub struct CpuAdaptiveLimiter {
    max_requests: f64,
    min_requests: f64,
    cpu_limit: f64,
    period: Duration,
    reject_requests: bool,
    hits: Mutex<VecDeque<Instant>>,
    sampler: Mutex<CpuSampler>,
}

struct CpuSampler {
    system: sysinfo::System,
    last_sample: Option<Instant>,
    last_usage: f64,
}

impl CpuSampler {
    /// Refresh at most every 250ms; sysinfo needs two samples spaced apart
    /// before `cpu_usage` is meaningful, so the first reads return 0.
    fn sample(&mut self) -> f64 {
        let now = Instant::now();
        let stale = self
            .last_sample
            .map(|at| now.duration_since(at) >= Duration::from_millis(250))
            .unwrap_or(true);

        if stale {
            let pid = sysinfo::Pid::from_u32(std::process::id());
            self.system.refresh_process(pid);
            if let Some(process) = self.system.process(pid) {
                self.last_usage = f64::from(process.cpu_usage());
            }
            self.last_sample = Some(now);
        }

        self.last_usage
    }
}

impl CpuAdaptiveLimiter {
    pub fn new(limit: &Limit) -> Self {
        CpuAdaptiveLimiter {
            max_requests: limit.max_requests as f64,
            min_requests: (limit.min_requests.max(1)) as f64,
            cpu_limit: limit.cpu_limit.unwrap_or(50.0),
            period: limit.request_period,
            reject_requests: limit.reject_requests,
            hits: Mutex::new(VecDeque::new()),
            sampler: Mutex::new(CpuSampler {
                system: sysinfo::System::new(),
                last_sample: None,
                last_usage: 0.0,
            }),
        }
    }

    pub async fn acquire(&self) -> bool {
        let usage = self.sampler.lock().unwrap().sample();
        let effective = if usage > self.cpu_limit {
            (self.max_requests * self.cpu_limit / usage).max(self.min_requests)
        } else {
            self.max_requests
        };

        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap();
        prune(&mut hits, now, self.period);

        if (hits.len() as f64) < effective {
            hits.push_back(now);
            false
        } else {
            self.reject_requests
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(max_requests: u64, period: Duration) -> Limit {
        Limit {
            max_requests,
            request_period: period,
            ..Limit::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_rejects_then_recovers() {
        let limiter = SlidingWindowLimiter::new(&limit(1, Duration::from_secs(1)));
        assert!(!limiter.acquire().await);
        assert!(limiter.acquire().await);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!limiter.acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refills() {
        let limiter = TokenBucketLimiter::new(&limit(2, Duration::from_secs(2)));
        assert!(!limiter.acquire().await);
        assert!(!limiter.acquire().await);
        assert!(limiter.acquire().await);

        // One token accrues per second.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!limiter.acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaky_bucket_overflow() {
        let limiter = LeakyBucketLimiter::new(&limit(2, Duration::from_secs(2)));
        assert!(!limiter.acquire().await);
        assert!(!limiter.acquire().await);
        assert!(limiter.acquire().await);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!limiter.acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_shrinks_limit_on_rejection() {
        let mut config = limit(10, Duration::from_secs(10));
        config.min_requests = 2;
        config.request_backoff = Duration::from_millis(10);
        let limiter = AdaptiveLimiter::new(&config);

        for _ in 0..10 {
            assert!(!limiter.acquire().await);
        }
        assert!(limiter.acquire().await);
        assert!(limiter.state.lock().unwrap().current_limit < 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_adaptive_admits_slow_traffic() {
        let mut config = limit(5, Duration::from_secs(1));
        config.request_backoff = Duration::from_millis(10);
        let limiter = RateAdaptiveLimiter::new(&config);

        for _ in 0..3 {
            assert!(!limiter.acquire().await);
            tokio::time::advance(Duration::from_secs(1)).await;
        }
    }
}
