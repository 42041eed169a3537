//! Strategy-keyed rate limiting.
//!
//! The [`Limiter`] facade derives a limit key per request according to the
//! configured strategy, lazily creates the backing limiter for that key, and
//! delegates the accept/reject decision to it. Per-route [`Limit`]
//! descriptors override the process-wide defaults.

pub mod limiters;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::{Env, LimiterKind, RateLimitStrategy};
use crate::http::Method;

pub use limiters::RateLimiter;

pub type LimitKeyFn = Arc<dyn Fn(&str, Method, IpAddr) -> String + Send + Sync>;
pub type LimitRule = Arc<dyn Fn(&str, Method, IpAddr) -> bool + Send + Sync>;

/// Per-route rate-limit descriptor.
#[derive(Clone)]
pub struct Limit {
    pub max_requests: u64,
    pub min_requests: u64,
    pub request_period: Duration,
    pub reject_requests: bool,
    pub request_backoff: Duration,
    pub cpu_limit: Option<f64>,
    pub memory_limit_mb: Option<f64>,
    /// Overrides the process-wide limiter algorithm when set.
    pub limiter_type: Option<LimiterKind>,
    /// Custom key derivation for the `custom` strategy.
    pub key_fn: Option<LimitKeyFn>,
    /// Match rules; a request only counts against this limit when the last
    /// rule returns true. No rules means every request matches.
    pub rules: Vec<LimitRule>,
}

impl Default for Limit {
    fn default() -> Self {
        Limit {
            max_requests: 1000,
            min_requests: 100,
            request_period: Duration::from_secs(1),
            reject_requests: true,
            request_backoff: Duration::from_secs(1),
            cpu_limit: None,
            memory_limit_mb: None,
            limiter_type: None,
            key_fn: None,
            rules: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limit")
            .field("max_requests", &self.max_requests)
            .field("request_period", &self.request_period)
            .field("limiter_type", &self.limiter_type)
            .finish_non_exhaustive()
    }
}

impl Limit {
    /// Process-wide default limit derived from configuration.
    pub fn from_env(env: &Env) -> Self {
        Limit {
            max_requests: env.rate_limit_requests,
            request_period: env.rate_limit_period,
            reject_requests: env.rate_limit_default_reject,
            request_backoff: env.rate_limit_backoff,
            cpu_limit: Some(env.cpu_limit),
            memory_limit_mb: Some(env.memory_limit_mb),
            ..Limit::default()
        }
    }

    pub fn max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.request_period = period;
        self
    }

    pub fn limiter(mut self, kind: LimiterKind) -> Self {
        self.limiter_type = Some(kind);
        self
    }

    pub fn key(mut self, key_fn: impl Fn(&str, Method, IpAddr) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    pub fn rule(mut self, rule: impl Fn(&str, Method, IpAddr) -> bool + Send + Sync + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    fn derive_key(&self, path: &str, method: Method, ip: IpAddr, default: String) -> String {
        match &self.key_fn {
            Some(key_fn) => key_fn(path, method, ip),
            None => default,
        }
    }

    fn matches(&self, path: &str, method: Method, ip: IpAddr) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let mut matched = false;
        for rule in &self.rules {
            matched = rule(path, method, ip);
        }
        matched
    }
}

/// Strategy-keyed limiter registry, one per worker.
pub struct Limiter {
    strategy: RateLimitStrategy,
    default_kind: LimiterKind,
    default_limit: Limit,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl Limiter {
    pub fn new(env: &Env) -> Self {
        Limiter {
            strategy: env.rate_limit_strategy,
            default_kind: env.rate_limiter_type,
            default_limit: Limit::from_env(env),
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Check one request against its derived limit key. Returns `true` when
    /// the request is rejected.
    pub async fn limit(
        &self,
        ip: IpAddr,
        path: &str,
        method: Method,
        route_limit: Option<&Limit>,
    ) -> bool {
        if self.strategy == RateLimitStrategy::None {
            return false;
        }

        let limit = match self.strategy {
            RateLimitStrategy::Global => &self.default_limit,
            _ => route_limit.unwrap_or(&self.default_limit),
        };

        let limit_key = match self.strategy {
            RateLimitStrategy::Ip => limit.derive_key(path, method, ip, ip.to_string()),
            RateLimitStrategy::Endpoint => limit.derive_key(path, method, ip, path.to_string()),
            RateLimitStrategy::Global => {
                self.default_limit
                    .derive_key(path, method, ip, "default".to_string())
            }
            RateLimitStrategy::IpEndpoint => {
                limit.derive_key(path, method, ip, format!("{path}_{ip}"))
            }
            RateLimitStrategy::Custom => limit.derive_key(path, method, ip, "default".to_string()),
            RateLimitStrategy::None => return false,
        };

        if !limit.matches(path, method, ip) {
            return false;
        }

        let limiter = self.limiter_for(&limit_key, limit).await;
        let rejected = limiter.acquire().await;

        if rejected {
            tracing::debug!(%path, %method, %ip, key = %limit_key, "request rejected by rate limiter");
        }

        rejected
    }

    async fn limiter_for(&self, key: &str, limit: &Limit) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().await;
        if let Some(existing) = limiters.get(key) {
            return existing.clone();
        }

        let kind = limit.limiter_type.unwrap_or(self.default_kind);
        let limiter = Arc::new(RateLimiter::new(kind, limit));
        limiters.insert(key.to_string(), limiter.clone());
        limiter
    }

    /// Drop all limiter instances; called at worker shutdown.
    pub async fn close(&self) {
        self.limiters.lock().await.clear();
    }
}
