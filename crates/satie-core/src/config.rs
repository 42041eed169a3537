//! Environment-driven configuration for the Satie engine.
//!
//! Every tunable the pipeline reads comes through [`Env`], loaded once at
//! startup from process environment variables (with `.env` support). Worker
//! processes re-load the same configuration so each worker owns an identical,
//! independent copy.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration `{0}`")]
    InvalidDuration(String),

    #[error("invalid memory size `{0}`")]
    InvalidMemory(String),

    #[error("invalid value for {key}: `{value}`")]
    InvalidValue { key: &'static str, value: String },
}

/// Where registered background tasks execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExecutorType {
    Thread,
    Process,
    None,
}

/// How rate-limit keys are derived per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStrategy {
    None,
    Global,
    Endpoint,
    Ip,
    IpEndpoint,
    Custom,
}

/// Which admission-control algorithm backs a limiter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterKind {
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
    Adaptive,
    RateAdaptive,
    CpuAdaptive,
}

/// Client-certificate verification mode for the TLS upgrade listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertVerification {
    Required,
    Optional,
    None,
}

/// Process-level configuration, one copy per worker.
#[derive(Debug, Clone)]
pub struct Env {
    /// Advertised public URL (`SERVER_URL`).
    pub server_url: Option<String>,

    /// Bind host (`SERVER_HOST`, default 127.0.0.1).
    pub server_host: String,

    /// Bind port (`SERVER_PORT`, default 3000).
    pub server_port: u16,

    /// Worker-process count (`WORKERS`, default: available parallelism).
    pub workers: usize,

    /// `TASK_EXECUTOR_TYPE`: thread / process / none.
    pub task_executor_type: TaskExecutorType,

    /// Exponent in the breaker's probabilistic rejection.
    pub circuit_breaker_rejection_sensitivity: f64,

    /// Rolling-window length for breaker failure accounting.
    pub circuit_breaker_failure_window: Duration,

    /// Failure fraction that trips the breaker.
    pub circuit_breaker_failure_threshold: f64,

    /// Per-handler timeout enforced by the breaker.
    pub handler_timeout: Duration,

    pub rate_limit_strategy: RateLimitStrategy,
    pub rate_limiter_type: LimiterKind,

    /// Semaphore size throttling concurrent rejection replies.
    pub rate_limit_backoff_rate: usize,

    /// Adaptive-limiter backoff on rejection.
    pub rate_limit_backoff: Duration,

    pub rate_limit_period: Duration,
    pub rate_limit_requests: u64,
    pub rate_limit_default_reject: bool,

    pub cors_enabled: bool,

    /// Adaptive limiter memory threshold, in megabytes.
    pub memory_limit_mb: f64,

    /// Adaptive limiter CPU threshold, in percent.
    pub cpu_limit: f64,

    /// Per-worker in-flight connection cap.
    pub max_concurrency: usize,

    /// Task-runner sweep period.
    pub cleanup_interval: Duration,

    /// Body-read timeout.
    pub request_timeout: Duration,

    /// Response cache capacity (entries).
    pub max_request_cache_size: usize,
    pub request_caching_enabled: bool,

    pub verify_ssl_cert: CertVerification,

    /// Toggle the on-the-wire codec seam.
    pub use_wire_encryption: bool,

    /// Default tracing filter when `RUST_LOG` is unset (`LOG_LEVEL`).
    pub log_level: String,
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn var_or(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|| default.to_string())
}

fn var_bool(key: &str, default: bool) -> bool {
    var(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

impl Env {
    /// Load configuration from environment variables (with `.env` support).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env if present; a missing file is not an error.
        let _ = dotenvy::dotenv();

        Ok(Env {
            server_url: var("SERVER_URL"),
            server_host: var_or("SERVER_HOST", "127.0.0.1"),
            server_port: var_or("SERVER_PORT", "3000").parse().unwrap_or(3000),
            workers: var("WORKERS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(num_cpus::get),
            task_executor_type: match var_or("TASK_EXECUTOR_TYPE", "process").as_str() {
                "thread" => TaskExecutorType::Thread,
                "none" => TaskExecutorType::None,
                _ => TaskExecutorType::Process,
            },
            circuit_breaker_rejection_sensitivity: var_or(
                "HTTP_CIRCUIT_BREAKER_REJECTION_SENSITIVITY",
                "2",
            )
            .parse()
            .unwrap_or(2.0),
            circuit_breaker_failure_window: parse_duration(&var_or(
                "HTTP_CIRCUIT_BREAKER_FAILURE_WINDOW",
                "1m",
            ))?,
            circuit_breaker_failure_threshold: var_or("HTTP_CIRCUIT_BREAKER_FAILURE_THRESHOLD", "0.2")
                .parse()
                .unwrap_or(0.2),
            handler_timeout: parse_duration(&var_or("HTTP_HANDLER_TIMEOUT", "1m"))?,
            rate_limit_strategy: parse_strategy(&var_or("HTTP_RATE_LIMIT_STRATEGY", "none"))?,
            rate_limiter_type: parse_limiter_kind(&var_or("HTTP_RATE_LIMITER_TYPE", "sliding-window"))?,
            rate_limit_backoff_rate: var_or("HTTP_RATE_LIMIT_BACKOFF_RATE", "10")
                .parse()
                .unwrap_or(10),
            rate_limit_backoff: parse_duration(&var_or("HTTP_RATE_LIMIT_BACKOFF", "1s"))?,
            rate_limit_period: parse_duration(&var_or("HTTP_RATE_LIMIT_PERIOD", "1s"))?,
            rate_limit_requests: var_or("HTTP_RATE_LIMIT_REQUESTS", "100").parse().unwrap_or(100),
            rate_limit_default_reject: var_bool("HTTP_RATE_LIMIT_DEFAULT_REJECT", true),
            cors_enabled: var_bool("HTTP_CORS_ENABLED", false),
            memory_limit_mb: parse_memory(&var_or("HTTP_MEMORY_LIMIT", "512mb"))?,
            cpu_limit: var_or("HTTP_CPU_LIMIT", "50").parse().unwrap_or(50.0),
            max_concurrency: var_or("MAX_CONCURRENCY", "2048").parse().unwrap_or(2048),
            cleanup_interval: parse_duration(&var_or("CLEANUP_INTERVAL", "0.25s"))?,
            request_timeout: parse_duration(&var_or("REQUEST_TIMEOUT", "30s"))?,
            max_request_cache_size: var_or("MAX_REQUEST_CACHE_SIZE", "100").parse().unwrap_or(100),
            request_caching_enabled: var_bool("ENABLE_REQUEST_CACHING", false),
            verify_ssl_cert: match var_or("VERIFY_SSL_CERT", "REQUIRED").as_str() {
                "OPTIONAL" => CertVerification::Optional,
                "NONE" => CertVerification::None,
                _ => CertVerification::Required,
            },
            use_wire_encryption: var_bool("USE_HTTP_MSYNC_ENCRYPTION", false),
            log_level: var_or("LOG_LEVEL", "info"),
        })
    }

    /// Full bind address for the plaintext listener.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

impl Default for Env {
    fn default() -> Self {
        Env {
            server_url: None,
            server_host: "127.0.0.1".to_string(),
            server_port: 3000,
            workers: 1,
            task_executor_type: TaskExecutorType::Process,
            circuit_breaker_rejection_sensitivity: 2.0,
            circuit_breaker_failure_window: Duration::from_secs(60),
            circuit_breaker_failure_threshold: 0.2,
            handler_timeout: Duration::from_secs(60),
            rate_limit_strategy: RateLimitStrategy::None,
            rate_limiter_type: LimiterKind::SlidingWindow,
            rate_limit_backoff_rate: 10,
            rate_limit_backoff: Duration::from_secs(1),
            rate_limit_period: Duration::from_secs(1),
            rate_limit_requests: 100,
            rate_limit_default_reject: true,
            cors_enabled: false,
            memory_limit_mb: 512.0,
            cpu_limit: 50.0,
            max_concurrency: 2048,
            cleanup_interval: Duration::from_millis(250),
            request_timeout: Duration::from_secs(30),
            max_request_cache_size: 100,
            request_caching_enabled: false,
            verify_ssl_cert: CertVerification::Required,
            use_wire_encryption: false,
            log_level: "info".to_string(),
        }
    }
}

fn parse_strategy(raw: &str) -> Result<RateLimitStrategy, ConfigError> {
    match raw {
        "none" => Ok(RateLimitStrategy::None),
        "global" => Ok(RateLimitStrategy::Global),
        "endpoint" => Ok(RateLimitStrategy::Endpoint),
        "ip" => Ok(RateLimitStrategy::Ip),
        "ip-endpoint" => Ok(RateLimitStrategy::IpEndpoint),
        "custom" => Ok(RateLimitStrategy::Custom),
        other => Err(ConfigError::InvalidValue {
            key: "HTTP_RATE_LIMIT_STRATEGY",
            value: other.to_string(),
        }),
    }
}

fn parse_limiter_kind(raw: &str) -> Result<LimiterKind, ConfigError> {
    match raw {
        "sliding-window" => Ok(LimiterKind::SlidingWindow),
        "token-bucket" => Ok(LimiterKind::TokenBucket),
        "leaky-bucket" => Ok(LimiterKind::LeakyBucket),
        "adaptive" => Ok(LimiterKind::Adaptive),
        "rate-adaptive" => Ok(LimiterKind::RateAdaptive),
        "cpu-adaptive" => Ok(LimiterKind::CpuAdaptive),
        other => Err(ConfigError::InvalidValue {
            key: "HTTP_RATE_LIMITER_TYPE",
            value: other.to_string(),
        }),
    }
}

/// Parse a dotted-time string (`"500ms"`, `"30s"`, `"1m"`, `"2h"`, `"0.25s"`).
///
/// A bare number is taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(raw.len());
    let (amount, unit) = raw.split_at(split);
    let amount: f64 = amount
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;

    let seconds = match unit.trim() {
        "ms" => amount / 1000.0,
        "" | "s" => amount,
        "m" => amount * 60.0,
        "h" => amount * 3600.0,
        "d" => amount * 86_400.0,
        _ => return Err(ConfigError::InvalidDuration(raw.to_string())),
    };

    if !(seconds >= 0.0) {
        return Err(ConfigError::InvalidDuration(raw.to_string()));
    }

    Ok(Duration::from_secs_f64(seconds))
}

/// Parse a memory-size string (`"512mb"`, `"2gb"`, `"1024kb"`) into megabytes.
pub fn parse_memory(raw: &str) -> Result<f64, ConfigError> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(raw.len());
    let (amount, unit) = raw.split_at(split);
    let amount: f64 = amount
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidMemory(raw.to_string()))?;

    let megabytes = match unit.trim().to_ascii_lowercase().as_str() {
        "kb" => amount / 1024.0,
        "" | "mb" => amount,
        "gb" => amount * 1024.0,
        _ => return Err(ConfigError::InvalidMemory(raw.to_string())),
    };

    Ok(megabytes)
}
