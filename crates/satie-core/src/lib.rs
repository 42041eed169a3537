//! satie-core: a staged HTTP/1.1 request-pipeline engine.
//!
//! Raw TCP bytes flow through a fixed sequence of stages — parse, route,
//! admission control, middleware, handler dispatch, response
//! serialization, optional response caching — with request-level
//! cancellation, keep-alive pipelining, `Expect: 100-continue`, chunked
//! transfer decoding, TLS upgrade redirection, and multi-worker process
//! fan-out over one shared listening socket.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod fabricator;
pub mod handler;
pub mod http;
pub mod logging;
pub mod middleware;
pub mod parser;
pub mod pipeline;
pub mod rate;
pub mod router;
pub mod server;
pub mod tasks;
pub mod workers;

// ── Core type re-exports ───────────────────────────────────────
pub use config::{Env, LimiterKind, RateLimitStrategy};
pub use error::ServerError;
pub use handler::{HandlerArgs, InputKind, ModelSchema, Reply, Route};
pub use http::{Headers, Method, Request, Response};
pub use logging::{init_logging, init_logging_json};
pub use middleware::{
    CircuitBreaker, Context, Cors, Middleware, MiddlewareFlow, MiddlewareKind, Next, Scheme,
    UpgradeRedirect,
};
pub use pipeline::{Outcome, Pipeline, RequestState, WireCodec};
pub use rate::{Limit, Limiter};
pub use router::{RouteOutcome, Router};
pub use server::Server;
pub use tasks::{RunStatus, TaskDef, TaskRunner, Trigger};
