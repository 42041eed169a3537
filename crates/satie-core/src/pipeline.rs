//! The request state machine.
//!
//! Every accepted request is driven through the staged pipeline:
//!
//! ```text
//! PARSE ──ok──→ ROUTE ──hit──→ RATE_LIMIT ──accept──→ MIDDLEWARE | HANDLE ──→ COMPLETE
//!   │             │ no path → ERROR(404)     │ reject → ABORTED(429)   │ throw → ERROR
//!   │ bad         │ no method → ERROR(405)
//!   └──→ ERROR(400|408)        │ validation fail → ERROR(422)
//! ```
//!
//! Exactly one response is written per request, or the connection is closed
//! exactly once. Every write path re-checks whether the connection is
//! already closing and suppresses the write if so. Rejection replies are
//! throttled through a counting semaphore whose permit rides along with
//! the outcome so it is only released once the bytes hit the wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::cache::ResponseCache;
use crate::config::{Env, RateLimitStrategy};
use crate::error::ServerError;
use crate::fabricator::Fabricator;
use crate::handler::{HandlerArgs, Reply};
use crate::http::{Request, Response, status_reason};
use crate::middleware::{Context, Scheme, run_chain};
use crate::rate::Limiter;
use crate::router::{RouteOutcome, Router};

/// Stages of the per-request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Parse,
    Route,
    RateLimit,
    Middleware,
    Handle,
    Complete,
    Error,
    Aborted,
}

/// What the machine decided to do with the connection.
pub enum Outcome {
    /// Write these bytes as the single response for this request. The
    /// optional permit throttles concurrent rejection replies; it is held
    /// until the caller finishes the write.
    Write {
        bytes: Vec<u8>,
        permit: Option<OwnedSemaphorePermit>,
    },
    /// Close the connection without a response.
    Abort,
}

impl Outcome {
    fn write(bytes: Vec<u8>) -> Self {
        Outcome::Write { bytes, permit: None }
    }
}

/// Pluggable bytes→bytes transform applied to inbound raw requests and
/// outbound serialized responses when wire encryption is enabled.
pub trait WireCodec: Send + Sync {
    fn encode(&self, bytes: Vec<u8>) -> Vec<u8>;
    fn decode(&self, bytes: Vec<u8>) -> Result<Vec<u8>, ServerError>;
}

/// The default no-op codec.
pub struct IdentityCodec;

impl WireCodec for IdentityCodec {
    fn encode(&self, bytes: Vec<u8>) -> Vec<u8> {
        bytes
    }

    fn decode(&self, bytes: Vec<u8>) -> Result<Vec<u8>, ServerError> {
        Ok(bytes)
    }
}

/// Connection facts the machine needs for one request.
pub struct ConnectionMeta {
    pub peer: SocketAddr,
    pub local_addr: Option<SocketAddr>,
    pub scheme: Scheme,
    pub closing: Arc<AtomicBool>,
}

impl ConnectionMeta {
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// Per-worker pipeline state: router, limiter, cache, and knobs. Built once
/// at worker start; read-only thereafter.
pub struct Pipeline {
    router: Router,
    limiter: Limiter,
    cache: Option<ResponseCache>,
    backoff: Arc<Semaphore>,
    rate_limiting_enabled: bool,
    codec: Arc<dyn WireCodec>,
    upgrade_port: Option<u16>,
}

impl Pipeline {
    pub fn new(
        env: &Env,
        router: Router,
        upgrade_port: Option<u16>,
        codec: Arc<dyn WireCodec>,
    ) -> Self {
        Pipeline {
            router,
            limiter: Limiter::new(env),
            cache: env
                .request_caching_enabled
                .then(|| ResponseCache::new(env.max_request_cache_size)),
            backoff: Arc::new(Semaphore::new(env.rate_limit_backoff_rate.max(1))),
            rate_limiting_enabled: env.rate_limit_strategy != RateLimitStrategy::None,
            codec,
            upgrade_port,
        }
    }

    /// Drive one parsed request (or parse failure) to its single outcome.
    pub async fn dispatch(
        &self,
        parsed: Result<Request, ServerError>,
        meta: &ConnectionMeta,
    ) -> Outcome {
        let mut state = RequestState::Parse;

        let request = match parsed {
            Ok(request) => request,
            Err(err) => {
                state = RequestState::Error;
                tracing::debug!(?state, peer = %meta.peer, error = %err, "request failed to parse");
                return self.error_with_backoff(&err, meta).await;
            }
        };

        tracing::debug!(
            ?state,
            method = %request.method,
            path = %request.path,
            peer = %meta.peer,
            "request received"
        );

        // Cache replay short-circuits every later stage.
        let fingerprint = self.cache.as_ref().map(|_| request.fingerprint());
        if let Some(cache) = &self.cache
            && let Some(fingerprint) = fingerprint
            && let Some(entry) = cache.get(fingerprint).await
        {
            tracing::debug!(path = %request.path, status = entry.status, "response served from cache");
            if meta.is_closing() {
                return Outcome::Abort;
            }
            return Outcome::write(entry.bytes);
        }

        state = RequestState::Route;
        let (route, template, path_params) = match self.router.resolve(request.method, &request.path)
        {
            RouteOutcome::Matched { route, template, params } => (route, template, params),
            RouteOutcome::NotFound => {
                state = RequestState::Error;
                tracing::debug!(?state, path = %request.path, "no route matched");
                return self
                    .error_list_with_backoff(
                        404,
                        vec![format!("No route matching {}", request.path)],
                        meta,
                    )
                    .await;
            }
            RouteOutcome::MethodNotAllowed { template } => {
                state = RequestState::Error;
                tracing::debug!(?state, path = %request.path, %template, "method not allowed");
                return self
                    .error_list_with_backoff(
                        405,
                        vec![format!(
                            "Method {} not allowed for {}",
                            request.method, template
                        )],
                        meta,
                    )
                    .await;
            }
        };

        let has_middleware = !route.middleware.is_empty();
        let args = match Fabricator::new(&route.descriptor).bind(&request, &path_params, has_middleware)
        {
            Ok(args) => args,
            Err(err) => {
                state = RequestState::Error;
                tracing::debug!(?state, path = %request.path, error = %err, "fabrication failed");
                if meta.is_closing() {
                    return Outcome::Abort;
                }
                return Outcome::write(self.encode_outbound(Response::from_error(&err).serialize()));
            }
        };

        if self.rate_limiting_enabled {
            state = RequestState::RateLimit;
            tracing::debug!(?state, path = %template, "entered rate limiting");

            let rejected = self
                .limiter
                .limit(meta.peer.ip(), &template, request.method, route.limit.as_ref())
                .await;

            if rejected {
                state = RequestState::Aborted;
                tracing::debug!(?state, path = %template, "rejected by rate limiting");
                let permit = self.backoff.clone().acquire_owned().await.ok();

                if meta.is_closing() {
                    return Outcome::Abort;
                }
                let response = Response::from_error(&ServerError::TooManyRequests(
                    "request rejected".to_string(),
                ));
                return Outcome::Write {
                    bytes: self.encode_outbound(response.serialize()),
                    permit,
                };
            }
        }

        let (reply, status, response_headers) = if has_middleware {
            state = RequestState::Middleware;
            tracing::debug!(?state, path = %request.path, "executing handler with middleware");

            let mut ctx = Context {
                path: request.path.clone(),
                method: request.method,
                request_headers: request.headers.clone(),
                params: path_params,
                query: request.query.clone().unwrap_or_default(),
                body: request.body.clone(),
                args: Some(args),
                ip_address: meta.peer.ip(),
                scheme: meta.scheme,
                local_addr: meta.local_addr,
                upgrade_port: self.upgrade_port,
                response_headers: std::collections::HashMap::new(),
                status: None,
                errors: Vec::new(),
                compressor: None,
                compression_level: None,
            };

            let chain_result = run_chain(&route.middleware, &route.handler, &mut ctx, None).await;

            match chain_result {
                Err(err) => {
                    state = RequestState::Error;
                    tracing::error!(?state, path = %request.path, error = %err, "handler failed");
                    return self.error_with_backoff(&err, meta).await;
                }
                Ok(reply) => {
                    if !ctx.errors.is_empty() {
                        state = RequestState::Error;
                        let status = ctx.status.unwrap_or(500);
                        tracing::error!(
                            ?state,
                            path = %request.path,
                            status,
                            errors = ctx.errors.len(),
                            "middleware reported errors"
                        );
                        let permit = self.backoff.clone().acquire_owned().await.ok();
                        if meta.is_closing() {
                            return Outcome::Abort;
                        }
                        let mut response = Response::from_error_list(
                            status,
                            status_reason(status),
                            &ctx.errors,
                        );
                        for (name, value) in ctx.response_headers {
                            response = response.header(name, value);
                        }
                        return Outcome::Write {
                            bytes: self.encode_outbound(response.serialize()),
                            permit,
                        };
                    }

                    let mut headers = route.response_headers.clone();
                    headers.extend(ctx.response_headers);
                    (
                        reply.unwrap_or(Reply::Empty),
                        ctx.status.unwrap_or(route.response.default_status),
                        headers,
                    )
                }
            }
        } else {
            state = RequestState::Handle;
            tracing::debug!(?state, path = %request.path, "executing handler");

            match self.invoke_handler(&route.handler, args).await {
                Ok(reply) => (
                    reply,
                    route.response.default_status,
                    route.response_headers.clone(),
                ),
                Err(err) => {
                    state = RequestState::Error;
                    tracing::error!(?state, path = %request.path, error = %err, "handler failed");
                    return self.error_with_backoff(&err, meta).await;
                }
            }
        };

        state = RequestState::Complete;
        tracing::debug!(?state, path = %request.path, status, "response assembled");

        let mut response = Response::new(status);
        response.content_type = reply.content_type().map(str::to_string);
        response.body = reply.into_bytes();
        for (name, value) in response_headers {
            if name.eq_ignore_ascii_case("content-type") {
                response.content_type = Some(value);
            } else {
                response.headers.push((name, value));
            }
        }

        let bytes = self.encode_outbound(response.serialize());

        if let Some(cache) = &self.cache
            && let Some(fingerprint) = fingerprint
        {
            cache.insert(fingerprint, bytes.clone(), status).await;
        }

        if meta.is_closing() {
            return Outcome::Abort;
        }
        Outcome::write(bytes)
    }

    async fn invoke_handler(
        &self,
        handler: &crate::handler::HandlerFn,
        args: HandlerArgs,
    ) -> Result<Reply, ServerError> {
        (handler)(args).await
    }

    /// Encode outbound wire bytes through the configured codec. Every
    /// write shares this path, interim responses included.
    pub fn encode_outbound(&self, bytes: Vec<u8>) -> Vec<u8> {
        self.codec.encode(bytes)
    }

    /// Decode inbound wire bytes through the configured codec.
    pub fn decode_inbound(&self, bytes: Vec<u8>) -> Result<Vec<u8>, ServerError> {
        self.codec.decode(bytes)
    }

    /// Release per-worker pipeline resources at shutdown.
    pub async fn close(&self) {
        self.limiter.close().await;
    }

    async fn error_with_backoff(&self, err: &ServerError, meta: &ConnectionMeta) -> Outcome {
        let permit = self.backoff.clone().acquire_owned().await.ok();
        if meta.is_closing() {
            return Outcome::Abort;
        }
        Outcome::Write {
            bytes: self.encode_outbound(Response::from_error(err).serialize()),
            permit,
        }
    }

    async fn error_list_with_backoff(
        &self,
        status: u16,
        messages: Vec<String>,
        meta: &ConnectionMeta,
    ) -> Outcome {
        let permit = self.backoff.clone().acquire_owned().await.ok();
        if meta.is_closing() {
            return Outcome::Abort;
        }
        let response = Response::from_error_list(status, status_reason(status), &messages);
        Outcome::Write {
            bytes: self.encode_outbound(response.serialize()),
            permit,
        }
    }
}
