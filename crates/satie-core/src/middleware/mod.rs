//! Middleware wrappers and chain composition.
//!
//! Four wrapper kinds compose around a route handler:
//!
//! - **Bidirectional**: `pre` runs before the inner stack, `post` after.
//! - **UnidirectionalBefore**: `run` before; `run_next = false`
//!   short-circuits with the current reply.
//! - **UnidirectionalAfter**: the inner stack first, then `run`.
//! - **Call**: wholly replaces the inner invocation (the circuit breaker
//!   wraps the handler in a timeout this way).
//!
//! Wrappers nest: each wrapper's "handler" is the next wrapper inward, and
//! the innermost frame is the typed route handler called with the
//! fabricated args. The chain is a fixed list built once at startup.

pub mod breaker;
pub mod context;
pub mod cors;
pub mod redirect;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ServerError;
use crate::handler::{HandlerFn, Reply};
use crate::http::Method;

pub use breaker::CircuitBreaker;
pub use context::{Context, Scheme};
pub use cors::Cors;
pub use redirect::UpgradeRedirect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareKind {
    Bidirectional,
    UnidirectionalBefore,
    UnidirectionalAfter,
    Call,
}

/// Result of one wrapper stage: the (possibly replaced) reply and whether
/// the chain continues inward.
pub struct MiddlewareFlow {
    pub reply: Option<Reply>,
    pub run_next: bool,
}

impl MiddlewareFlow {
    pub fn next(reply: Option<Reply>) -> Self {
        MiddlewareFlow { reply, run_next: true }
    }

    pub fn stop(reply: Option<Reply>) -> Self {
        MiddlewareFlow { reply, run_next: false }
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> MiddlewareKind;

    /// Headers this wrapper contributes to every response it touches.
    fn response_headers(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Extra methods this wrapper makes its routes answer (CORS adds
    /// `OPTIONS` so preflights route-match).
    fn methods(&self) -> Vec<Method> {
        Vec::new()
    }

    /// Bidirectional pre-stage.
    async fn pre(&self, _ctx: &mut Context, reply: Option<Reply>) -> MiddlewareFlow {
        MiddlewareFlow::next(reply)
    }

    /// Bidirectional post-stage.
    async fn post(&self, _ctx: &mut Context, reply: Option<Reply>) -> MiddlewareFlow {
        MiddlewareFlow::next(reply)
    }

    /// Unidirectional stage (before or after, per `kind`).
    async fn run(&self, _ctx: &mut Context, reply: Option<Reply>) -> MiddlewareFlow {
        MiddlewareFlow::next(reply)
    }

    /// Call stage: owns the inner invocation entirely.
    async fn call(&self, ctx: &mut Context, next: Next<'_>) -> Result<Option<Reply>, ServerError> {
        next.invoke(ctx).await
    }
}

/// Handle to the remainder of the chain, ending at the route handler.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    handler: &'a HandlerFn,
}

impl Next<'_> {
    pub async fn invoke(&self, ctx: &mut Context) -> Result<Option<Reply>, ServerError> {
        run_chain(self.chain, self.handler, ctx, None).await
    }
}

/// Execute the chain outermost-first. The innermost frame takes the
/// fabricated args out of the context and calls the route handler.
pub fn run_chain<'a>(
    chain: &'a [Arc<dyn Middleware>],
    handler: &'a HandlerFn,
    ctx: &'a mut Context,
    reply: Option<Reply>,
) -> Pin<Box<dyn Future<Output = Result<Option<Reply>, ServerError>> + Send + 'a>> {
    Box::pin(async move {
        let Some((outer, rest)) = chain.split_first() else {
            let args = ctx.args.take().unwrap_or_default();
            return (handler)(args).await.map(Some);
        };

        for (name, value) in outer.response_headers() {
            ctx.response_headers.entry(name).or_insert(value);
        }

        match outer.kind() {
            MiddlewareKind::Bidirectional => {
                let flow = outer.pre(ctx, reply).await;
                if !flow.run_next {
                    return Ok(flow.reply);
                }
                let reply = run_chain(rest, handler, ctx, flow.reply).await?;
                let flow = outer.post(ctx, reply).await;
                Ok(flow.reply)
            }
            MiddlewareKind::UnidirectionalBefore => {
                let flow = outer.run(ctx, reply).await;
                if !flow.run_next {
                    return Ok(flow.reply);
                }
                run_chain(rest, handler, ctx, flow.reply).await
            }
            MiddlewareKind::UnidirectionalAfter => {
                let reply = run_chain(rest, handler, ctx, reply).await?;
                let flow = outer.run(ctx, reply).await;
                Ok(flow.reply)
            }
            MiddlewareKind::Call => {
                outer
                    .call(ctx, Next { chain: rest, handler })
                    .await
            }
        }
    })
}
