//! TLS upgrade redirection.
//!
//! When a companion TLS listener is configured, plaintext requests are
//! answered with `307 Temporary Redirect` pointing at the same host and
//! path on the upgrade port, with the scheme promoted (`http` → `https`,
//! `ws` → `wss`).

use async_trait::async_trait;

use crate::handler::Reply;
use crate::middleware::{Context, Middleware, MiddlewareFlow, MiddlewareKind};

pub struct UpgradeRedirect;

#[async_trait]
impl Middleware for UpgradeRedirect {
    fn name(&self) -> &str {
        "UpgradeRedirect"
    }

    fn kind(&self) -> MiddlewareKind {
        MiddlewareKind::UnidirectionalBefore
    }

    async fn run(&self, ctx: &mut Context, reply: Option<Reply>) -> MiddlewareFlow {
        let Some(upgrade_port) = ctx.upgrade_port else {
            return MiddlewareFlow::next(reply);
        };

        if !ctx.scheme.is_plaintext() {
            return MiddlewareFlow::next(reply);
        }

        let location = ctx.upgrade_url(upgrade_port);
        tracing::info!(%location, "redirecting plaintext request to upgrade listener");

        ctx.status = Some(307);
        ctx.response_headers.insert("location".to_string(), location);
        MiddlewareFlow::stop(Some(Reply::Empty))
    }
}
