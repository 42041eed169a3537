//! CORS middleware.
//!
//! Attaches the configured `access-control-*` headers to every response and
//! answers preflight `OPTIONS` requests without invoking the handler.

use async_trait::async_trait;

use crate::handler::Reply;
use crate::http::Method;
use crate::middleware::{Context, Middleware, MiddlewareFlow, MiddlewareKind};

pub struct Cors {
    allow_origins: Vec<String>,
    allow_methods: Vec<String>,
    allow_headers: Vec<String>,
    expose_headers: Vec<String>,
    allow_credentials: bool,
    max_age: Option<u64>,
    allow_all_origins: bool,
}

impl Default for Cors {
    fn default() -> Self {
        Cors::permissive()
    }
}

impl Cors {
    /// Allow every origin, method, and header.
    pub fn permissive() -> Self {
        Cors {
            allow_origins: vec!["*".to_string()],
            allow_methods: vec![
                "GET".into(),
                "HEAD".into(),
                "OPTIONS".into(),
                "POST".into(),
                "PUT".into(),
                "PATCH".into(),
                "DELETE".into(),
                "TRACE".into(),
            ],
            allow_headers: vec!["*".to_string()],
            expose_headers: Vec::new(),
            allow_credentials: false,
            max_age: None,
            allow_all_origins: true,
        }
    }

    pub fn allow_origins(mut self, origins: &[&str]) -> Self {
        self.allow_origins = origins.iter().map(|s| s.to_string()).collect();
        self.allow_all_origins = self.allow_origins.iter().any(|o| o == "*");
        self
    }

    pub fn allow_methods(mut self, methods: &[&str]) -> Self {
        self.allow_methods = methods.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn allow_headers(mut self, headers: &[&str]) -> Self {
        self.allow_headers = headers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn expose_headers(mut self, headers: &[&str]) -> Self {
        self.expose_headers = headers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allow_all_origins || self.allow_origins.iter().any(|o| o == origin)
    }

    fn allowed_origin_value(&self, origin: &str) -> String {
        if self.allow_all_origins && !self.allow_credentials {
            "*".to_string()
        } else {
            origin.to_string()
        }
    }

    fn attach_simple_headers(&self, ctx: &mut Context, origin: &str) {
        ctx.response_headers.insert(
            "access-control-allow-origin".to_string(),
            self.allowed_origin_value(origin),
        );
        if self.allow_credentials {
            ctx.response_headers
                .insert("access-control-allow-credentials".to_string(), "true".to_string());
        }
        if !self.expose_headers.is_empty() {
            ctx.response_headers.insert(
                "access-control-expose-headers".to_string(),
                self.expose_headers.join(", "),
            );
        }
    }
}

#[async_trait]
impl Middleware for Cors {
    fn name(&self) -> &str {
        "Cors"
    }

    fn kind(&self) -> MiddlewareKind {
        MiddlewareKind::UnidirectionalBefore
    }

    fn methods(&self) -> Vec<Method> {
        vec![Method::Options]
    }

    async fn run(&self, ctx: &mut Context, reply: Option<Reply>) -> MiddlewareFlow {
        let Some(origin) = ctx.request_headers.get("origin").map(|o| o.to_string()) else {
            // Same-origin request; nothing to do.
            return MiddlewareFlow::next(reply);
        };

        if !self.origin_allowed(&origin) {
            ctx.status = Some(400);
            ctx.errors.push(format!("Disallowed CORS origin - {origin}"));
            return MiddlewareFlow::stop(reply);
        }

        let preflight = ctx.method == Method::Options
            && ctx.request_headers.contains("access-control-request-method");

        if preflight {
            ctx.response_headers.insert(
                "access-control-allow-origin".to_string(),
                self.allowed_origin_value(&origin),
            );
            ctx.response_headers.insert(
                "access-control-allow-methods".to_string(),
                self.allow_methods.join(", "),
            );
            ctx.response_headers.insert(
                "access-control-allow-headers".to_string(),
                self.allow_headers.join(", "),
            );
            if self.allow_credentials {
                ctx.response_headers
                    .insert("access-control-allow-credentials".to_string(), "true".to_string());
            }
            if let Some(max_age) = self.max_age {
                ctx.response_headers
                    .insert("access-control-max-age".to_string(), max_age.to_string());
            }
            ctx.status = Some(204);
            return MiddlewareFlow::stop(Some(Reply::Empty));
        }

        self.attach_simple_headers(ctx, &origin);
        MiddlewareFlow::next(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Headers;
    use crate::middleware::Scheme;
    use std::collections::HashMap as Map;

    fn context(method: Method, headers: Headers) -> Context {
        Context {
            path: "/".to_string(),
            method,
            request_headers: headers,
            params: Map::new(),
            query: String::new(),
            body: Vec::new(),
            args: None,
            ip_address: "127.0.0.1".parse().unwrap(),
            scheme: Scheme::Http,
            local_addr: None,
            upgrade_port: None,
            response_headers: Map::new(),
            status: None,
            errors: Vec::new(),
            compressor: None,
            compression_level: None,
        }
    }

    #[tokio::test]
    async fn test_preflight_short_circuits() {
        let cors = Cors::permissive();
        let mut headers = Headers::new();
        headers.insert("origin", "https://app.example");
        headers.insert("access-control-request-method", "POST");

        let mut ctx = context(Method::Options, headers);
        let flow = cors.run(&mut ctx, None).await;

        assert!(!flow.run_next);
        assert_eq!(ctx.status, Some(204));
        assert_eq!(
            ctx.response_headers.get("access-control-allow-origin").map(String::as_str),
            Some("*")
        );
    }

    #[tokio::test]
    async fn test_disallowed_origin_is_an_error() {
        let cors = Cors::permissive().allow_origins(&["https://good.example"]);
        let mut headers = Headers::new();
        headers.insert("origin", "https://evil.example");

        let mut ctx = context(Method::Get, headers);
        let flow = cors.run(&mut ctx, None).await;

        assert!(!flow.run_next);
        assert_eq!(ctx.status, Some(400));
        assert_eq!(ctx.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_simple_request_gets_headers_and_continues() {
        let cors = Cors::permissive();
        let mut headers = Headers::new();
        headers.insert("origin", "https://app.example");

        let mut ctx = context(Method::Get, headers);
        let flow = cors.run(&mut ctx, None).await;

        assert!(flow.run_next);
        assert!(ctx.response_headers.contains_key("access-control-allow-origin"));
    }
}
