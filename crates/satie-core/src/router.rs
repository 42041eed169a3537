//! Two-tier route resolution.
//!
//! An exact `"{METHOD}_{path}"` table answers the common case in one hash
//! lookup; everything else falls through to a segment-at-a-time trie with
//! `:name` path-parameter capture. Literal edges always win over the
//! parameterized edge, and a node carries at most one parameterized edge.
//! Terminal nodes may coexist with internal ones, so a path can be both a
//! route and a prefix.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ServerError;
use crate::handler::Route;
use crate::http::Method;

#[derive(Default)]
struct RouteNode {
    literal: HashMap<String, RouteNode>,
    param: Option<(String, Box<RouteNode>)>,
    terminal: Option<Terminal>,
}

struct Terminal {
    template: String,
    handlers: HashMap<Method, Arc<Route>>,
}

/// What resolution produced for a `(method, path)` pair.
pub enum RouteOutcome {
    Matched {
        route: Arc<Route>,
        template: String,
        params: HashMap<String, String>,
    },
    /// The path exists but not for this method.
    MethodNotAllowed { template: String },
    NotFound,
}

#[derive(Default)]
pub struct Router {
    exact: HashMap<String, Arc<Route>>,
    root: RouteNode,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    fn exact_key(method: Method, path: &str) -> String {
        format!("{}_{}", method.as_str(), path)
    }

    /// Register a route for every method it declares. Templates with
    /// `:name` segments are only reachable through the trie.
    pub fn insert(&mut self, route: Route) -> Result<(), ServerError> {
        let route = Arc::new(route);
        let template = route.template.clone();
        let has_params = template.split('/').any(|segment| segment.starts_with(':'));

        if !has_params {
            for method in &route.methods {
                let key = Router::exact_key(*method, &template);
                if self.exact.insert(key, route.clone()).is_some() {
                    return Err(ServerError::Internal(format!(
                        "duplicate route: {} {}",
                        method.as_str(),
                        template
                    )));
                }
            }
        }

        let mut node = &mut self.root;
        for segment in template.split('/').filter(|s| !s.is_empty()) {
            if let Some(name) = segment.strip_prefix(':') {
                let (existing, child) = node
                    .param
                    .get_or_insert_with(|| (name.to_string(), Box::new(RouteNode::default())));
                if existing.as_str() != name {
                    return Err(ServerError::Internal(format!(
                        "conflicting parameter names at {template}: :{existing} vs :{name}"
                    )));
                }
                node = child.as_mut();
            } else {
                node = node.literal.entry(segment.to_string()).or_default();
            }
        }

        let terminal = node.terminal.get_or_insert_with(|| Terminal {
            template: template.clone(),
            handlers: HashMap::new(),
        });
        for method in &route.methods {
            if terminal.handlers.insert(*method, route.clone()).is_some() {
                return Err(ServerError::Internal(format!(
                    "duplicate route: {} {}",
                    method.as_str(),
                    template
                )));
            }
        }

        Ok(())
    }

    pub fn resolve(&self, method: Method, path: &str) -> RouteOutcome {
        // Fast path: exact (method, path) hit.
        if let Some(route) = self.exact.get(&Router::exact_key(method, path)) {
            return RouteOutcome::Matched {
                route: route.clone(),
                template: route.template.clone(),
                params: HashMap::new(),
            };
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = HashMap::new();

        match descend(&self.root, &segments, 0, &mut params) {
            Some(terminal) => match terminal.handlers.get(&method) {
                Some(route) => RouteOutcome::Matched {
                    route: route.clone(),
                    template: terminal.template.clone(),
                    params,
                },
                None => RouteOutcome::MethodNotAllowed {
                    template: terminal.template.clone(),
                },
            },
            None => RouteOutcome::NotFound,
        }
    }
}

fn descend<'a>(
    node: &'a RouteNode,
    segments: &[&str],
    depth: usize,
    params: &mut HashMap<String, String>,
) -> Option<&'a Terminal> {
    if depth == segments.len() {
        return node.terminal.as_ref();
    }

    let segment = segments[depth];

    // Literal edges win over the parameterized edge.
    if let Some(child) = node.literal.get(segment)
        && let Some(terminal) = descend(child, segments, depth + 1, params)
    {
        return Some(terminal);
    }

    if let Some((name, child)) = &node.param {
        params.insert(name.clone(), segment.to_string());
        if let Some(terminal) = descend(child, segments, depth + 1, params) {
            return Some(terminal);
        }
        params.remove(name);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Reply;

    fn route(template: &str, methods: &[Method]) -> Route {
        Route::new(template, methods)
            .handler(|_args| async { Ok(Reply::Empty) })
            .unwrap()
    }

    fn build(routes: Vec<Route>) -> Router {
        let mut router = Router::new();
        for entry in routes {
            router.insert(entry).unwrap();
        }
        router
    }

    #[test]
    fn test_exact_match() {
        let router = build(vec![route("/hello/world", &[Method::Get])]);

        assert!(matches!(
            router.resolve(Method::Get, "/hello/world"),
            RouteOutcome::Matched { .. }
        ));
        assert!(matches!(
            router.resolve(Method::Get, "/hello"),
            RouteOutcome::NotFound
        ));
    }

    #[test]
    fn test_method_not_allowed() {
        let router = build(vec![route("/hello", &[Method::Get])]);
        assert!(matches!(
            router.resolve(Method::Post, "/hello"),
            RouteOutcome::MethodNotAllowed { .. }
        ));

        let router = build(vec![route("/users/:id", &[Method::Get])]);
        assert!(matches!(
            router.resolve(Method::Delete, "/users/42"),
            RouteOutcome::MethodNotAllowed { .. }
        ));
    }

    #[test]
    fn test_param_capture() {
        let router = build(vec![route("/users/:id/posts/:post_id", &[Method::Get])]);

        match router.resolve(Method::Get, "/users/42/posts/abc") {
            RouteOutcome::Matched { params, template, .. } => {
                assert_eq!(template, "/users/:id/posts/:post_id");
                assert_eq!(params.get("id").map(String::as_str), Some("42"));
                assert_eq!(params.get("post_id").map(String::as_str), Some("abc"));
            }
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn test_literal_beats_param() {
        let router = build(vec![
            route("/users/:id", &[Method::Get]),
            route("/users/me", &[Method::Get]),
        ]);

        match router.resolve(Method::Get, "/users/me") {
            RouteOutcome::Matched { template, params, .. } => {
                assert_eq!(template, "/users/me");
                assert!(params.is_empty());
            }
            _ => panic!("expected a match"),
        }

        match router.resolve(Method::Get, "/users/42") {
            RouteOutcome::Matched { template, .. } => assert_eq!(template, "/users/:id"),
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn test_route_that_is_also_a_prefix() {
        let router = build(vec![
            route("/api", &[Method::Get]),
            route("/api/users", &[Method::Get]),
        ]);

        assert!(matches!(
            router.resolve(Method::Get, "/api"),
            RouteOutcome::Matched { .. }
        ));
        assert!(matches!(
            router.resolve(Method::Get, "/api/users"),
            RouteOutcome::Matched { .. }
        ));
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let mut router = Router::new();
        router.insert(route("/a", &[Method::Get])).unwrap();
        assert!(router.insert(route("/a", &[Method::Get])).is_err());
    }

    #[test]
    fn test_backtracks_out_of_param_branch() {
        let router = build(vec![
            route("/files/:name/raw", &[Method::Get]),
            route("/files/latest/meta", &[Method::Get]),
        ]);

        match router.resolve(Method::Get, "/files/latest/raw") {
            RouteOutcome::Matched { template, params, .. } => {
                assert_eq!(template, "/files/:name/raw");
                assert_eq!(params.get("name").map(String::as_str), Some("latest"));
            }
            _ => panic!("expected the param branch after literal backtrack"),
        }
    }
}
