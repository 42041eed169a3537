//! Route and handler registration.
//!
//! Handlers are registered explicitly with a typed descriptor: the ordered
//! list of inputs they consume, the methods they serve, their declared
//! response shape, and any per-route middleware or rate limit. The
//! fabricator consumes the descriptor deterministically at request time —
//! nothing is discovered reflectively.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ServerError;
use crate::http::{Headers, Method};
use crate::middleware::Middleware;
use crate::rate::Limit;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The innermost callable of every route.
pub type HandlerFn = Arc<dyn Fn(HandlerArgs) -> BoxFuture<Result<Reply, ServerError>> + Send + Sync>;

/// One declared handler input. At most one of each kind per handler; the
/// body kinds are mutually exclusive.
#[derive(Clone)]
pub enum InputKind {
    Headers,
    Cookies,
    Path,
    Query,
    BodyFile,
    BodyHtml,
    BodyModel(ModelSchema),
    BodyJson,
    BodyBlob,
    BodyRaw,
}

impl InputKind {
    fn slot(&self) -> &'static str {
        match self {
            InputKind::Headers => "headers",
            InputKind::Cookies => "cookies",
            InputKind::Path => "path",
            InputKind::Query => "query",
            InputKind::BodyFile
            | InputKind::BodyHtml
            | InputKind::BodyModel(_)
            | InputKind::BodyJson
            | InputKind::BodyBlob
            | InputKind::BodyRaw => "body",
        }
    }
}

impl std::fmt::Debug for InputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InputKind::Headers => "Headers",
            InputKind::Cookies => "Cookies",
            InputKind::Path => "Path",
            InputKind::Query => "Query",
            InputKind::BodyFile => "BodyFile",
            InputKind::BodyHtml => "BodyHtml",
            InputKind::BodyModel(schema) => return write!(f, "BodyModel({})", schema.name),
            InputKind::BodyJson => "BodyJson",
            InputKind::BodyBlob => "BodyBlob",
            InputKind::BodyRaw => "BodyRaw",
        };
        f.write_str(name)
    }
}

type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, String> + Send + Sync>;

/// Schema-driven codec for a model body. Registered once per handler; the
/// decode closure is monomorphized over the concrete model type.
#[derive(Clone)]
pub struct ModelSchema {
    pub name: &'static str,
    decode: DecodeFn,
}

impl ModelSchema {
    pub fn of<T>(name: &'static str) -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        ModelSchema {
            name,
            decode: Arc::new(move |bytes| {
                let model: T = serde_json::from_slice(bytes)
                    .map_err(|err| format!("{name}: {err}"))?;
                Ok(Box::new(model) as Box<dyn Any + Send>)
            }),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send>, String> {
        (self.decode)(bytes)
    }
}

/// The ordered input schema of one handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerDescriptor {
    inputs: Vec<InputKind>,
}

impl HandlerDescriptor {
    pub fn new(inputs: Vec<InputKind>) -> Result<Self, ServerError> {
        let mut seen: Vec<&'static str> = Vec::new();
        for input in &inputs {
            let slot = input.slot();
            if seen.contains(&slot) {
                return Err(ServerError::Internal(format!(
                    "handler declares more than one {slot} input"
                )));
            }
            seen.push(slot);
        }
        Ok(HandlerDescriptor { inputs })
    }

    pub fn inputs(&self) -> &[InputKind] {
        &self.inputs
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Raw body bytes wrapped with their negotiated content metadata.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

/// A decoded body, tagged by the kind the route declared.
pub enum BoundBody {
    File(FileUpload),
    Html(String),
    Model(Box<dyn Any + Send>),
    Json(serde_json::Value),
    Blob(Vec<u8>),
    Raw(Vec<u8>),
}

impl std::fmt::Debug for BoundBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoundBody::File(file) => f.debug_tuple("File").field(&file.data.len()).finish(),
            BoundBody::Html(html) => f.debug_tuple("Html").field(&html.len()).finish(),
            BoundBody::Model(_) => f.write_str("Model(..)"),
            BoundBody::Json(value) => f.debug_tuple("Json").field(value).finish(),
            BoundBody::Blob(bytes) => f.debug_tuple("Blob").field(&bytes.len()).finish(),
            BoundBody::Raw(bytes) => f.debug_tuple("Raw").field(&bytes.len()).finish(),
        }
    }
}

/// The fabricated inputs handed to a handler: one optional slot per kind.
#[derive(Debug, Default)]
pub struct HandlerArgs {
    pub headers: Option<Headers>,
    pub cookies: Option<HashMap<String, String>>,
    pub path: Option<HashMap<String, String>>,
    pub query: Option<HashMap<String, String>>,
    pub body: Option<BoundBody>,
}

impl HandlerArgs {
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path.as_ref()?.get(name).map(|v| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.as_ref()?.get(name).map(|v| v.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.as_ref()?.get(name).map(|v| v.as_str())
    }

    /// Take the decoded model body, downcast to its registered type.
    pub fn take_model<T: 'static>(&mut self) -> Option<T> {
        match self.body.take() {
            Some(BoundBody::Model(model)) => match model.downcast::<T>() {
                Ok(model) => Some(*model),
                Err(model) => {
                    self.body = Some(BoundBody::Model(model));
                    None
                }
            },
            other => {
                self.body = other;
                None
            }
        }
    }

    pub fn take_raw_body(&mut self) -> Option<Vec<u8>> {
        match self.body.take() {
            Some(BoundBody::Raw(bytes)) | Some(BoundBody::Blob(bytes)) => Some(bytes),
            other => {
                self.body = other;
                None
            }
        }
    }
}

/// What a handler produced, before response serialization.
#[derive(Debug, Clone)]
pub enum Reply {
    Empty,
    Text(String),
    Html(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Reply {
    /// Serialize a typed model into a JSON reply.
    pub fn model<T: Serialize>(value: &T) -> Result<Reply, ServerError> {
        serde_json::to_value(value)
            .map(Reply::Json)
            .map_err(|err| ServerError::Internal(err.to_string()))
    }

    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            Reply::Empty => None,
            Reply::Text(_) => Some("text/plain"),
            Reply::Html(_) => Some("text/html"),
            Reply::Json(_) => Some("application/json"),
            Reply::Bytes(_) => Some("application/octet-stream"),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Reply::Empty => Vec::new(),
            Reply::Text(text) => text.into_bytes(),
            Reply::Html(html) => html.into_bytes(),
            Reply::Json(value) => serde_json::to_vec(&value).unwrap_or_default(),
            Reply::Bytes(bytes) => bytes,
        }
    }
}

/// Declared response shape for a route.
#[derive(Debug, Clone)]
pub struct ResponseSpec {
    pub default_status: u16,
}

impl Default for ResponseSpec {
    fn default() -> Self {
        ResponseSpec { default_status: 200 }
    }
}

/// A fully registered route: template, methods, handler, input schema,
/// middleware chain, rate limit, and response shaping.
pub struct Route {
    pub template: String,
    pub methods: Vec<Method>,
    pub handler: HandlerFn,
    pub descriptor: HandlerDescriptor,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub limit: Option<Limit>,
    pub response_headers: HashMap<String, String>,
    pub response: ResponseSpec,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("template", &self.template)
            .field("methods", &self.methods)
            .field("inputs", &self.descriptor)
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

impl Route {
    pub fn new(template: impl Into<String>, methods: &[Method]) -> RouteBuilder {
        RouteBuilder {
            template: template.into(),
            methods: methods.to_vec(),
            inputs: Vec::new(),
            middleware: Vec::new(),
            limit: None,
            response_headers: HashMap::new(),
            default_status: 200,
        }
    }

    pub fn get(template: impl Into<String>) -> RouteBuilder {
        Route::new(template, &[Method::Get])
    }

    pub fn post(template: impl Into<String>) -> RouteBuilder {
        Route::new(template, &[Method::Post])
    }
}

pub struct RouteBuilder {
    template: String,
    methods: Vec<Method>,
    inputs: Vec<InputKind>,
    middleware: Vec<Arc<dyn Middleware>>,
    limit: Option<Limit>,
    response_headers: HashMap<String, String>,
    default_status: u16,
}

impl RouteBuilder {
    /// Declare one handler input. Order matters only for documentation;
    /// binding is by kind.
    pub fn input(mut self, input: InputKind) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn limit(mut self, limit: Limit) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn response_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.response_headers.insert(name.into(), value.into());
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.default_status = status;
        self
    }

    /// Attach the handler and finish the route.
    pub fn handler<F, Fut>(self, handler: F) -> Result<Route, ServerError>
    where
        F: Fn(HandlerArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, ServerError>> + Send + 'static,
    {
        let descriptor = HandlerDescriptor::new(self.inputs)?;
        Ok(Route {
            template: self.template,
            methods: self.methods,
            handler: Arc::new(move |args| Box::pin(handler(args))),
            descriptor,
            middleware: self.middleware,
            limit: self.limit,
            response_headers: self.response_headers,
            response: ResponseSpec {
                default_status: self.default_status,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Message {
        message: String,
    }

    #[test]
    fn test_descriptor_rejects_duplicate_kinds() {
        assert!(HandlerDescriptor::new(vec![InputKind::Headers, InputKind::Query]).is_ok());
        assert!(HandlerDescriptor::new(vec![InputKind::Headers, InputKind::Headers]).is_err());
        assert!(
            HandlerDescriptor::new(vec![InputKind::BodyJson, InputKind::BodyRaw]).is_err(),
            "body kinds share one slot"
        );
    }

    #[test]
    fn test_model_schema_decode_and_downcast() {
        let schema = ModelSchema::of::<Message>("Message");
        let decoded = schema.decode(br#"{"message":"hi"}"#).unwrap();

        let mut args = HandlerArgs {
            body: Some(BoundBody::Model(decoded)),
            ..HandlerArgs::default()
        };
        assert_eq!(
            args.take_model::<Message>(),
            Some(Message { message: "hi".to_string() })
        );
    }

    #[test]
    fn test_model_schema_reports_field_errors() {
        let schema = ModelSchema::of::<Message>("Message");
        let err = schema.decode(br#"{"message":1}"#).unwrap_err();
        assert!(err.starts_with("Message:"));
    }

    #[test]
    fn test_reply_content_types() {
        assert_eq!(Reply::Text("x".into()).content_type(), Some("text/plain"));
        assert_eq!(
            Reply::Json(serde_json::json!({})).content_type(),
            Some("application/json")
        );
        assert_eq!(Reply::Empty.content_type(), None);
    }
}
