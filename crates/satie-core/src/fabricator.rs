//! Handler argument fabrication.
//!
//! At request time the fabricator walks the route's declared input schema
//! and binds each kind from the parsed request: headers, cookies, path
//! params, query params, and the body decoded per its declared family.
//! Model validation failures surface as 422; any other decode failure is a
//! plain 400. When the route carries middleware, body decoding is bypassed
//! and the raw bytes flow through the context so a decompressor can run
//! first.

use std::collections::HashMap;

use crate::error::ServerError;
use crate::handler::{BoundBody, FileUpload, HandlerArgs, HandlerDescriptor, InputKind};
use crate::http::Request;

pub struct Fabricator<'a> {
    descriptor: &'a HandlerDescriptor,
}

impl<'a> Fabricator<'a> {
    pub fn new(descriptor: &'a HandlerDescriptor) -> Self {
        Fabricator { descriptor }
    }

    /// Bind the request's parts to the handler's declared inputs.
    pub fn bind(
        &self,
        request: &Request,
        path_params: &HashMap<String, String>,
        has_middleware: bool,
    ) -> Result<HandlerArgs, ServerError> {
        let mut args = HandlerArgs::default();

        for input in self.descriptor.inputs() {
            match input {
                InputKind::Headers => {
                    args.headers = Some(request.headers.clone());
                }
                InputKind::Cookies => {
                    args.cookies = Some(parse_cookies(request.headers.get("cookie")));
                }
                InputKind::Path => {
                    args.path = Some(path_params.clone());
                }
                InputKind::Query => {
                    args.query = Some(parse_query(request.query.as_deref())?);
                }
                body_kind => {
                    args.body = Some(self.bind_body(body_kind, request, has_middleware)?);
                }
            }
        }

        Ok(args)
    }

    fn bind_body(
        &self,
        kind: &InputKind,
        request: &Request,
        has_middleware: bool,
    ) -> Result<BoundBody, ServerError> {
        // Middleware may need to decompress first; hand the raw bytes on.
        if has_middleware {
            return Ok(BoundBody::Raw(request.body.clone()));
        }

        match kind {
            InputKind::BodyFile => Ok(BoundBody::File(FileUpload {
                data: request.body.trim_ascii().to_vec(),
                content_type: request.headers.get("content-type").map(str::to_string),
                content_encoding: request.headers.get("content-encoding").map(str::to_string),
            })),
            InputKind::BodyHtml => {
                let content = String::from_utf8(request.body.trim_ascii().to_vec())
                    .map_err(|_| ServerError::BadRequest("body is not valid UTF-8".to_string()))?;
                Ok(BoundBody::Html(content))
            }
            InputKind::BodyModel(schema) => {
                let model = schema
                    .decode(&request.body)
                    .map_err(ServerError::Unprocessable)?;
                Ok(BoundBody::Model(model))
            }
            InputKind::BodyJson => {
                let value: serde_json::Value = serde_json::from_slice(&request.body)
                    .map_err(|err| ServerError::BadRequest(format!("invalid JSON body: {err}")))?;
                Ok(BoundBody::Json(value))
            }
            InputKind::BodyBlob => Ok(BoundBody::Blob(request.body.trim_ascii().to_vec())),
            InputKind::BodyRaw => Ok(BoundBody::Raw(request.body.trim_ascii().to_vec())),
            _ => Err(ServerError::Internal("non-body input in body slot".to_string())),
        }
    }
}

/// Split a `Cookie` header value into name/value pairs.
fn parse_cookies(header: Option<&str>) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    let Some(header) = header else {
        return cookies;
    };

    for segment in header.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        if let Some((name, value)) = segment.split_once('=') {
            cookies.insert(name.trim().to_string(), value.trim().to_string());
        }
    }

    cookies
}

/// Split a query string on `&` then `=` whenever it is non-empty. Keys are
/// deliberately not percent-decoded.
fn parse_query(query: Option<&str>) -> Result<HashMap<String, String>, ServerError> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return Ok(params);
    };
    if query.is_empty() {
        return Ok(params);
    }

    for pair in query.split('&') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ServerError::BadRequest(format!("malformed query pair: {pair}")))?;
        params.insert(key.to_string(), value.to_string());
    }

    Ok(params)
}
