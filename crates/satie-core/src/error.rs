//! Error taxonomy for the request pipeline.
//!
//! Every failure a request can hit maps to exactly one [`ServerError`]
//! variant, and every variant maps to exactly one HTTP status. Error bodies
//! are JSON: a single `{"error": …}` object, or an array of them for route
//! misses and accumulated middleware errors.

use thiserror::Error;

/// Standard error type for the Satie engine.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    #[error("Bad Request - {0}")]
    BadRequest(String),

    #[error("Request Timeout - {0}")]
    Timeout(String),

    #[error("Not Found - {0}")]
    NotFound(String),

    #[error("Method Not Allowed - {0}")]
    MethodNotAllowed(String),

    #[error("Unprocessable Content - {0}")]
    Unprocessable(String),

    #[error("Too Many Requests - {0}")]
    TooManyRequests(String),

    #[error("Service Overloaded - {0}")]
    Overloaded(String),

    #[error("Internal Error - {0}")]
    Internal(String),
}

impl ServerError {
    /// The HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::BadRequest(_) => 400,
            ServerError::Timeout(_) => 408,
            ServerError::NotFound(_) => 404,
            ServerError::MethodNotAllowed(_) => 405,
            ServerError::Unprocessable(_) => 422,
            ServerError::TooManyRequests(_) => 429,
            ServerError::Overloaded(_) => 503,
            ServerError::Internal(_) => 500,
        }
    }

    /// The reason phrase written on the status line.
    pub fn reason(&self) -> &'static str {
        match self {
            ServerError::BadRequest(_) => "Bad Request",
            ServerError::Timeout(_) => "Request Timeout",
            ServerError::NotFound(_) => "Not Found",
            ServerError::MethodNotAllowed(_) => "Method Not Allowed",
            ServerError::Unprocessable(_) => "Unprocessable Content",
            ServerError::TooManyRequests(_) => "Too Many Requests",
            ServerError::Overloaded(_) => "Service Unavailable",
            ServerError::Internal(_) => "Internal Server Error",
        }
    }

    /// Serialize as the standard single-object error body.
    pub fn to_body(&self) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({ "error": self.to_string() }))
            .unwrap_or_else(|_| b"{\"error\":\"serialization failure\"}".to_vec())
    }

    /// Serialize a list of error messages as the array-shaped body used for
    /// route misses and middleware error accumulation.
    pub fn list_body(messages: &[String]) -> Vec<u8> {
        let entries: Vec<serde_json::Value> = messages
            .iter()
            .map(|message| serde_json::json!({ "error": message }))
            .collect();
        serde_json::to_vec(&entries).unwrap_or_else(|_| b"[]".to_vec())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServerError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(ServerError::Timeout("x".into()).status_code(), 408);
        assert_eq!(ServerError::NotFound("x".into()).status_code(), 404);
        assert_eq!(ServerError::MethodNotAllowed("x".into()).status_code(), 405);
        assert_eq!(ServerError::Unprocessable("x".into()).status_code(), 422);
        assert_eq!(ServerError::TooManyRequests("x".into()).status_code(), 429);
        assert_eq!(ServerError::Overloaded("x".into()).status_code(), 503);
        assert_eq!(ServerError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn test_list_body_shape() {
        let body = ServerError::list_body(&["No route matching /missing".to_string()]);
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"[{"error":"No route matching /missing"}]"#
        );
    }
}
