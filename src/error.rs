//! Error handling and JSON error responses for the edge server

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for locally-generated edge responses
///
/// Upstream responses are relayed verbatim and never rewritten into one of
/// these; the codes only cover failures produced by this process.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeErrorCode {
    /// Request body exceeds the configured size limit
    PayloadTooLarge,
    /// Request body could not be parsed (malformed JSON or form data)
    InvalidBody,
    /// Upstream API origin could not be reached
    UpstreamUnreachable,
    /// No route matched the request
    NotFound,
    /// Internal edge error (entry document unreadable, request rebuild failed)
    InternalError,
}

impl EdgeErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            EdgeErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            EdgeErrorCode::InvalidBody => StatusCode::BAD_REQUEST,
            EdgeErrorCode::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            EdgeErrorCode::NotFound => StatusCode::NOT_FOUND,
            EdgeErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Edge-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            EdgeErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            EdgeErrorCode::InvalidBody => "INVALID_BODY",
            EdgeErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            EdgeErrorCode::NotFound => "NOT_FOUND",
            EdgeErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: EdgeErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: EdgeErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with an X-Edge-Error header
pub fn json_error_response(
    code: EdgeErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Edge-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
