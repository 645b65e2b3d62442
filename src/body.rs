//! Size-capped body collection and the canonical parsed-body form
//!
//! The incoming body is read exactly once, into a [`RequestBody`]. The
//! forwarding step always serializes from this representation, so there is no
//! raw-stream/patched-stream split anywhere downstream: JSON and url-encoded
//! form bodies leave as compact JSON, anything else leaves byte-for-byte, and
//! an empty body writes nothing at all.

use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::HeaderValue;
use serde_json::{Map, Value};
use thiserror::Error;

/// Canonical in-memory form of an incoming request body
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// No body bytes at all (e.g. GET requests)
    Empty,
    /// Parsed `application/json` body
    Json(Value),
    /// Parsed `application/x-www-form-urlencoded` body, keyed string values
    Form(Value),
    /// Any other body, kept verbatim together with its declared content type
    Raw {
        bytes: Bytes,
        content_type: Option<HeaderValue>,
    },
}

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds the {limit}-byte limit")]
    TooLarge { limit: usize },
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("request body is not a valid url-encoded form: {0}")]
    InvalidForm(String),
    #[error("failed to read request body: {0}")]
    Read(String),
}

enum BodyKind {
    Json,
    Form,
    Other,
}

impl RequestBody {
    /// Read a request body to completion, enforcing the size limit while
    /// reading, and parse it according to the declared content type.
    pub async fn collect<B>(
        body: B,
        content_type: Option<&HeaderValue>,
        limit: usize,
    ) -> Result<Self, BodyError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let collected = Limited::new(body, limit).collect().await.map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                BodyError::TooLarge { limit }
            } else {
                BodyError::Read(e.to_string())
            }
        })?;
        let bytes = collected.to_bytes();

        if bytes.is_empty() {
            return Ok(RequestBody::Empty);
        }

        match classify_content_type(content_type) {
            BodyKind::Json => Ok(RequestBody::Json(serde_json::from_slice(&bytes)?)),
            BodyKind::Form => Ok(RequestBody::Form(parse_form(&bytes)?)),
            BodyKind::Other => Ok(RequestBody::Raw {
                bytes,
                content_type: content_type.cloned(),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }

    /// Whether the outgoing bytes are a re-serialization rather than the
    /// original ones
    pub fn is_reserialized(&self) -> bool {
        matches!(self, RequestBody::Json(_) | RequestBody::Form(_))
    }

    /// Produce the bytes and Content-Type the upstream request should carry.
    ///
    /// `None` means the request goes out without a body and without any
    /// injected headers. Parsed bodies re-serialize to compact JSON; raw
    /// bodies keep their original content type (which may itself be absent).
    pub fn serialize(&self) -> Result<Option<(Bytes, Option<HeaderValue>)>, serde_json::Error> {
        match self {
            RequestBody::Empty => Ok(None),
            RequestBody::Json(value) | RequestBody::Form(value) => {
                let bytes = Bytes::from(serde_json::to_vec(value)?);
                Ok(Some((
                    bytes,
                    Some(HeaderValue::from_static("application/json")),
                )))
            }
            RequestBody::Raw {
                bytes,
                content_type,
            } => Ok(Some((bytes.clone(), content_type.clone()))),
        }
    }
}

fn classify_content_type(content_type: Option<&HeaderValue>) -> BodyKind {
    let Some(essence) = content_type
        .and_then(|ct| ct.to_str().ok())
        .map(|s| s.split(';').next().unwrap_or(s).trim().to_ascii_lowercase())
    else {
        return BodyKind::Other;
    };

    match essence.as_str() {
        "application/json" => BodyKind::Json,
        "application/x-www-form-urlencoded" => BodyKind::Form,
        _ => BodyKind::Other,
    }
}

/// Decode a url-encoded form into a JSON object with string values
fn parse_form(bytes: &[u8]) -> Result<Value, BodyError> {
    let text =
        std::str::from_utf8(bytes).map_err(|e| BodyError::InvalidForm(e.to_string()))?;

    let mut map = Map::new();
    for pair in text.split('&').filter(|p| !p.is_empty()) {
        let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(
            decode_component(raw_key)?,
            Value::String(decode_component(raw_value)?),
        );
    }
    Ok(Value::Object(map))
}

fn decode_component(raw: &str) -> Result<String, BodyError> {
    // '+' encodes a space in form data; percent-decoding alone misses it
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| BodyError::InvalidForm(e.to_string()))
}
