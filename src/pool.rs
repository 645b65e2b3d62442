//! Pooled HTTP client for the upstream API origin
//!
//! This module owns the one outbound collaborator: connections to the
//! upstream are pooled and reused across requests, and the forwarding step
//! rebuilds each outgoing request from the canonical parsed body instead of
//! assuming a raw byte stream is still available.

use crate::body::RequestBody;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for upstream forwarding
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The upstream connection or exchange failed
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
    /// The outgoing request could not be assembled
    #[error("failed to build upstream request: {0}")]
    RequestBuild(#[from] hyper::http::Error),
    /// The parsed body could not be re-serialized
    #[error("failed to serialize request body: {0}")]
    BodySerialize(#[from] serde_json::Error),
    /// The rewritten URI was rejected
    #[error("invalid upstream URI: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),
}

impl ForwardError {
    /// True when the failure happened talking to the upstream rather than
    /// assembling the request locally
    pub fn is_upstream(&self) -> bool {
        matches!(self, ForwardError::Upstream(_))
    }
}

/// Statistics for the upstream pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests forwarded upstream
    pub total_requests: AtomicU64,
    /// Requests whose body was re-serialized before forwarding
    pub reinjected_bodies: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reinjection(&self) {
        self.reinjected_bodies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_reinjected_bodies(&self) -> u64 {
        self.reinjected_bodies.load(Ordering::Relaxed)
    }
}

/// Configuration for the upstream connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A pooled client forwarding requests to the fixed upstream origin
pub struct UpstreamPool {
    client: Client<HttpConnector, BoxBody<Bytes, Infallible>>,
    origin: Uri,
    /// Host header value for outgoing requests (the upstream's authority)
    authority: HeaderValue,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl UpstreamPool {
    /// Create a pool targeting `origin`, which must carry an authority
    pub fn new(origin: Uri, config: PoolConfig) -> anyhow::Result<Self> {
        let authority = origin
            .authority()
            .ok_or_else(|| anyhow::anyhow!("upstream origin has no authority: {}", origin))?;
        let authority = HeaderValue::from_str(authority.as_str())
            .map_err(|e| anyhow::anyhow!("upstream authority is not a valid Host value: {}", e))?;

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            origin = %origin,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream pool initialized"
        );

        Ok(Self {
            client,
            origin,
            authority,
            stats: Arc::new(PoolStats::default()),
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to the upstream origin.
    ///
    /// The path and query are preserved unchanged; the Host header is
    /// rewritten to the upstream authority; the body (if any) is written from
    /// its canonical parsed form with an exact Content-Length. The upstream
    /// response is relayed as-is, whatever its status.
    pub async fn forward(
        &self,
        parts: hyper::http::request::Parts,
        body: RequestBody,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let uri = upstream_uri(&self.origin, parts.uri.path_and_query().map(|pq| pq.as_str()))?;

        let mut builder = Request::builder().method(parts.method).uri(uri);

        // Copy headers; Host points at the upstream, and the body headers are
        // re-derived below from what will actually be written.
        for (key, value) in parts.headers.iter() {
            if *key == header::HOST
                || *key == header::CONTENT_LENGTH
                || *key == header::CONTENT_TYPE
            {
                continue;
            }
            builder = builder.header(key, value);
        }
        builder = builder.header(header::HOST, self.authority.clone());

        let reinjected = body.is_reserialized();
        let upstream_req = match body.serialize()? {
            None => builder.body(Empty::<Bytes>::new().boxed())?,
            Some((bytes, content_type)) => {
                if let Some(ct) = content_type {
                    builder = builder.header(header::CONTENT_TYPE, ct);
                }
                builder = builder.header(header::CONTENT_LENGTH, bytes.len());
                builder.body(Full::new(bytes).boxed())?
            }
        };

        self.stats.record_request();
        if reinjected {
            self.stats.record_reinjection();
        }

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Splice the incoming path and query onto the upstream origin
fn upstream_uri(
    origin: &Uri,
    path_and_query: Option<&str>,
) -> Result<Uri, hyper::http::uri::InvalidUri> {
    let scheme = origin.scheme_str().unwrap_or("http");
    let authority = origin.authority().map(|a| a.as_str()).unwrap_or_default();
    format!("{}://{}{}", scheme, authority, path_and_query.unwrap_or("/")).parse()
}
