//! The edge server: listener, connection wiring, and request dispatch
//!
//! Each connection is handled independently; the routing decision is a pure
//! function of headers and path, so there is no shared mutable state beyond
//! the immutable configuration and the upstream connection pool.

use crate::body::{BodyError, RequestBody};
use crate::config::Config;
use crate::error::{json_error_response, EdgeErrorCode};
use crate::pool::{PoolConfig, UpstreamPool};
use crate::routing::{self, EntryDocument, RouteDecision};
use crate::static_files;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// The edge server in front of the CRM sites and their API origin
pub struct EdgeServer {
    bind_addr: SocketAddr,
    config: Arc<Config>,
    pool: Arc<UpstreamPool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl EdgeServer {
    pub fn new(
        bind_addr: SocketAddr,
        config: Arc<Config>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let origin: hyper::Uri = config
            .upstream
            .origin
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid upstream origin '{}': {}", config.upstream.origin, e))?;

        let pool_config = PoolConfig {
            max_idle_per_host: config.upstream.pool_max_idle_per_host,
            idle_timeout: config.upstream.pool_idle_timeout(),
        };
        let pool = Arc::new(UpstreamPool::new(origin, pool_config)?);

        Ok(Self {
            bind_addr,
            config,
            pool,
            shutdown_rx,
        })
    }

    /// Get the upstream pool (for statistics)
    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Edge server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let config = Arc::clone(&self.config);
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, config, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let stats = self.pool.stats();
                        info!(
                            forwarded = stats.get_total_requests(),
                            reinjected_bodies = stats.get_reinjected_bodies(),
                            "Edge server shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: Arc<Config>,
    pool: Arc<UpstreamPool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let config = Arc::clone(&config);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, config, pool, addr).await }
    });

    // auto::Builder serves both HTTP/1.1 and HTTP/2 (h2c) on the same port
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    config: Arc<Config>,
    pool: Arc<UpstreamPool>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Oversized bodies are refused up front, before proxying or serving
    if announced_length_exceeds(&req, config.upstream.max_body_bytes) {
        warn!(request_id, "Rejecting request with oversized announced body");
        return Ok(json_error_response(
            EdgeErrorCode::PayloadTooLarge,
            format!(
                "Request body exceeds the {}-byte limit",
                config.upstream.max_body_bytes
            ),
        ));
    }

    let host = routing::request_host(&req);
    let decision = routing::classify(req.method(), req.uri().path(), &config.upstream.api_prefix);

    debug!(
        method = %req.method(),
        uri = %req.uri(),
        host = host.as_deref().unwrap_or("-"),
        decision = ?decision,
        request_id,
        "Incoming request"
    );

    match decision {
        RouteDecision::Api => proxy_api(req, &config, &pool, client_addr, host, &request_id).await,
        RouteDecision::EntryPage => {
            let is_head = *req.method() == Method::HEAD;
            Ok(entry_page(&config, host.as_deref(), is_head).await)
        }
        RouteDecision::StaticAsset => {
            let is_head = *req.method() == Method::HEAD;
            match static_files::serve(config.site.root_path(), req.uri().path(), is_head).await {
                Some(response) => Ok(response),
                // Refresh support: unmatched paths resolve to the entry page,
                // selected by the same host check the root route uses
                None => Ok(entry_page(&config, host.as_deref(), is_head).await),
            }
        }
        RouteDecision::NoRoute => Ok(json_error_response(
            EdgeErrorCode::NotFound,
            format!("No route for {} {}", req.method(), req.uri().path()),
        )),
    }
}

/// Forward an API request upstream, body re-serialized from its parsed form
async fn proxy_api(
    req: Request<Incoming>,
    config: &Config,
    pool: &UpstreamPool,
    client_addr: SocketAddr,
    host: Option<String>,
    request_id: &str,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let (mut parts, incoming) = req.into_parts();

    let content_type = parts.headers.get(hyper::header::CONTENT_TYPE).cloned();
    let body = match RequestBody::collect(
        incoming,
        content_type.as_ref(),
        config.upstream.max_body_bytes,
    )
    .await
    {
        Ok(body) => body,
        Err(e @ BodyError::TooLarge { .. }) => {
            warn!(request_id, error = %e, "Rejecting oversized request body");
            return Ok(json_error_response(
                EdgeErrorCode::PayloadTooLarge,
                e.to_string(),
            ));
        }
        Err(e) => {
            warn!(request_id, error = %e, "Rejecting unreadable request body");
            return Ok(json_error_response(EdgeErrorCode::InvalidBody, e.to_string()));
        }
    };

    // Forwarded headers are overwritten rather than appended; this edge is
    // assumed to be the first trusted hop.
    let headers = &mut parts.headers;
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(value) = host.as_deref().and_then(|h| HeaderValue::from_str(h).ok()) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    match pool.forward(parts, body).await {
        Ok(response) => {
            debug!(request_id, status = %response.status(), "Relayed upstream response");
            Ok(response)
        }
        Err(e) if e.is_upstream() => {
            error!(request_id, error = %e, "Failed to reach upstream");
            Ok(json_error_response(
                EdgeErrorCode::UpstreamUnreachable,
                "Failed to reach the API origin",
            ))
        }
        Err(e) => {
            error!(request_id, error = %e, "Failed to build upstream request");
            Ok(json_error_response(
                EdgeErrorCode::InternalError,
                "Failed to assemble upstream request",
            ))
        }
    }
}

/// Serve the Host-selected entry document
async fn entry_page(
    config: &Config,
    host: Option<&str>,
    is_head: bool,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let file = match routing::entry_for_host(host, &config.site.auditor_domain) {
        EntryDocument::Audit => &config.site.audit_entry_file,
        EntryDocument::Default => &config.site.entry_file,
    };

    match static_files::serve_entry(config.site.root_path(), file, is_head).await {
        Ok(response) => response,
        Err(e) => {
            error!(file = %file, error = %e, "Failed to read entry document");
            json_error_response(EdgeErrorCode::InternalError, "Entry document unavailable")
        }
    }
}

/// True when the declared Content-Length alone already exceeds the limit
fn announced_length_exceeds<B>(req: &Request<B>, max: usize) -> bool {
    req.headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .is_some_and(|len| len > max as u64)
}
