//! Integration tests for the crmgate edge server
//!
//! Each test drives a real listener over raw TCP, with a tiny in-process
//! upstream that echoes back what it received so forwarding behavior can be
//! asserted from the outside.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crmgate::config::Config;
use crmgate::server::EdgeServer;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const ASESORAS_HOST: &str = "crmasesoras.libresdeumas.com";
const AUDITORES_HOST: &str = "crmauditores.libresdeumas.com";

const INDEX_DOC: &[u8] = b"<html><body>CRM Asesoras</body></html>";
const AUDIT_DOC: &[u8] = b"<html><body>CRM Auditores</body></html>";

/// A running edge server plus the handles that keep it alive
struct TestEdge {
    addr: SocketAddr,
    _shutdown_tx: watch::Sender<bool>,
    _root: tempfile::TempDir,
}

/// Spawn an upstream that answers every request with a JSON echo of what it
/// saw: method, path+query, body headers, request id, and the body bytes.
async fn spawn_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let task_hits = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let hits = Arc::clone(&task_hits);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);

                        let (parts, body) = req.into_parts();
                        let header = |name: &str| {
                            parts
                                .headers
                                .get(name)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("")
                                .to_string()
                        };
                        let mut reply = serde_json::json!({
                            "method": parts.method.as_str(),
                            "path": parts
                                .uri
                                .path_and_query()
                                .map(|pq| pq.as_str())
                                .unwrap_or(""),
                            "host": header("host"),
                            "content_type": header("content-type"),
                            "content_length": header("content-length"),
                            "request_id": header("x-request-id"),
                            "forwarded_host": header("x-forwarded-host"),
                        });
                        let body = body.collect().await.unwrap().to_bytes();
                        reply["body"] = serde_json::Value::String(
                            String::from_utf8_lossy(&body).into_owned(),
                        );

                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(200)
                                .header("content-type", "application/json")
                                .body(Full::new(Bytes::from(reply.to_string())))
                                .unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    (addr, hits)
}

fn write_file(dir: &Path, name: &str, contents: &[u8]) {
    if let Some(parent) = Path::new(name).parent() {
        std::fs::create_dir_all(dir.join(parent)).unwrap();
    }
    std::fs::write(dir.join(name), contents).unwrap();
}

/// Start an edge server on an ephemeral port, serving a fresh document root
/// and forwarding to `upstream`
async fn spawn_edge(upstream: SocketAddr) -> TestEdge {
    let root = tempfile::tempdir().unwrap();
    write_file(root.path(), "index.html", INDEX_DOC);
    write_file(root.path(), "audit.html", AUDIT_DOC);
    write_file(root.path(), "js/app.js", b"console.log('crm');");

    let mut config = Config::default();
    config.site.root = root.path().to_string_lossy().into_owned();
    config.upstream.origin = format!("http://{}", upstream);
    config.upstream.max_body_bytes = 1024 * 1024;
    config.validate().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = EdgeServer::new(bind_addr, Arc::new(config), shutdown_rx).unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestEdge {
        addr,
        _shutdown_tx: shutdown_tx,
        _root: root,
    }
}

/// Write a raw HTTP/1.1 request and read the whole response
async fn http_request(addr: SocketAddr, raw: String) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn http_get_with_host(addr: SocketAddr, path: &str, host: &str) -> String {
    http_request(
        addr,
        format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"),
    )
    .await
}

async fn http_send_body(
    addr: SocketAddr,
    method: &str,
    path: &str,
    host: &str,
    content_type: &str,
    body: &str,
) -> String {
    http_request(
        addr,
        format!(
            "{method} {path} HTTP/1.1\r\nHost: {host}\r\nContent-Type: {content_type}\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ),
    )
    .await
}

fn body_of(response: &str) -> &str {
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("")
}

// ============================================================================
// Domain-based entry routing
// ============================================================================

#[tokio::test]
async fn test_default_host_gets_default_entry_document() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    let response = http_get_with_host(edge.addr, "/", ASESORAS_HOST).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(body_of(&response).as_bytes(), INDEX_DOC);
}

#[tokio::test]
async fn test_auditor_host_gets_audit_entry_document() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    let response = http_get_with_host(edge.addr, "/", AUDITORES_HOST).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(body_of(&response).as_bytes(), AUDIT_DOC);
}

#[tokio::test]
async fn test_unmatched_paths_resolve_to_the_entry_document() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    // Client-side routes and refreshes land on arbitrary paths
    let response = http_get_with_host(edge.addr, "/dashboard", AUDITORES_HOST).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(body_of(&response).as_bytes(), AUDIT_DOC);

    let response = http_get_with_host(edge.addr, "/clients/42/notes", ASESORAS_HOST).await;
    assert_eq!(body_of(&response).as_bytes(), INDEX_DOC);
}

#[tokio::test]
async fn test_missing_host_falls_back_to_default_document() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    // HTTP/1.0 is the one way to reach the server without a Host header
    let response = http_request(
        edge.addr,
        "GET /dashboard HTTP/1.0\r\n\r\n".to_string(),
    )
    .await;
    assert_eq!(body_of(&response).as_bytes(), INDEX_DOC);
}

#[tokio::test]
async fn test_entry_documents_are_selected_per_request() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    let (audit, default) = tokio::join!(
        http_get_with_host(edge.addr, "/panel", AUDITORES_HOST),
        http_get_with_host(edge.addr, "/panel", ASESORAS_HOST),
    );
    assert_eq!(body_of(&audit).as_bytes(), AUDIT_DOC);
    assert_eq!(body_of(&default).as_bytes(), INDEX_DOC);
}

// ============================================================================
// Static assets
// ============================================================================

#[tokio::test]
async fn test_static_asset_served_with_mime_type() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    let response = http_get_with_host(edge.addr, "/js/app.js", ASESORAS_HOST).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("content-type: application/javascript")
        || response.contains("Content-Type: application/javascript"));
    assert_eq!(body_of(&response), "console.log('crm');");
}

#[tokio::test]
async fn test_entry_files_remain_fetchable_by_name() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    // Asking for index.html by name on the auditor host is a static lookup,
    // not an entry-page decision
    let response = http_get_with_host(edge.addr, "/index.html", AUDITORES_HOST).await;
    assert_eq!(body_of(&response).as_bytes(), INDEX_DOC);
}

#[tokio::test]
async fn test_traversal_attempts_fall_back_to_entry_page() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    let response = http_get_with_host(edge.addr, "/../secret.txt", ASESORAS_HOST).await;
    assert_eq!(body_of(&response).as_bytes(), INDEX_DOC);
}

#[tokio::test]
async fn test_non_get_outside_api_is_not_found() {
    let (upstream, hits) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    let response = http_send_body(
        edge.addr,
        "POST",
        "/dashboard",
        ASESORAS_HOST,
        "application/json",
        "{}",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("NOT_FOUND"));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

// ============================================================================
// API reverse proxy
// ============================================================================

#[tokio::test]
async fn test_api_path_prefix_and_query_are_preserved() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    let response =
        http_get_with_host(edge.addr, "/api/stats?asesora=Ana", ASESORAS_HOST).await;
    assert!(response.starts_with("HTTP/1.1 200"));

    let echo: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(echo["method"], "GET");
    assert_eq!(echo["path"], "/api/stats?asesora=Ana");
}

#[tokio::test]
async fn test_json_body_is_reinjected_with_exact_length() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    // Whitespace in the incoming body disappears in the re-serialization
    let response = http_send_body(
        edge.addr,
        "POST",
        "/api/clients",
        ASESORAS_HOST,
        "application/json",
        "{ \"Nombre\" : \"Ana\" }",
    )
    .await;
    let echo: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();

    assert_eq!(echo["path"], "/api/clients");
    assert_eq!(echo["content_type"], "application/json");
    assert_eq!(echo["body"], r#"{"Nombre":"Ana"}"#);
    assert_eq!(echo["content_length"], r#"{"Nombre":"Ana"}"#.len().to_string());
}

#[tokio::test]
async fn test_form_body_arrives_upstream_as_json() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    let response = http_send_body(
        edge.addr,
        "POST",
        "/api/login-audit",
        AUDITORES_HOST,
        "application/x-www-form-urlencoded",
        "nombre=Ana+Mar%C3%ADa&password=1234",
    )
    .await;
    let echo: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();

    assert_eq!(echo["content_type"], "application/json");
    let forwarded: serde_json::Value =
        serde_json::from_str(echo["body"].as_str().unwrap()).unwrap();
    assert_eq!(forwarded["nombre"], "Ana María");
    assert_eq!(forwarded["password"], "1234");
}

#[tokio::test]
async fn test_bodyless_request_is_forwarded_without_injection() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    let response = http_get_with_host(edge.addr, "/api/agents", ASESORAS_HOST).await;
    let echo: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();

    assert_eq!(echo["content_type"], "");
    assert_eq!(echo["body"], "");
}

#[tokio::test]
async fn test_host_header_is_rewritten_to_the_upstream() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    let response = http_get_with_host(edge.addr, "/api/agents", ASESORAS_HOST).await;
    let echo: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();

    assert_eq!(echo["host"], upstream.to_string());
    assert_eq!(echo["forwarded_host"], ASESORAS_HOST);
}

#[tokio::test]
async fn test_client_request_id_is_preserved() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    let response = http_request(
        edge.addr,
        format!(
            "GET /api/agents HTTP/1.1\r\nHost: {ASESORAS_HOST}\r\n\
             X-Request-Id: test-trace-1\r\nConnection: close\r\n\r\n"
        ),
    )
    .await;
    let echo: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(echo["request_id"], "test-trace-1");
}

#[tokio::test]
async fn test_generated_request_id_reaches_the_upstream() {
    let (upstream, _) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    let response = http_get_with_host(edge.addr, "/api/agents", ASESORAS_HOST).await;
    let echo: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert!(!echo["request_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_json_body_is_rejected_before_forwarding() {
    let (upstream, hits) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    let response = http_send_body(
        edge.addr,
        "POST",
        "/api/clients",
        ASESORAS_HOST,
        "application/json",
        "{not json",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400"));
    assert!(response.contains("INVALID_BODY"));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_oversized_body_is_rejected_before_forwarding() {
    let (upstream, hits) = spawn_upstream().await;
    let edge = spawn_edge(upstream).await;

    // Announce 30 MB; the edge must refuse without reading or forwarding
    let response = http_request(
        edge.addr,
        format!(
            "POST /api/clients HTTP/1.1\r\nHost: {ASESORAS_HOST}\r\n\
             Content-Type: application/json\r\nContent-Length: 31457280\r\n\
             Connection: close\r\n\r\n"
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 413"));
    assert!(response.contains("PAYLOAD_TOO_LARGE"));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreachable_upstream_is_a_bad_gateway() {
    // Bind and immediately drop a listener so the port is unoccupied
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let edge = spawn_edge(dead_addr).await;

    let response = http_get_with_host(edge.addr, "/api/agents", ASESORAS_HOST).await;
    assert!(response.starts_with("HTTP/1.1 502"));
    assert!(response.contains("UPSTREAM_UNREACHABLE"));
}
