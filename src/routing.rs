//! Per-request route classification
//!
//! Every request is classified independently into one of four routes; the
//! decision is a pure function of method, path, and the static configuration,
//! with no cross-request state. The root path is decided before any static
//! lookup so that an auditor host gets the audit document at `/` even though
//! the default entry file exists on disk.

use hyper::{Method, Request};

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// What to do with an incoming request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Forward to the upstream API origin, path prefix preserved
    Api,
    /// Serve the Host-selected entry document
    EntryPage,
    /// Probe the document root; serve the file or fall back to the entry page
    StaticAsset,
    /// No route matches this method outside the API prefix
    NoRoute,
}

/// Which of the two entry documents a request resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDocument {
    Default,
    Audit,
}

/// Classify a request by method and path.
///
/// The API prefix matches the way a mounted middleware would: `/api` and
/// `/api/...` are proxied, `/apifoo` is not. Any method is allowed through
/// the proxy; everything else only exists for GET and HEAD.
pub fn classify(method: &Method, path: &str, api_prefix: &str) -> RouteDecision {
    if is_api_path(path, api_prefix) {
        return RouteDecision::Api;
    }

    if !matches!(*method, Method::GET | Method::HEAD) {
        return RouteDecision::NoRoute;
    }

    if path == "/" {
        return RouteDecision::EntryPage;
    }

    RouteDecision::StaticAsset
}

fn is_api_path(path: &str, api_prefix: &str) -> bool {
    match path.strip_prefix(api_prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Select the entry document for a request host.
///
/// A host containing the auditor-domain substring gets the audit document;
/// anything else, including a missing host, gets the default one.
pub fn entry_for_host(host: Option<&str>, auditor_domain: &str) -> EntryDocument {
    match host {
        Some(h) if h.contains(auditor_domain) => EntryDocument::Audit,
        _ => EntryDocument::Default,
    }
}

/// Extract and normalize the request host.
///
/// Reads the Host header, falling back to the URI authority for HTTP/2
/// requests that carry `:authority` instead. The port is stripped and the
/// name lowercased; hostnames with invalid characters are discarded so they
/// never reach the logs verbatim.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))?;

    // Strip port if present
    let hostname = raw.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}
