//! Static asset and entry document serving
//!
//! Files are served verbatim from the document root, MIME type by extension.
//! There is no directory listing and no cache-header policy beyond defaults;
//! a path that does not resolve to a regular file inside the root yields
//! nothing here and falls through to the entry-page catch-all.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Content-Type by file extension
pub fn content_type_for(extension: Option<&str>) -> &'static str {
    match extension {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js" | "mjs") => "application/javascript",
        Some("json" | "map") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Resolve a request path to a regular file inside the document root.
///
/// The resolved path is canonicalized and must stay under the canonical root,
/// so `..` segments and symlinks pointing outside never escape it.
async fn resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = request_path.trim_start_matches('/');
    if relative.is_empty() {
        return None;
    }

    // Reject traversal segments before touching the filesystem
    let candidate = Path::new(relative);
    if candidate
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        warn!(path = request_path, "Rejected non-normal path components");
        return None;
    }

    let root_canonical = match fs::canonicalize(root).await {
        Ok(p) => p,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "Document root not accessible");
            return None;
        }
    };

    // Missing files are the common case (they fall through to the entry page)
    let resolved = fs::canonicalize(root.join(candidate)).await.ok()?;
    if !resolved.starts_with(&root_canonical) {
        warn!(path = request_path, "Path escapes the document root");
        return None;
    }

    let meta = fs::metadata(&resolved).await.ok()?;
    meta.is_file().then_some(resolved)
}

/// Serve a static asset, or `None` when the path has no matching file
pub async fn serve(
    root: &Path,
    request_path: &str,
    is_head: bool,
) -> Option<Response<BoxBody<Bytes, hyper::Error>>> {
    let file_path = resolve(root, request_path).await?;

    let content = fs::read(&file_path).await.ok()?;

    let content_type = content_type_for(file_path.extension().and_then(|e| e.to_str()));
    debug!(path = %file_path.display(), bytes = content.len(), content_type, "Serving static asset");

    Some(file_response(content, content_type, is_head))
}

/// Serve one of the two entry documents from the document root.
///
/// A missing or unreadable entry document is the one genuine server error
/// this process can produce on the static side.
pub async fn serve_entry(
    root: &Path,
    entry_file: &str,
    is_head: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, std::io::Error> {
    let path = root.join(entry_file);
    let content = fs::read(&path).await?;
    debug!(path = %path.display(), bytes = content.len(), "Serving entry document");
    Ok(file_response(content, "text/html; charset=utf-8", is_head))
}

fn file_response(
    content: Vec<u8>,
    content_type: &'static str,
    is_head: bool,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let length = content.len();
    let body = if is_head {
        Bytes::new()
    } else {
        Bytes::from(content)
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .header(hyper::header::CONTENT_LENGTH, length)
        .body(Full::new(body).map_err(|e| match e {}).boxed())
        .expect("valid response with static headers")
}
