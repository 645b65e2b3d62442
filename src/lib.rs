//! Crmgate - the HTTP edge server in front of the multi-CRM deployment
//!
//! This library provides a single-process edge server that:
//! - Routes `/api/*` traffic (any method) to the upstream CRM API origin
//! - Serves one of two HTML entry documents selected by the Host header,
//!   for the root path and for any path with no matching static asset
//! - Serves static assets from the document root, MIME type by extension
//! - Reads each request body once into a canonical parsed form and
//!   re-serializes it onto the outgoing upstream request
//! - Uses connection pooling for efficient upstream communication

pub mod body;
pub mod config;
pub mod error;
pub mod pool;
pub mod routing;
pub mod server;
pub mod static_files;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
