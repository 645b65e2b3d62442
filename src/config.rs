use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the edge server
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Entry documents and static asset root
    #[serde(default)]
    pub site: SiteConfig,

    /// Upstream API origin and forwarding settings
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 80, overridden by the PORT environment variable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    /// Directory entry documents and static assets are served from
    #[serde(default = "default_root")]
    pub root: String,

    /// Entry document served for unmatched paths (default: index.html)
    #[serde(default = "default_entry_file")]
    pub entry_file: String,

    /// Entry document served when the Host matches the auditor domain
    #[serde(default = "default_audit_entry_file")]
    pub audit_entry_file: String,

    /// Hosts containing this substring receive the audit entry document
    #[serde(default = "default_auditor_domain")]
    pub auditor_domain: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            entry_file: default_entry_file(),
            audit_entry_file: default_audit_entry_file(),
            auditor_domain: default_auditor_domain(),
        }
    }
}

impl SiteConfig {
    pub fn root_path(&self) -> &Path {
        Path::new(&self.root)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Origin all API traffic is forwarded to
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Path prefix that selects the API proxy route (forwarded unchanged)
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Maximum request body size in bytes (default: 25 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum idle connections kept per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            api_prefix: default_api_prefix(),
            max_body_bytes: default_max_body_bytes(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl UpstreamConfig {
    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    /// Validate this section, reporting every problem found
    fn validate(&self, errors: &mut Vec<String>) {
        match self.origin.parse::<hyper::Uri>() {
            Ok(uri) => {
                if uri.authority().is_none() {
                    errors.push(format!(
                        "upstream: 'origin' has no authority: {}",
                        self.origin
                    ));
                }
                match uri.scheme_str() {
                    Some("http") => {}
                    _ => errors.push(format!(
                        "upstream: 'origin' must be an http:// URL: {}",
                        self.origin
                    )),
                }
                if !matches!(uri.path(), "" | "/") {
                    errors.push(format!(
                        "upstream: 'origin' must not carry a path: {}",
                        self.origin
                    ));
                }
            }
            Err(e) => errors.push(format!("upstream: invalid 'origin' {}: {}", self.origin, e)),
        }

        if !self.api_prefix.starts_with('/') || self.api_prefix.len() < 2 {
            errors.push(format!(
                "upstream: 'api_prefix' must start with '/' and name a segment: {}",
                self.api_prefix
            ));
        }
        if self.api_prefix.ends_with('/') {
            errors.push(format!(
                "upstream: 'api_prefix' must not end with '/': {}",
                self.api_prefix
            ));
        }

        if self.max_body_bytes == 0 {
            errors.push("upstream: 'max_body_bytes' must be greater than 0".to_string());
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_root() -> String {
    ".".to_string()
}

fn default_entry_file() -> String {
    "index.html".to_string()
}

fn default_audit_entry_file() -> String {
    "audit.html".to_string()
}

fn default_auditor_domain() -> String {
    "crmauditores.libresdeumas.com".to_string()
}

fn default_origin() -> String {
    "http://crmasesorasapi.libresdeumas.com".to_string()
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_max_body_bytes() -> usize {
    25 * 1024 * 1024 // sized for image-bearing client payloads
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides. PORT wins over the configured listen port.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.server.port = p,
                Err(_) => {
                    tracing::warn!(value = %port, "Ignoring unparseable PORT environment variable");
                }
            }
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.site.root.is_empty() {
            errors.push("site: 'root' must not be empty".to_string());
        }
        if self.site.entry_file.is_empty() || self.site.audit_entry_file.is_empty() {
            errors.push("site: entry files must not be empty".to_string());
        }
        if self.site.auditor_domain.is_empty() {
            errors.push("site: 'auditor_domain' must not be empty".to_string());
        }

        self.upstream.validate(&mut errors);

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
