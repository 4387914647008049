//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use url::Url;

/// Root configuration for the live-reload proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ReloaderConfig {
    /// Upstream/public addresses and response interception limits.
    pub proxy: ProxySection,

    /// Reload snippet and connection registry settings.
    pub reload: ReloadSection,

    /// Optional file watching that triggers a broadcast.
    pub watch: WatchSection,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Reverse proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySection {
    /// Upstream server every ordinary request is directed to.
    pub origin: String,

    /// Address clients use to reach the proxy (the proxy binds its host).
    pub public: String,

    /// Target for websocket upgrade requests. Falls back to `origin` when unset.
    pub upgrade_target: Option<String>,

    /// Maximum body size buffered per intercepted response, in bytes.
    pub max_body_size: usize,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            origin: String::new(),
            public: "http://localhost:9090".to_string(),
            upgrade_target: None,
            max_body_size: 8 * 1024 * 1024, // 8MB
        }
    }
}

/// Reload snippet and connection registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReloadSection {
    /// File holding the snippet injected before `</body>`.
    /// The built-in snippet is used when unset.
    pub snippet_path: Option<String>,

    /// Path of the websocket upgrade endpoint.
    pub upgrade_path: String,

    /// Path that triggers a reload broadcast.
    pub reload_path: String,

    /// Path reporting the live connections.
    pub status_path: String,

    /// Run the registry as its own server on this address.
    /// When unset the registry endpoints are served on the public address.
    pub bind_address: Option<String>,

    /// Prefix the `Origin` header of an upgrade request must carry.
    /// Defaults to the public URL's `scheme://host`.
    pub allowed_origin: Option<String>,

    /// How long a single reload delivery may wait on a connection's queue.
    pub delivery_timeout_ms: u64,

    /// Pending reload notifications buffered per connection.
    pub queue_depth: usize,
}

impl Default for ReloadSection {
    fn default() -> Self {
        Self {
            snippet_path: None,
            upgrade_path: "/ws".to_string(),
            reload_path: "/ws/reload".to_string(),
            status_path: "/ws/status".to_string(),
            bind_address: None,
            allowed_origin: None,
            delivery_timeout_ms: 2000,
            queue_depth: 1,
        }
    }
}

/// File watch configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchSection {
    /// Broadcast a reload whenever a watched path changes.
    pub enabled: bool,

    /// Files or directories to watch (recursively).
    pub paths: Vec<String>,

    /// Quiet period before a burst of changes triggers one broadcast.
    pub debounce_ms: u64,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            enabled: false,
            paths: Vec::new(),
            debounce_ms: 200,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9095".to_string(),
        }
    }
}

impl ReloaderConfig {
    /// Parsed origin URL. Only meaningful after validation.
    pub fn origin_url(&self) -> Option<Url> {
        Url::parse(&self.proxy.origin).ok()
    }

    /// Parsed public URL. Only meaningful after validation.
    pub fn public_url(&self) -> Option<Url> {
        Url::parse(&self.proxy.public).ok()
    }

    /// Parsed upgrade target, if one is configured and valid.
    pub fn upgrade_target_url(&self) -> Option<Url> {
        self.proxy
            .upgrade_target
            .as_deref()
            .and_then(|target| Url::parse(target).ok())
    }

    /// Address the public server binds (`host:port` of the public URL).
    pub fn public_bind_address(&self) -> Option<String> {
        let public = self.public_url()?;
        let host = public.host_str()?;
        let port = public.port_or_known_default()?;
        Some(format_authority(host, port))
    }

    /// Websocket URL the injected snippet connects to.
    pub fn upgrade_endpoint(&self) -> Option<String> {
        let public = self.public_url()?;
        let authority = match &self.reload.bind_address {
            Some(addr) => addr.clone(),
            None => {
                let host = public.host_str()?;
                match public.port() {
                    Some(port) => format_authority(host, port),
                    None => host.to_string(),
                }
            }
        };

        Some(format!("ws://{}{}", authority, self.reload.upgrade_path))
    }

    /// `Origin` prefix accepted on upgrade requests.
    pub fn allowed_origin(&self) -> Option<String> {
        if let Some(origin) = &self.reload.allowed_origin {
            return Some(origin.clone());
        }
        let public = self.public_url()?;
        Some(format!("{}://{}", public.scheme(), public.host_str()?))
    }
}

fn format_authority(host: &str, port: u16) -> String {
    // `Url::host_str` keeps the brackets of IPv6 literals
    format!("{}:{}", host, port)
}
