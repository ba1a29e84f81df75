use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

/// Top-level configuration for the ferry frontend.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// HTTP listener configuration
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Translation server configuration
    #[serde(default)]
    pub translation: TranslationConfig,

    /// Session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Proxy tunables
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Control channel (UDP invalidation) configuration
    #[serde(default)]
    pub control: ControlConfig,

    /// Backend health prober ("bulldog") configuration
    #[serde(default)]
    pub bulldog: BulldogConfig,

    /// NFS export → local mountpoint table
    #[serde(default)]
    pub nfs_mounts: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// HTTP listener address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Number of worker threads (0 = one per core)
    #[serde(default)]
    pub workers: usize,

    /// Maximum concurrent client connections per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Opaque tag sent as LISTENER_TAG with every translate request
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    /// Translation server address ("host:port" or unix socket path)
    #[serde(default = "default_translation_addr")]
    pub addr: String,

    /// Translation cache capacity (entries); 0 disables the cache
    #[serde(default = "default_tcache_entries")]
    pub cache_entries: usize,

    /// Write timeout towards the translation server (ms)
    #[serde(default = "default_translation_write_timeout")]
    pub write_timeout_ms: u64,

    /// Read timeout between response packets (ms)
    #[serde(default = "default_translation_read_timeout")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session cookie name template
    #[serde(default = "default_session_cookie")]
    pub cookie: String,

    /// Append a CRC-16 of the Host header (4 hex digits) to the cookie name
    #[serde(default)]
    pub dynamic_session_cookie: bool,

    /// Session idle expiry (seconds)
    #[serde(default = "default_session_idle")]
    pub idle_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Product token for the Server response header
    #[serde(default = "default_product_token")]
    pub product_token: String,

    /// Include upstream error messages in error bodies
    #[serde(default)]
    pub verbose_response: bool,

    /// Request body buffer cap (bytes)
    #[serde(default = "default_body_buffer_size")]
    pub body_buffer_size: usize,

    /// Buffer cap when a response body must be collected for a
    /// transformation or error document (bytes)
    #[serde(default = "default_filter_buffer_size")]
    pub filter_buffer_size: usize,

    /// Upstream connect timeout (ms)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Upstream read timeout (ms)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Upstream write timeout (ms)
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Idle upstream connections kept per backend address
    #[serde(default = "default_pool_limit")]
    pub pool_limit: usize,

    /// Idle upstream connection expiry (seconds)
    #[serde(default = "default_pool_idle")]
    pub pool_idle_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Enable the UDP control listener
    #[serde(default)]
    pub enabled: bool,

    /// UDP listener address
    #[serde(default = "default_control_addr")]
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulldogConfig {
    /// Enable the prober thread
    #[serde(default)]
    pub enabled: bool,

    /// Backend addresses to probe
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Probe interval (seconds)
    #[serde(default = "default_bulldog_interval")]
    pub interval_seconds: u64,

    /// Probe connect timeout (seconds)
    #[serde(default = "default_bulldog_timeout")]
    pub timeout_seconds: u64,

    /// Consecutive successes before a node turns healthy
    #[serde(default = "default_healthy_successes")]
    pub healthy_successes: u32,

    /// Consecutive failures before a node turns unhealthy
    #[serde(default = "default_unhealthy_failures")]
    pub unhealthy_failures: u32,
}

fn default_bulldog_interval() -> u64 {
    5
}
fn default_bulldog_timeout() -> u64 {
    3
}
fn default_healthy_successes() -> u32 {
    2
}
fn default_unhealthy_failures() -> u32 {
    3
}

impl Default for BulldogConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

fn default_http_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}
fn default_control_addr() -> SocketAddr {
    "0.0.0.0:5478".parse().unwrap()
}
fn default_max_connections() -> usize {
    32768
}
fn default_translation_addr() -> String {
    "127.0.0.1:5012".into()
}
fn default_tcache_entries() -> usize {
    65536
}
fn default_translation_write_timeout() -> u64 {
    10_000
}
fn default_translation_read_timeout() -> u64 {
    60_000
}
fn default_session_cookie() -> String {
    "ferry_session".into()
}
fn default_session_idle() -> u64 {
    1200
}
fn default_product_token() -> String {
    concat!("ferry/", env!("CARGO_PKG_VERSION")).into()
}
fn default_body_buffer_size() -> usize {
    1 << 20
}
fn default_filter_buffer_size() -> usize {
    8 << 20
}
fn default_connect_timeout() -> u64 {
    10_000
}
fn default_read_timeout() -> u64 {
    30_000
}
fn default_write_timeout() -> u64 {
    30_000
}
fn default_pool_limit() -> usize {
    16
}
fn default_pool_idle() -> u64 {
    60
}

impl Default for ListenerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}
impl Default for TranslationConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}
impl Default for SessionConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}
impl Default for ProxyConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}
impl Default for ControlConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file, with FERRY_* environment
    /// variable overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("FERRY_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Effective worker count (0 = auto-detect).
    pub fn effective_workers(&self) -> usize {
        if self.listener.workers > 0 {
            self.listener.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert_eq!(config.listener.http_addr.port(), 8080);
        assert_eq!(config.translation.addr, "127.0.0.1:5012");
        assert_eq!(config.session.cookie, "ferry_session");
        assert!(!config.session.dynamic_session_cookie);
        assert_eq!(config.proxy.pool_limit, 16);
        assert!(config.proxy.product_token.starts_with("ferry/"));
    }

    #[test]
    fn yaml_overrides_defaults() {
        let yaml = r#"
listener:
  http_addr: "127.0.0.1:9000"
  max_connections: 100
session:
  cookie: "my_session"
  dynamic_session_cookie: true
proxy:
  verbose_response: true
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listener.http_addr.port(), 9000);
        assert_eq!(config.listener.max_connections, 100);
        assert_eq!(config.session.cookie, "my_session");
        assert!(config.session.dynamic_session_cookie);
        assert!(config.proxy.verbose_response);
        // untouched sections keep their defaults
        assert_eq!(config.translation.cache_entries, 65536);
    }

    #[test]
    fn effective_workers_explicit() {
        let mut config = GatewayConfig::default();
        config.listener.workers = 3;
        assert_eq!(config.effective_workers(), 3);
    }

    #[test]
    fn nfs_mount_table_parses() {
        let yaml = r#"
nfs_mounts:
  "fileserver:/srv/export": "/mnt/fileserver"
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.nfs_mounts.get("fileserver:/srv/export").map(|s| s.as_str()),
            Some("/mnt/fileserver")
        );
    }
}
