/// Proxy configuration
///
/// Loaded once at startup from a JSON file; every field has a default so a
/// minimal file only needs the upstream host and user. Validation failures
/// are fatal at startup.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub backups: Vec<UpstreamConfig>,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub vardiff: VarDiffSection,
    #[serde(default)]
    pub ratelimit: RateLimitSection,
    #[serde(default)]
    pub compat: CompatSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Read deadline before the miner completes its handshake.
    #[serde(default = "default_client_idle_ms")]
    pub client_idle_ms: u64,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_buf")]
    pub read_buf: usize,
    #[serde(default = "default_buf")]
    pub write_buf: usize,
    /// Grace window before the upstream session is torn down once the last
    /// miner disconnects.
    #[serde(default = "default_idle_grace_secs")]
    pub idle_grace_secs: u64,
    #[serde(default)]
    pub tls: TlsSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default)]
    pub socks_proxy: SocksSection,
}

impl UpstreamConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_upstream_port(),
            user: String::new(),
            pass: String::new(),
            tls: false,
            insecure_skip_verify: false,
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            socks_proxy: SocksSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SocksSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HttpSection {
    /// Empty string disables the HTTP endpoints.
    #[serde(default)]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VarDiffSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_target_seconds")]
    pub target_seconds: u64,
    #[serde(default = "default_min_diff")]
    pub min_diff: u64,
    #[serde(default = "default_max_diff")]
    pub max_diff: u64,
    #[serde(default = "default_adjust_every_ms")]
    pub adjust_every_ms: u64,
    /// Retargets inside this band around the ideal rate are suppressed.
    #[serde(default = "default_variance")]
    pub variance: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_per_ip")]
    pub max_connections_per_ip: usize,
    #[serde(default = "default_max_per_minute")]
    pub max_connections_per_minute: usize,
    #[serde(default = "default_ban_secs")]
    pub ban_duration_seconds: u64,
    #[serde(default = "default_cleanup_secs")]
    pub cleanup_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CompatSection {
    /// When true only `mining.notify` and `mining.set_difficulty` are
    /// broadcast; vendor `mining.*` notifications are dropped.
    #[serde(default)]
    pub strict_broadcast: bool,
}

fn default_listen() -> String {
    "0.0.0.0:3333".to_string()
}
fn default_client_idle_ms() -> u64 {
    180_000
}
fn default_max_clients() -> usize {
    1000
}
fn default_buf() -> usize {
    4096
}
fn default_idle_grace_secs() -> u64 {
    15
}
fn default_upstream_port() -> u16 {
    3333
}
fn default_backoff_min_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_target_seconds() -> u64 {
    15
}
fn default_min_diff() -> u64 {
    1
}
fn default_max_diff() -> u64 {
    65_536
}
fn default_adjust_every_ms() -> u64 {
    60_000
}
fn default_variance() -> f64 {
    0.25
}
fn default_max_per_ip() -> usize {
    100
}
fn default_max_per_minute() -> usize {
    60
}
fn default_ban_secs() -> u64 {
    300
}
fn default_cleanup_secs() -> u64 {
    60
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            client_idle_ms: default_client_idle_ms(),
            max_clients: default_max_clients(),
            read_buf: default_buf(),
            write_buf: default_buf(),
            idle_grace_secs: default_idle_grace_secs(),
            tls: TlsSection::default(),
        }
    }
}

impl Default for VarDiffSection {
    fn default() -> Self {
        Self {
            enabled: false,
            target_seconds: default_target_seconds(),
            min_diff: default_min_diff(),
            max_diff: default_max_diff(),
            adjust_every_ms: default_adjust_every_ms(),
            variance: default_variance(),
        }
    }
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_connections_per_ip: default_max_per_ip(),
            max_connections_per_minute: default_max_per_minute(),
            ban_duration_seconds: default_ban_secs(),
            cleanup_interval_seconds: default_cleanup_secs(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Config = serde_json::from_str(text).context("parsing config file")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream.host.is_empty() {
            bail!("upstream.host is required");
        }
        if self.upstream.user.is_empty() {
            bail!("upstream.user is required");
        }
        if self.upstream.backoff_max_ms < self.upstream.backoff_min_ms {
            bail!(
                "upstream.backoff_max_ms ({}) must be >= backoff_min_ms ({})",
                self.upstream.backoff_max_ms,
                self.upstream.backoff_min_ms
            );
        }
        for (i, b) in self.backups.iter().enumerate() {
            if b.host.is_empty() {
                bail!("backups[{i}].host is required");
            }
            if b.backoff_max_ms < b.backoff_min_ms {
                bail!("backups[{i}].backoff_max_ms must be >= backoff_min_ms");
            }
        }
        if self.proxy.tls.enabled
            && (self.proxy.tls.cert_file.is_empty() || self.proxy.tls.key_file.is_empty())
        {
            bail!("proxy.tls requires cert_file and key_file");
        }
        if self.upstream.socks_proxy.enabled
            && (self.upstream.socks_proxy.host.is_empty() || self.upstream.socks_proxy.port == 0)
        {
            bail!("upstream.socks_proxy requires host and port");
        }
        if self.vardiff.enabled && self.vardiff.max_diff < self.vardiff.min_diff {
            bail!("vardiff.max_diff must be >= vardiff.min_diff");
        }
        Ok(())
    }

    /// Ordered dial targets: primary first, then backups.
    pub fn upstream_targets(&self) -> Vec<UpstreamConfig> {
        let mut targets = Vec::with_capacity(1 + self.backups.len());
        targets.push(self.upstream.clone());
        targets.extend(self.backups.iter().cloned());
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg = Config::from_json(
            r#"{"upstream": {"host": "pool.example.com", "user": "wallet.proxy"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.proxy.listen, "0.0.0.0:3333");
        assert_eq!(cfg.proxy.client_idle_ms, 180_000);
        assert_eq!(cfg.proxy.max_clients, 1000);
        assert_eq!(cfg.proxy.idle_grace_secs, 15);
        assert_eq!(cfg.upstream.port, 3333);
        assert_eq!(cfg.upstream.backoff_min_ms, 1000);
        assert_eq!(cfg.upstream.backoff_max_ms, 30_000);
        assert!(!cfg.compat.strict_broadcast);
        assert!(cfg.backups.is_empty());
    }

    #[test]
    fn test_missing_host_rejected() {
        let err = Config::from_json(r#"{"upstream": {"user": "u"}}"#).unwrap_err();
        assert!(err.to_string().contains("upstream.host"));
    }

    #[test]
    fn test_missing_user_rejected() {
        let err = Config::from_json(r#"{"upstream": {"host": "h"}}"#).unwrap_err();
        assert!(err.to_string().contains("upstream.user"));
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let err = Config::from_json(
            r#"{"upstream": {"host": "h", "user": "u", "backoff_min_ms": 5000, "backoff_max_ms": 1000}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("backoff_max_ms"));
    }

    #[test]
    fn test_backups_ordered_after_primary() {
        let cfg = Config::from_json(
            r#"{
                "upstream": {"host": "primary", "user": "u"},
                "backups": [{"host": "backup1", "user": "u"}, {"host": "backup2", "user": "u"}]
            }"#,
        )
        .unwrap();
        let targets = cfg.upstream_targets();
        let hosts: Vec<&str> = targets.iter().map(|t| t.host.as_str()).collect();
        assert_eq!(hosts, vec!["primary", "backup1", "backup2"]);
    }

    #[test]
    fn test_tls_listener_needs_key_material() {
        let err = Config::from_json(
            r#"{"upstream": {"host": "h", "user": "u"}, "proxy": {"tls": {"enabled": true}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cert_file"));
    }
}
