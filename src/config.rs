//! Client configuration types
//!
//! This module provides the configuration consumed by the router, pool and
//! topology cache, plus endpoint URI parsing. Configs are plain structs with
//! builder-style setters so embedding code can load them from TOML.

use crate::error::{KvError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A server endpoint, either TCP or a Unix domain socket.
///
/// Identity only: credentials and database index live in [`ClientConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Endpoint {
    /// Create a TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` pair, as found in redirection errors and
    /// topology replies.
    pub fn from_host_port(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| KvError::InvalidEndpoint(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| KvError::InvalidEndpoint(s.to_string()))?;
        Ok(Endpoint::tcp(host, port))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Result of parsing an endpoint URI.
///
/// `redis://[:password@]host:port[/db]` or `unix://path[?password=..&db=..]`
/// are the only accepted schemes.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUri {
    pub endpoint: Endpoint,
    pub password: Option<String>,
    pub db: u32,
}

impl ParsedUri {
    pub fn parse(uri: &str) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix("redis://") {
            Self::parse_tcp(uri, rest)
        } else if let Some(rest) = uri.strip_prefix("unix://") {
            Self::parse_unix(uri, rest)
        } else {
            Err(KvError::InvalidEndpoint(uri.to_string()))
        }
    }

    fn parse_tcp(uri: &str, rest: &str) -> Result<Self> {
        let invalid = || KvError::InvalidEndpoint(uri.to_string());

        let (auth, addr) = match rest.rsplit_once('@') {
            Some((auth, addr)) => (Some(auth), addr),
            None => (None, rest),
        };
        let password = match auth {
            // Credentials take the ":password" form; a user part is ignored.
            Some(auth) => Some(
                auth.split_once(':')
                    .map(|(_, pw)| pw.to_string())
                    .ok_or_else(invalid)?,
            ),
            None => None,
        };

        let (addr, db) = match addr.split_once('/') {
            Some((addr, db)) => (addr, db.parse::<u32>().map_err(|_| invalid())?),
            None => (addr, 0),
        };

        let endpoint = Endpoint::from_host_port(addr)?;
        Ok(ParsedUri {
            endpoint,
            password,
            db,
        })
    }

    fn parse_unix(uri: &str, rest: &str) -> Result<Self> {
        let invalid = || KvError::InvalidEndpoint(uri.to_string());

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };
        if path.is_empty() {
            return Err(invalid());
        }

        let mut password = None;
        let mut db = 0u32;
        if let Some(query) = query {
            for pair in query.split('&') {
                match pair.split_once('=') {
                    Some(("password", v)) => password = Some(v.to_string()),
                    Some(("db", v)) => db = v.parse().map_err(|_| invalid())?,
                    _ => return Err(invalid()),
                }
            }
        }

        Ok(ParsedUri {
            endpoint: Endpoint::Unix {
                path: PathBuf::from(path),
            },
            password,
            db,
        })
    }
}

/// Replica read policy for read-only commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplicaReads {
    /// Always read from the master.
    #[default]
    Never,
    /// Prefer replicas, fall back to the master when a slot has none.
    Always,
    /// Spread reads across the master and its replicas.
    ShareWithMaster,
}

/// Per-endpoint connection pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum connections per endpoint (idle + leased).
    pub max_size: usize,
    /// Maximum callers queued waiting for a connection.
    pub max_waiting: usize,
    /// Idle recycle timeout in milliseconds.
    pub idle_timeout_ms: u64,
    /// Interval between idle sweeps in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            max_waiting: 32,
            idle_timeout_ms: 60_000,
            sweep_interval_ms: 10_000,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Redirection retry and backoff bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Redirection hop budget per dispatch.
    pub max_hops: u32,
    /// Initial TRYAGAIN/CLUSTERDOWN backoff in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub backoff_ceiling_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_hops: 5,
            backoff_base_ms: 10,
            backoff_ceiling_ms: 640,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given zero-based attempt, capped at the
    /// configured ceiling.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.backoff_ceiling_ms);
        Duration::from_millis(ms)
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seed endpoint URIs (`redis://` or `unix://`).
    pub endpoints: Vec<String>,
    /// Password for AUTH, unless carried by an endpoint URI.
    pub password: Option<String>,
    /// Database index for SELECT, unless carried by an endpoint URI.
    pub db: u32,
    /// Replica read policy for read-only commands.
    pub replica_reads: ReplicaReads,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    /// Slot table TTL in milliseconds.
    pub topology_ttl_ms: u64,
    /// In-flight queue capacity per connection.
    pub inflight_capacity: usize,
    /// Maximum nesting depth accepted by the reply decoder.
    pub max_reply_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["redis://127.0.0.1:6379".to_string()],
            password: None,
            db: 0,
            replica_reads: ReplicaReads::Never,
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            topology_ttl_ms: 60_000,
            inflight_capacity: 256,
            max_reply_depth: 32,
        }
    }
}

impl ClientConfig {
    /// Create a configuration with a single seed endpoint URI.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            endpoints: vec![uri.into()],
            ..Default::default()
        }
    }

    /// Replace the seed endpoint list.
    pub fn with_endpoints(mut self, uris: Vec<String>) -> Self {
        self.endpoints = uris;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_replica_reads(mut self, policy: ReplicaReads) -> Self {
        self.replica_reads = policy;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_topology_ttl(mut self, ttl: Duration) -> Self {
        self.topology_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn topology_ttl(&self) -> Duration {
        Duration::from_millis(self.topology_ttl_ms)
    }

    /// Parse the configured seed URIs.
    ///
    /// The first URI carrying a password or database index fills in the
    /// top-level values when those are unset.
    pub fn resolve_seeds(&self) -> Result<(Vec<Endpoint>, Option<String>, u32)> {
        if self.endpoints.is_empty() {
            return Err(KvError::InvalidEndpoint("no seed endpoints".to_string()));
        }

        let mut seeds = Vec::with_capacity(self.endpoints.len());
        let mut password = self.password.clone();
        let mut db = self.db;
        for uri in &self.endpoints {
            let parsed = ParsedUri::parse(uri)?;
            if password.is_none() {
                password = parsed.password;
            }
            if db == 0 {
                db = parsed.db;
            }
            seeds.push(parsed.endpoint);
        }
        Ok((seeds, password, db))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_uri() {
        let parsed = ParsedUri::parse("redis://127.0.0.1:6379").unwrap();
        assert_eq!(parsed.endpoint, Endpoint::tcp("127.0.0.1", 6379));
        assert_eq!(parsed.password, None);
        assert_eq!(parsed.db, 0);
    }

    #[test]
    fn test_parse_tcp_uri_with_password_and_db() {
        let parsed = ParsedUri::parse("redis://:sekret@10.0.0.5:7000/2").unwrap();
        assert_eq!(parsed.endpoint, Endpoint::tcp("10.0.0.5", 7000));
        assert_eq!(parsed.password.as_deref(), Some("sekret"));
        assert_eq!(parsed.db, 2);
    }

    #[test]
    fn test_parse_unix_uri() {
        let parsed = ParsedUri::parse("unix:///var/run/kv.sock?password=pw&db=1").unwrap();
        assert_eq!(
            parsed.endpoint,
            Endpoint::Unix {
                path: PathBuf::from("/var/run/kv.sock")
            }
        );
        assert_eq!(parsed.password.as_deref(), Some("pw"));
        assert_eq!(parsed.db, 1);
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        assert!(ParsedUri::parse("http://127.0.0.1:80").is_err());
        assert!(ParsedUri::parse("127.0.0.1:6379").is_err());
    }

    #[test]
    fn test_endpoint_from_host_port() {
        let ep = Endpoint::from_host_port("node-3:7002").unwrap();
        assert_eq!(ep, Endpoint::tcp("node-3", 7002));
        assert!(Endpoint::from_host_port("nonsense").is_err());
    }

    #[test]
    fn test_backoff_caps_at_ceiling() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(0), Duration::from_millis(10));
        assert_eq!(retry.backoff(1), Duration::from_millis(20));
        assert_eq!(retry.backoff(10), Duration::from_millis(640));
    }

    #[test]
    fn test_config_from_toml() {
        let cfg: ClientConfig = toml::from_str(
            r#"
            endpoints = ["redis://127.0.0.1:7000", "redis://127.0.0.1:7001"]
            topology_ttl_ms = 5000

            [pool]
            max_size = 2
            max_waiting = 1
            idle_timeout_ms = 1000
            sweep_interval_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.endpoints.len(), 2);
        assert_eq!(cfg.pool.max_size, 2);
        assert_eq!(cfg.topology_ttl(), Duration::from_secs(5));
    }
}
