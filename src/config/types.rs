//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::net::lookup_host;
use tracing::debug;

use crate::error::TunnelError;

/// Default port on both sides of the tunnel (Minecraft)
pub const DEFAULT_PORT: u16 = 25565;

/// Default size of each per-direction relay buffer
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Upper bound for the relay buffer
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub listen: Endpoint,
    pub target: Endpoint,
    pub relay: RelayConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// A host-or-address and port pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Relay configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub buffer_size: usize,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub accept_backoff: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, accepting bracketed IPv6 literals
    pub fn parse(s: &str) -> Result<Self, TunnelError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::Config(format!("endpoint '{}' is missing a port", s)))?;

        // IPv6 literals must be bracketed, otherwise the port is ambiguous
        if host.contains(':') && !host.starts_with('[') {
            return Err(TunnelError::Config(format!("endpoint '{}' has an invalid host", s)));
        }
        let host = Self::parse_host(host)?;

        let port = port
            .parse::<u16>()
            .map_err(|e| TunnelError::Config(format!("endpoint '{}' has an invalid port: {}", s, e)))?;

        Ok(Self::new(host, port))
    }

    /// Normalize a host given on its own: an IP literal (IPv6 optionally in
    /// brackets, which are stripped) or a DNS name
    pub fn parse_host(s: &str) -> Result<String, TunnelError> {
        let bracketed = s.strip_prefix('[').and_then(|h| h.strip_suffix(']'));
        let host = bracketed.unwrap_or(s);

        let valid = match host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => true,
            Ok(IpAddr::V4(_)) => bracketed.is_none(),
            Err(_) => bracketed.is_none() && is_hostname(host),
        };

        if valid {
            Ok(host.to_string())
        } else {
            Err(TunnelError::Config(format!("invalid host '{}'", s)))
        }
    }

    /// Resolve into one or more socket addresses
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>, TunnelError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, self.port)]);
        }

        debug!("Resolving {}", self);
        let addrs: Vec<SocketAddr> = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|source| TunnelError::Resolve {
                endpoint: self.to_string(),
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(TunnelError::Resolve {
                endpoint: self.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "resolution returned no addresses",
                ),
            });
        }

        debug!("Resolved {} to {} addresses", self, addrs.len());
        Ok(addrs)
    }
}

/// RFC 1123 labels; underscores are tolerated since resolvers accept them
fn is_hostname(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);

    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(10),
            accept_backoff: Duration::from_millis(100),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: Endpoint::new("0.0.0.0", DEFAULT_PORT),
            target: Endpoint::new("127.0.0.1", DEFAULT_PORT),
            relay: RelayConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
