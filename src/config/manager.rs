//! Configuration Manager
//!
//! Sources are layered lowest to highest: built-in defaults, `TUNNEL_*`
//! environment variables, the TOML file, then command-line overrides.
//! Loading never validates; the caller validates once every layer is in.

use super::{Config, Endpoint, DEFAULT_PORT, MAX_BUFFER_SIZE};
use crate::error::TunnelError;
use anyhow::Context;
use std::path::Path;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Defaults, then the environment, then the file at `path` if it exists
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        Self::load_layered(path, |key| std::env::var(key).ok())
    }

    /// Same as [`ConfigManager::load`] with the environment read through `lookup`
    pub fn load_layered<F>(path: &Path, lookup: F) -> anyhow::Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::load_from_vars(lookup)?;
        Self::apply_file(&mut config, path)?;
        Ok(config)
    }

    /// Build a configuration from defaults plus whatever `lookup` returns
    /// for the `TUNNEL_*` keys
    pub fn load_from_vars<F>(lookup: F) -> anyhow::Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        Self::apply_vars(&mut config, lookup)?;
        Ok(config)
    }

    /// Overlay the keys present in the file; absent keys keep their
    /// current values
    fn apply_file(config: &mut Config, path: &Path) -> anyhow::Result<()> {
        if !path.exists() {
            tracing::warn!("Configuration file not found at {}, skipping", path.display());
            return Ok(());
        }

        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let file: toml::Value = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        let mut merged =
            toml::Value::try_from(&*config).context("Failed to serialize configuration")?;
        overlay(&mut merged, file);

        *config = merged
            .try_into()
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!("Configuration file applied");
        Ok(())
    }

    fn apply_vars<F>(config: &mut Config, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // host:port shorthands, refined by the per-field keys below
        if let Some(listen) = lookup("TUNNEL_LISTEN") {
            config.listen = listen
                .parse::<Endpoint>()
                .with_context(|| format!("Invalid TUNNEL_LISTEN: {}", listen))?;
        }

        if let Some(target) = lookup("TUNNEL_TARGET") {
            config.target = target
                .parse::<Endpoint>()
                .with_context(|| format!("Invalid TUNNEL_TARGET: {}", target))?;
        }

        if let Some(host) = lookup("TUNNEL_LISTEN_HOST") {
            config.listen.host = Endpoint::parse_host(&host)
                .with_context(|| format!("Invalid TUNNEL_LISTEN_HOST: {}", host))?;
        }

        if let Some(port) = lookup("TUNNEL_LISTEN_PORT") {
            config.listen.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid TUNNEL_LISTEN_PORT: {}", port))?;
        }

        if let Some(host) = lookup("TUNNEL_TARGET_HOST") {
            config.target.host = Endpoint::parse_host(&host)
                .with_context(|| format!("Invalid TUNNEL_TARGET_HOST: {}", host))?;
        }

        if let Some(port) = lookup("TUNNEL_TARGET_PORT") {
            config.target.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid TUNNEL_TARGET_PORT: {}", port))?;
        }

        if let Some(buffer_size) = lookup("TUNNEL_BUFFER_SIZE") {
            config.relay.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid TUNNEL_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(timeout) = lookup("TUNNEL_SHUTDOWN_TIMEOUT") {
            config.server.shutdown_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TUNNEL_SHUTDOWN_TIMEOUT: {}", timeout))?;
        }

        if let Some(level) = lookup("TUNNEL_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(())
    }
}

fn normalize_host(host: &str) -> String {
    Endpoint::parse_host(host).unwrap_or_else(|_| host.to_string())
}

/// Recursively replace `base` values with the ones present in `top`
fn overlay(base: &mut toml::Value, top: toml::Value) {
    match (base, top) {
        (toml::Value::Table(base), toml::Value::Table(top)) => {
            for (key, value) in top {
                match base.get_mut(&key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, top) => *base = top,
    }
}

/// Values taken from the command line, applied on top of everything else
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen_host: Option<String>,
    pub listen_port: Option<u16>,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub buffer_size: Option<usize>,
    pub shutdown_timeout: Option<Duration>,
    pub log_level: Option<String>,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TunnelError> {
        Self::validate_endpoint("listen", &self.listen)?;
        Self::validate_endpoint("target", &self.target)?;

        if self.target.port == 0 {
            return Err(TunnelError::Config("target.port must be greater than 0".into()));
        }

        if self.relay.buffer_size == 0 {
            return Err(TunnelError::Config("relay.buffer_size must be greater than 0".into()));
        }

        if self.relay.buffer_size > MAX_BUFFER_SIZE {
            return Err(TunnelError::Config("relay.buffer_size cannot exceed 1MB".into()));
        }

        if self.server.shutdown_timeout.is_zero() {
            return Err(TunnelError::Config(
                "server.shutdown_timeout must be greater than 0".into(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            return Err(TunnelError::Config(format!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            )));
        }

        Ok(())
    }

    fn validate_endpoint(name: &str, endpoint: &Endpoint) -> Result<(), TunnelError> {
        if endpoint.host.trim().is_empty() {
            return Err(TunnelError::Config(format!("{}.host must not be empty", name)));
        }
        // stored hosts are already normalized, so brackets are an error here
        match Endpoint::parse_host(&endpoint.host) {
            Ok(host) if host == endpoint.host => Ok(()),
            _ => Err(TunnelError::Config(format!(
                "{}.host '{}' is not an IP address or host name",
                name, endpoint.host
            ))),
        }
    }

    /// Merge with CLI arguments.
    ///
    /// Hosts are normalized (`[::1]` becomes `::1`); a host that does not
    /// parse is kept verbatim so [`Config::validate`] reports it.
    pub fn merge_with_cli_args(&mut self, cli: &CliOverrides) {
        if let Some(host) = &cli.listen_host {
            self.listen.host = normalize_host(host);
            tracing::info!("CLI override: listen host set to {}", host);
        }

        if let Some(port) = cli.listen_port {
            self.listen.port = port;
            tracing::info!("CLI override: listen port set to {}", port);
        }

        if let Some(host) = &cli.target_host {
            self.target.host = normalize_host(host);
            tracing::info!("CLI override: target host set to {}", host);
        }

        // A lone listen port forwards port N to port N on the target,
        // unless the file or environment already chose a target port
        match (cli.target_port, cli.listen_port) {
            (Some(port), _) => {
                self.target.port = port;
                tracing::info!("CLI override: target port set to {}", port);
            }
            (None, Some(port)) if self.target.port == DEFAULT_PORT => {
                self.target.port = port;
                tracing::info!("CLI override: target port follows listen port {}", port);
            }
            _ => {}
        }

        if let Some(buffer_size) = cli.buffer_size {
            self.relay.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(timeout) = cli.shutdown_timeout {
            self.server.shutdown_timeout = timeout;
            tracing::info!("CLI override: shutdown timeout set to {:?}", timeout);
        }

        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        }
    }
}
