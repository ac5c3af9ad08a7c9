use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ProxyError, Result};

const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:443";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_KEEPALIVE_SECS: u64 = 30;

/// Application configuration, loaded once at startup and never mutated.
///
/// Keys follow the `config.yaml` layout used by existing deployments, so
/// `cheat-host` is still accepted as the name of the decoy backend.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Address to accept TLS connections on (`host:port` or `:port`)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Proxy-Authorization username
    #[serde(default)]
    pub username: String,
    /// Proxy-Authorization password
    #[serde(default)]
    pub password: String,
    /// Virtual host that reports authentication status; empty disables it
    #[serde(default)]
    pub probe_resist_domain: String,
    /// PEM certificate chain
    #[serde(default)]
    pub cert_file: String,
    /// PEM private key
    #[serde(default)]
    pub key_file: String,
    /// `host:port` of the innocuous backend that receives everything but tunnels
    #[serde(default, rename = "cheat-host", alias = "decoy-host")]
    pub decoy_host: String,
    /// Upstream dial timeout in seconds
    #[serde(default = "default_connect_timeout", rename = "connect-timeout")]
    pub connect_timeout_secs: u64,
    /// TCP keep-alive idle time for upstream connections in seconds
    #[serde(default = "default_keepalive", rename = "keepalive")]
    pub keepalive_secs: u64,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_keepalive() -> u64 {
    DEFAULT_KEEPALIVE_SECS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| ProxyError::InvalidConfig(format!("fatal error config file: {}", e)))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            listen_address: get_env_or("SHADOWPROXY_LISTEN_ADDRESS", DEFAULT_LISTEN_ADDRESS),
            username: get_env_or("SHADOWPROXY_USERNAME", ""),
            password: get_env_or("SHADOWPROXY_PASSWORD", ""),
            probe_resist_domain: get_env_or("SHADOWPROXY_PROBE_RESIST_DOMAIN", ""),
            cert_file: get_env_or("SHADOWPROXY_CERT_FILE", ""),
            key_file: get_env_or("SHADOWPROXY_KEY_FILE", ""),
            decoy_host: get_env_or("SHADOWPROXY_DECOY_HOST", ""),
            connect_timeout_secs: get_env_or("SHADOWPROXY_CONNECT_TIMEOUT", "20")
                .parse()
                .map_err(|_| {
                    ProxyError::InvalidConfig(
                        "SHADOWPROXY_CONNECT_TIMEOUT must be a number of seconds".into(),
                    )
                })?,
            keepalive_secs: get_env_or("SHADOWPROXY_KEEPALIVE", "30")
                .parse()
                .map_err(|_| {
                    ProxyError::InvalidConfig(
                        "SHADOWPROXY_KEEPALIVE must be a number of seconds".into(),
                    )
                })?,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Check that every value the server needs is present and well-formed
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.username.is_empty() {
            return Err(ProxyError::InvalidConfig("username must be set".into()));
        }
        if self.decoy_host.trim().is_empty() {
            return Err(ProxyError::InvalidConfig("cheat-host must be set".into()));
        }
        if self.cert_file.is_empty() || self.key_file.is_empty() {
            return Err(ProxyError::InvalidConfig(
                "cert-file and key-file must both be set".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ProxyError::InvalidConfig(
                "connect-timeout must be greater than zero".into(),
            ));
        }
        if !matches!(self.log.format.as_str(), "json" | "pretty") {
            return Err(ProxyError::InvalidConfig(format!(
                "log format must be json or pretty, got {}",
                self.log.format
            )));
        }

        Ok(())
    }

    /// Normalized bind target; a bare `:port` binds every IPv4 interface
    ///
    /// The host part may be a name such as `localhost`, which is resolved when
    /// the listener binds.
    pub fn listen_addr(&self) -> Result<String> {
        let raw = self.listen_address.trim();
        let normalized = if raw.starts_with(':') {
            format!("0.0.0.0{}", raw)
        } else {
            raw.to_string()
        };

        let valid = match normalized.rsplit_once(':') {
            Some((host, port)) => {
                !host.is_empty() && !host.contains(char::is_whitespace) && port.parse::<u16>().is_ok()
            }
            None => false,
        };
        if !valid {
            return Err(ProxyError::InvalidConfig(format!(
                "listen-address must be host:port, got {}",
                self.listen_address
            )));
        }
        Ok(normalized)
    }

    /// The probe-resistance domain, if one is configured
    pub fn probe_resist_domain(&self) -> Option<&str> {
        let domain = self.probe_resist_domain.trim();
        if domain.is_empty() {
            None
        } else {
            Some(domain)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
