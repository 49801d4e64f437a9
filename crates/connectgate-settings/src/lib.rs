//! Layered TOML configuration for connectgate.
//!
//! Configuration is assembled from, in increasing precedence:
//! - Global config: `~/.config/connectgate/connectgate.toml`
//! - An explicit file passed with `--config`
//! - `CONNECTGATE_*` environment variables
//!
//! Every scalar is optional so layers can be merged; unset fields fall back
//! to the proxy's built-in defaults.
//!
//! # Example
//!
//! ```no_run
//! use connectgate_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(None).unwrap();
//! config.validate().unwrap();
//! println!("{:?}", config.server.bind_addr);
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const ENV_BIND_ADDR: &str = "CONNECTGATE_BIND_ADDR";
pub const ENV_TLS_CERT: &str = "CONNECTGATE_TLS_CERT";
pub const ENV_TLS_KEY: &str = "CONNECTGATE_TLS_KEY";
pub const ENV_PROXY_AGENT: &str = "CONNECTGATE_PROXY_AGENT";
pub const ENV_USERNAME: &str = "CONNECTGATE_USERNAME";
pub const ENV_PASSWORD: &str = "CONNECTGATE_PASSWORD";
pub const ENV_REALM: &str = "CONNECTGATE_REALM";
pub const ENV_DOH_ENABLED: &str = "CONNECTGATE_DOH_ENABLED";
pub const ENV_DOH_URL: &str = "CONNECTGATE_DOH_URL";
pub const ENV_DOH_TIMEOUT_MS: &str = "CONNECTGATE_DOH_TIMEOUT_MS";
pub const ENV_DNS_CACHE_TTL_SECS: &str = "CONNECTGATE_DNS_CACHE_TTL_SECS";
pub const ENV_BLOCK_PRIVATE: &str = "CONNECTGATE_BLOCK_PRIVATE";
pub const ENV_MAX_TUNNELS_PER_DEST: &str = "CONNECTGATE_MAX_TUNNELS_PER_DEST";
pub const ENV_CONNECT_TIMEOUT_SECS: &str = "CONNECTGATE_CONNECT_TIMEOUT_SECS";
pub const ENV_IDLE_TIMEOUT_SECS: &str = "CONNECTGATE_IDLE_TIMEOUT_SECS";

const REDACTED: &str = "<redacted>";

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An environment variable holds a value of the wrong shape.
    #[error("Invalid value {value:?} for {var}: expected {expected}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    /// Only one of username / password is set.
    #[error("auth.username and auth.password must be set together")]
    IncompleteCredentials,

    /// Only one of the TLS certificate / key paths is set.
    #[error("server.tls_cert_path and server.tls_key_path must be set together")]
    IncompleteTls,

    /// A field holds a value outside its valid range.
    #[error("Invalid {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

/// TOML `[server]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Listener address, e.g. `0.0.0.0:8080`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,

    /// PEM certificate chain; TLS is served when both paths are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert_path: Option<PathBuf>,

    /// PEM private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key_path: Option<PathBuf>,

    /// `Proxy-Agent` header value on established tunnels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_agent: Option<String>,
}

/// TOML `[auth]` section. Username and password together enable auth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
}

/// TOML `[dns]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsSettings {
    /// Look up uncached names over DoH. When `false`, names are passed through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doh_url: Option<String>,

    /// Per-lookup timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
}

/// TOML `[policy]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySettings {
    /// Refuse private, loopback and other special-purpose destinations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_private: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tunnels_per_destination: Option<usize>,
}

/// TOML `[tunnel]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

/// Top-level configuration, corresponding to `connectgate.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectgateConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub dns: DnsSettings,

    #[serde(default)]
    pub policy: PolicySettings,

    #[serde(default)]
    pub tunnel: TunnelSettings,
}

impl ConnectgateConfig {
    /// Parse a `ConnectgateConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or
    /// contains unrecognised keys for this schema.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load a `ConnectgateConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Merge `other` on top of `self`: every field set in `other` wins.
    #[must_use]
    pub fn merge(mut self, other: ConnectgateConfig) -> ConnectgateConfig {
        overlay(&mut self.server.bind_addr, other.server.bind_addr);
        overlay(&mut self.server.tls_cert_path, other.server.tls_cert_path);
        overlay(&mut self.server.tls_key_path, other.server.tls_key_path);
        overlay(&mut self.server.proxy_agent, other.server.proxy_agent);

        overlay(&mut self.auth.username, other.auth.username);
        overlay(&mut self.auth.password, other.auth.password);
        overlay(&mut self.auth.realm, other.auth.realm);

        overlay(&mut self.dns.enabled, other.dns.enabled);
        overlay(&mut self.dns.doh_url, other.dns.doh_url);
        overlay(&mut self.dns.lookup_timeout_ms, other.dns.lookup_timeout_ms);
        overlay(&mut self.dns.cache_ttl_secs, other.dns.cache_ttl_secs);

        overlay(&mut self.policy.block_private, other.policy.block_private);
        overlay(
            &mut self.policy.max_tunnels_per_destination,
            other.policy.max_tunnels_per_destination,
        );

        overlay(&mut self.tunnel.connect_timeout_secs, other.tunnel.connect_timeout_secs);
        overlay(&mut self.tunnel.idle_timeout_secs, other.tunnel.idle_timeout_secs);
        self
    }

    /// Apply `CONNECTGATE_*` variables from the process environment.
    ///
    /// # Errors
    /// Returns `SettingsError::InvalidEnv` if a variable cannot be parsed.
    pub fn apply_env(self) -> Result<Self, SettingsError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Apply `CONNECTGATE_*` variables read through `lookup`.
    ///
    /// Empty values are ignored.
    ///
    /// # Errors
    /// Returns `SettingsError::InvalidEnv` if a variable cannot be parsed.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());

        if let Some(value) = get(ENV_BIND_ADDR) {
            self.server.bind_addr = Some(value);
        }
        if let Some(value) = get(ENV_TLS_CERT) {
            self.server.tls_cert_path = Some(PathBuf::from(value));
        }
        if let Some(value) = get(ENV_TLS_KEY) {
            self.server.tls_key_path = Some(PathBuf::from(value));
        }
        if let Some(value) = get(ENV_PROXY_AGENT) {
            self.server.proxy_agent = Some(value);
        }
        if let Some(value) = get(ENV_USERNAME) {
            self.auth.username = Some(value);
        }
        if let Some(value) = get(ENV_PASSWORD) {
            self.auth.password = Some(value);
        }
        if let Some(value) = get(ENV_REALM) {
            self.auth.realm = Some(value);
        }
        if let Some(value) = get(ENV_DOH_ENABLED) {
            self.dns.enabled = Some(parse_bool(ENV_DOH_ENABLED, &value)?);
        }
        if let Some(value) = get(ENV_DOH_URL) {
            self.dns.doh_url = Some(value);
        }
        if let Some(value) = get(ENV_DOH_TIMEOUT_MS) {
            self.dns.lookup_timeout_ms = Some(parse_number(ENV_DOH_TIMEOUT_MS, &value)?);
        }
        if let Some(value) = get(ENV_DNS_CACHE_TTL_SECS) {
            self.dns.cache_ttl_secs = Some(parse_number(ENV_DNS_CACHE_TTL_SECS, &value)?);
        }
        if let Some(value) = get(ENV_BLOCK_PRIVATE) {
            self.policy.block_private = Some(parse_bool(ENV_BLOCK_PRIVATE, &value)?);
        }
        if let Some(value) = get(ENV_MAX_TUNNELS_PER_DEST) {
            self.policy.max_tunnels_per_destination =
                Some(parse_number(ENV_MAX_TUNNELS_PER_DEST, &value)?);
        }
        if let Some(value) = get(ENV_CONNECT_TIMEOUT_SECS) {
            self.tunnel.connect_timeout_secs =
                Some(parse_number(ENV_CONNECT_TIMEOUT_SECS, &value)?);
        }
        if let Some(value) = get(ENV_IDLE_TIMEOUT_SECS) {
            self.tunnel.idle_timeout_secs = Some(parse_number(ENV_IDLE_TIMEOUT_SECS, &value)?);
        }
        Ok(self)
    }

    /// Check cross-field and range constraints.
    ///
    /// # Errors
    /// * `SettingsError::IncompleteCredentials` - username without password or vice versa
    /// * `SettingsError::IncompleteTls` - certificate without key or vice versa
    /// * `SettingsError::InvalidValue` - unparsable bind address, zero ceiling or timeout
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.auth.username.is_some() != self.auth.password.is_some() {
            return Err(SettingsError::IncompleteCredentials);
        }
        if self.server.tls_cert_path.is_some() != self.server.tls_key_path.is_some() {
            return Err(SettingsError::IncompleteTls);
        }
        if let Some(addr) = &self.server.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|e| SettingsError::InvalidValue {
                    field: "server.bind_addr",
                    message: format!("{addr:?}: {e}"),
                })?;
        }
        if self.policy.max_tunnels_per_destination == Some(0) {
            return Err(SettingsError::InvalidValue {
                field: "policy.max_tunnels_per_destination",
                message: "must be at least 1".to_string(),
            });
        }
        for (field, value) in [
            ("dns.lookup_timeout_ms", self.dns.lookup_timeout_ms),
            ("tunnel.connect_timeout_secs", self.tunnel.connect_timeout_secs),
            ("tunnel.idle_timeout_secs", self.tunnel.idle_timeout_secs),
        ] {
            if value == Some(0) {
                return Err(SettingsError::InvalidValue {
                    field,
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Copy safe to print: the password is replaced with a placeholder.
    #[must_use]
    pub fn redacted(&self) -> ConnectgateConfig {
        let mut copy = self.clone();
        if copy.auth.password.is_some() {
            copy.auth.password = Some(REDACTED.to_string());
        }
        copy
    }
}

fn overlay<T>(base: &mut Option<T>, top: Option<T>) {
    if top.is_some() {
        *base = top;
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, SettingsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidEnv {
            var,
            value: value.to_string(),
            expected: "a boolean (true/false/1/0/yes/no/on/off)",
        }),
    }
}

fn parse_number<T: FromStr>(var: &'static str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::InvalidEnv {
        var,
        value: value.to_string(),
        expected: "a non-negative integer",
    })
}
