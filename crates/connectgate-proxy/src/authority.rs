//! CONNECT target parsing.
//!
//! Accepted forms:
//!
//! | Target               | Host          | Port |
//! |----------------------|---------------|------|
//! | `example.com:8443`   | `example.com` | 8443 |
//! | `example.com`        | `example.com` | 443  |
//! | `[2001:db8::1]:443`  | `2001:db8::1` | 443  |
//! | `[2001:db8::1]`      | `2001:db8::1` | 443  |
//! | `2001:db8::1`        | `2001:db8::1` | 443  |
//!

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

/// Port assumed when the target carries none.
pub const DEFAULT_PORT: u16 = 443;

/// Why a CONNECT target was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityError {
    #[error("empty CONNECT target")]
    Empty,

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("malformed bracketed address in {0:?}")]
    MalformedBrackets(String),

    #[error("invalid host in {0:?}")]
    InvalidHost(String),
}

/// Destination named by a CONNECT request.
///
/// `host` is never empty and never bracketed; `port` is always in `1..=65535`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    host: String,
    port: u16,
}

impl Authority {
    /// Parse a raw CONNECT target.
    ///
    /// Hostnames are lowercased; IP literals are kept in their textual form.
    pub fn parse(target: &str) -> Result<Self, AuthorityError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(AuthorityError::Empty);
        }

        if let Some(rest) = target.strip_prefix('[') {
            let (inner, after) = rest
                .split_once(']')
                .ok_or_else(|| AuthorityError::MalformedBrackets(target.to_string()))?;
            if inner.parse::<Ipv6Addr>().is_err() {
                return Err(AuthorityError::MalformedBrackets(target.to_string()));
            }
            let port = match after {
                "" => DEFAULT_PORT,
                _ => match after.strip_prefix(':') {
                    Some(port) => parse_port(port)?,
                    None => return Err(AuthorityError::MalformedBrackets(target.to_string())),
                },
            };
            return Ok(Self {
                host: inner.to_string(),
                port,
            });
        }

        if target.contains(']') {
            return Err(AuthorityError::MalformedBrackets(target.to_string()));
        }

        // Unbracketed IPv6 literals cannot carry a port.
        if target.parse::<Ipv6Addr>().is_ok() {
            return Ok(Self {
                host: target.to_string(),
                port: DEFAULT_PORT,
            });
        }

        let (host, port) = match target.split_once(':') {
            Some((host, port)) => (host, parse_port(port)?),
            None => (target, DEFAULT_PORT),
        };
        validate_host(host, target)?;

        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// Hostname or literal address, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host as an IP address, if it is a literal.
    pub fn literal_ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(raw: &str) -> Result<u16, AuthorityError> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AuthorityError::InvalidPort(raw.to_string()));
    }
    match raw.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(AuthorityError::InvalidPort(raw.to_string())),
    }
}

fn validate_host(host: &str, target: &str) -> Result<(), AuthorityError> {
    let bad = host.is_empty()
        || host
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '@' | '?' | '#'));
    if bad {
        Err(AuthorityError::InvalidHost(target.to_string()))
    } else {
        Ok(())
    }
}
