//! HTTP CONNECT forward proxy with destination safety checks.
//!
//! `connectgate-proxy` accepts `CONNECT host:port` requests, optionally
//! authenticates them, resolves the host over DNS-over-HTTPS, refuses
//! destinations in private or special ranges, caps concurrent tunnels per
//! destination, and then relays bytes untouched in both directions.
//!
//! # Architecture
//!
//! ```text
//! Client
//!   |
//!   | (plaintext or TLS)
//!   v
//! ProxyServer (bind_addr)
//!   |
//!   +-- request head: CONNECT | GET /healthz | other -> 405
//!   |
//!   +-- ConnectHandler
//!          |
//!          +-- Authenticator ------ bad / missing credentials --> 407
//!          +-- Authority::parse --- bad host or port ----------> 400
//!          +-- Resolver (DoH + TTL cache)
//!          +-- TrustClassifier ---- private / special range ---> 403
//!          +-- AdmissionController  per-destination ceiling ---> 429
//!          +-- tunnel::dial ------- refused / timed out -------> 502
//!          |
//!          v
//!       200 Connection Established, relay until EOF / error / idle
//! ```
//!
//! # Components
//!
//! - [`ProxyServer`]: Listener, optional TLS and per-connection transport
//! - [`ConnectHandler`]: The staged CONNECT pipeline
//! - [`Resolver`]: DoH lookups behind a [`ResolutionStore`] cache
//! - [`TrustClassifier`]: Blocked-range checks on resolved addresses
//! - [`AdmissionController`]: Per-destination in-flight ceiling
//!
//! # Usage
//!
//! ```ignore
//! use connectgate_proxy::{ProxyConfig, ProxyServer};
//!
//! let config = ProxyConfig {
//!     bind_addr: "0.0.0.0:8080".parse()?,
//!     ..Default::default()
//! };
//!
//! let server = ProxyServer::new(config)?;
//! server.run().await?;
//! ```

mod admission;
mod auth;
mod authority;
mod dns;
mod handler;
mod request;
mod server;
mod tls;
mod trust;
mod tunnel;

pub use admission::{AdmissionController, AdmissionPermit, AdmissionStore, MemoryAdmissionStore};
pub use auth::{Authenticator, Credentials};
pub use authority::{Authority, AuthorityError, DEFAULT_PORT};
pub use dns::{
    select_address, DnsLookup, DohClient, LookupError, LookupFuture, MemoryResolutionStore,
    RecordType, ResolutionStore, Resolver, ResolverConfig, DEFAULT_DOH_URL,
};
pub use handler::{ConnectHandler, ConnectRequest, Rejection, SessionOutcome, Stage};
pub use request::{HeadError, RequestHead, MAX_HEAD_SIZE};
pub use server::{ProxyConfig, ProxyHandle, ProxyServer};
pub use tls::{load_acceptor, TlsFiles};
pub use trust::{BlockReason, TrustClassifier, Verdict};
pub use tunnel::{CloseReason, RelayStats, TunnelConfig, UpstreamError};

use std::net::SocketAddr;
use std::path::PathBuf;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that prevent the proxy from starting.
///
/// Per-request failures are answered with a status code and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind to address.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// TLS certificate or key could not be loaded.
    #[error("TLS material {}: {message}", path.display())]
    TlsMaterial { path: PathBuf, message: String },

    /// The DoH endpoint is not a usable URL.
    #[error("Invalid DoH URL {url}: {message}")]
    InvalidDohUrl { url: String, message: String },

    /// The DoH HTTP client could not be built.
    #[error("Failed to build DoH client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = ProxyError::Bind {
            addr: "127.0.0.1:8080".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        };
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:8080"));
        assert!(msg.contains("address in use"));
    }

    #[test]
    fn test_tls_material_error_display() {
        let err = ProxyError::TlsMaterial {
            path: PathBuf::from("/etc/connectgate/cert.pem"),
            message: "no certificates found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "TLS material /etc/connectgate/cert.pem: no certificates found"
        );
    }

    #[test]
    fn test_invalid_doh_url_display() {
        let err = ProxyError::InvalidDohUrl {
            url: "ftp://x".to_string(),
            message: "scheme must be http or https".to_string(),
        };
        assert!(err.to_string().contains("ftp://x"));
    }
}
