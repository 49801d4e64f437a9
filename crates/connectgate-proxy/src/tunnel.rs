//! Upstream dialing and the bidirectional byte relay.
//!
//! # Session Flow
//!
//! ```text
//! dial(addr) -- bounded by connect_timeout --> refused / timed out => 502
//!     |
//!     v
//! write "200 Connection Established" to client
//!     |
//!     v
//! forward early data (bytes the client sent before the 200)
//!     |
//!     v
//! relay client <-> upstream until
//!     - either side closes or errors, or
//!     - no byte crosses in either direction for idle_timeout
//! ```
//!
//! Whichever way the relay ends, both connections are closed together.
//!
//! Relayed bytes are never inspected or altered.

use crate::dns::select_address;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Timeouts and identity for established tunnels.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Upper bound on establishing the upstream connection.
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// Tunnel is closed when no byte crosses in either direction for this long.
    /// Default: 2 minutes
    pub idle_timeout: Duration,

    /// Value of the `Proxy-Agent` header on the 200 response.
    /// Default: `connectgate`
    pub proxy_agent: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            proxy_agent: "connectgate".to_string(),
        }
    }
}

/// Why the upstream connection could not be established.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connecting to {target} timed out after {after:?}")]
    TimedOut { target: String, after: Duration },

    #[error("system lookup of {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{host} has no addresses")]
    NoAddress { host: String },
}

/// Open a TCP connection to `addr` within `timeout`.
pub async fn dial(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, UpstreamError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(UpstreamError::Connect { addr, source }),
        Err(_) => Err(UpstreamError::TimedOut {
            target: addr.to_string(),
            after: timeout,
        }),
    }
}

/// Resolve a passed-through hostname with the system resolver.
///
/// Used when DoH resolution is disabled. The address is chosen with the same
/// policy as DoH answers (first IPv4, else first) so the caller can run it
/// through the trust check before admitting or dialing.
pub async fn lookup_passthrough(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<IpAddr, UpstreamError> {
    let lookup = async {
        let candidates: Vec<IpAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| UpstreamError::Lookup {
                host: host.to_string(),
                source,
            })?
            .map(|addr| addr.ip())
            .collect();
        select_address(&candidates).ok_or_else(|| UpstreamError::NoAddress {
            host: host.to_string(),
        })
    };

    match tokio::time::timeout(timeout, lookup).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::TimedOut {
            target: format!("{host}:{port}"),
            after: timeout,
        }),
    }
}

/// The `200 Connection Established` response head.
pub fn established_response(proxy_agent: &str) -> String {
    format!("HTTP/1.1 200 Connection Established\r\nProxy-Agent: {proxy_agent}\r\n\r\n")
}

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// One side closed or reset its connection.
    Finished,

    /// Nothing crossed the tunnel within the idle timeout.
    Idle,

    /// A socket error other than a disconnect.
    Error(io::ErrorKind),
}

/// Byte counts for a finished tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to upstream, including early data.
    pub uploaded: u64,
    /// Upstream to client.
    pub downloaded: u64,
    pub reason: CloseReason,
}

/// Answer the client with 200, flush early data upstream, then relay.
///
/// # Errors
/// Returns the I/O error if the 200 response or the early data cannot be
/// written; the relay itself never fails, its outcome is in [`RelayStats`].
pub async fn establish<C>(
    mut client: C,
    mut upstream: TcpStream,
    early_data: &[u8],
    config: &TunnelConfig,
) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    client
        .write_all(established_response(&config.proxy_agent).as_bytes())
        .await?;
    client.flush().await?;

    if !early_data.is_empty() {
        upstream.write_all(early_data).await?;
    }

    let mut stats = relay(client, upstream, config.idle_timeout).await;
    stats.uploaded += early_data.len() as u64;
    Ok(stats)
}

/// Copy bytes both ways until either side closes, fails or the tunnel idles out.
///
/// EOF from one side is forwarded as a FIN to the other, then the relay ends
/// and both connections are dropped. A peer that never answers the FIN does
/// not keep the tunnel (and its admission slot) alive.
pub async fn relay<C>(client: C, upstream: TcpStream, idle_timeout: Duration) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let activity = Activity::new();
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = upstream.into_split();

    let upload = pump(client_read, upstream_write, &activity, &activity.uploaded);
    let download = pump(upstream_read, client_write, &activity, &activity.downloaded);

    let reason = tokio::select! {
        result = upload => close_reason(result),
        result = download => close_reason(result),
        () = activity.idle_for(idle_timeout) => CloseReason::Idle,
    };

    RelayStats {
        uploaded: activity.uploaded.load(Ordering::Relaxed),
        downloaded: activity.downloaded.load(Ordering::Relaxed),
        reason,
    }
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    activity: &Activity,
    counter: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // Forward the FIN; if shutdown fails the peer sees the drop instead.
            let _ = writer.shutdown().await;
            return Ok(());
        }
        activity.touch();
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

fn close_reason(result: io::Result<()>) -> CloseReason {
    match result {
        Ok(()) => CloseReason::Finished,
        Err(e) if is_disconnect(&e) => CloseReason::Finished,
        Err(e) => CloseReason::Error(e.kind()),
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Last time any byte crossed the tunnel, shared by both directions.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }

    /// Resolves once `idle` has passed since the last activity.
    async fn idle_for(&self, idle: Duration) {
        loop {
            let deadline = self.last() + idle;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}
