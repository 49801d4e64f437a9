//! CONNECT request pipeline.
//!
//! A request moves through these stages in order; the first failing stage
//! answers the client and ends the session:
//!
//! ```text
//! Received -> Authorized -> AuthorityParsed -> Resolved -> TrustChecked
//!          -> Admitted -> Connected -> Relaying -> Closed
//!
//! Authorized       missing / wrong credentials      407
//! AuthorityParsed  bad host or port                 400
//! Resolved         resolution enabled, no address   502
//! TrustChecked     blocked address                  403
//! Admitted         destination at its ceiling       429
//! Connected        refused / timed out              502
//! ```
//!
//! While resolution and dialing are pending the client socket is still
//! watched: if the client disconnects the session is abandoned without a
//! response, and anything it sends is kept as early data for the upstream.
//! A client that shuts down its write side is indistinguishable from one
//! that closed outright and is treated the same way; a relay would end on
//! that EOF anyway.
//!
//! With DoH resolution disabled the host is resolved by the system resolver
//! at the `Resolved` stage, so the trust check still runs before admission.

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::auth::Authenticator;
use crate::authority::{Authority, AuthorityError};
use crate::dns::{select_address, Resolver};
use crate::trust::{BlockReason, TrustClassifier, Verdict};
use crate::tunnel::{self, RelayStats, TunnelConfig, UpstreamError};
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Cap on bytes buffered from the client before the tunnel is up.
const MAX_EARLY_DATA: usize = 64 * 1024;

/// Pipeline stage at which a session ended.
///
/// A rejection carries the stage whose check failed; a relayed session ends
/// at `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Authorized,
    AuthorityParsed,
    Resolved,
    TrustChecked,
    Admitted,
    Connected,
    Relaying,
    Closed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Authorized => "authorized",
            Stage::AuthorityParsed => "authority-parsed",
            Stage::Resolved => "resolved",
            Stage::TrustChecked => "trust-checked",
            Stage::Admitted => "admitted",
            Stage::Connected => "connected",
            Stage::Relaying => "relaying",
            Stage::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A rejected CONNECT request and the status it is answered with.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("proxy authentication required")]
    AuthenticationRequired,

    #[error("bad CONNECT target: {0}")]
    BadAuthority(#[from] AuthorityError),

    #[error("{host} did not resolve to any address")]
    Unresolvable { host: String },

    #[error("destination {addr} blocked: {reason}")]
    Forbidden { addr: IpAddr, reason: BlockReason },

    #[error("too many tunnels to {key}")]
    TooManyTunnels { key: String },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl Rejection {
    /// HTTP status code sent to the client.
    pub fn status(&self) -> u16 {
        match self {
            Rejection::AuthenticationRequired => 407,
            Rejection::BadAuthority(_) => 400,
            Rejection::Forbidden { .. } => 403,
            Rejection::TooManyTunnels { .. } => 429,
            Rejection::Unresolvable { .. } | Rejection::Upstream(_) => 502,
        }
    }

    /// Stage whose check produced this rejection.
    pub fn stage(&self) -> Stage {
        match self {
            Rejection::AuthenticationRequired => Stage::Authorized,
            Rejection::BadAuthority(_) => Stage::AuthorityParsed,
            Rejection::Unresolvable { .. }
            | Rejection::Upstream(UpstreamError::Lookup { .. } | UpstreamError::NoAddress { .. }) => {
                Stage::Resolved
            }
            Rejection::Forbidden { .. } => Stage::TrustChecked,
            Rejection::TooManyTunnels { .. } => Stage::Admitted,
            Rejection::Upstream(UpstreamError::Connect { .. } | UpstreamError::TimedOut { .. }) => {
                Stage::Connected
            }
        }
    }

    /// Full response head. Only 407 carries a header (the challenge).
    pub fn response(&self, realm: &str) -> String {
        match self {
            Rejection::AuthenticationRequired => format!(
                "HTTP/1.1 407 Proxy Authentication Required\r\n\
                 Proxy-Authenticate: Basic realm=\"{realm}\"\r\n\r\n"
            ),
            other => status_response(other.status()),
        }
    }
}

/// `HTTP/1.1 <code> <reason>` with no headers and no body.
pub(crate) fn status_response(status: u16) -> String {
    format!("HTTP/1.1 {status} {}\r\n\r\n", reason_phrase(status))
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        429 => "Too Many Requests",
        502 => "Bad Gateway",
        _ => "Error",
    }
}

/// A parsed CONNECT request as handed over by the transport.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Request target, e.g. `example.com:443`.
    pub target: String,

    /// Raw `Proxy-Authorization` header value.
    pub proxy_authorization: Option<String>,

    /// Bytes received after the request head.
    pub early_data: Vec<u8>,
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Answered with a non-200 status.
    Rejected { status: u16, stage: Stage },

    /// Client disconnected before the tunnel was up; nothing was sent.
    ClientGone(Stage),

    /// Tunnel was established and has now closed.
    Relayed(RelayStats),

    /// Tunnel setup failed after admission while writing to a socket.
    Failed(std::io::Error),
}

impl SessionOutcome {
    /// Last stage the session reached.
    pub fn stage(&self) -> Stage {
        match self {
            SessionOutcome::Rejected { stage, .. } | SessionOutcome::ClientGone(stage) => *stage,
            SessionOutcome::Relayed(_) => Stage::Closed,
            SessionOutcome::Failed(_) => Stage::Relaying,
        }
    }
}

enum Abort {
    Reject(Rejection),
    ClientGone(Stage),
}

impl From<Rejection> for Abort {
    fn from(rejection: Rejection) -> Self {
        Abort::Reject(rejection)
    }
}

struct Ready {
    upstream: TcpStream,
    upstream_addr: SocketAddr,
    permit: AdmissionPermit,
}

/// Runs CONNECT requests through the stage pipeline.
#[derive(Debug, Clone)]
pub struct ConnectHandler {
    authenticator: Authenticator,
    resolver: Resolver,
    trust: TrustClassifier,
    admission: AdmissionController,
    tunnel: TunnelConfig,
}

impl ConnectHandler {
    pub fn new(
        authenticator: Authenticator,
        resolver: Resolver,
        trust: TrustClassifier,
        admission: AdmissionController,
        tunnel: TunnelConfig,
    ) -> Self {
        Self {
            authenticator,
            resolver,
            trust,
            admission,
            tunnel,
        }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Drive one CONNECT request to completion on `client`.
    pub async fn handle<S>(&self, mut client: S, request: ConnectRequest) -> SessionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ConnectRequest {
            target,
            proxy_authorization,
            mut early_data,
        } = request;

        let prepared = self
            .prepare(
                &mut client,
                &target,
                proxy_authorization.as_deref(),
                &mut early_data,
            )
            .await;

        match prepared {
            Ok(Ready {
                upstream,
                upstream_addr,
                permit,
            }) => {
                info!(
                    target = %target,
                    upstream = %upstream_addr,
                    key = permit.key(),
                    in_flight = permit.count_at_admission(),
                    "tunnel established"
                );
                let outcome = match tunnel::establish(client, upstream, &early_data, &self.tunnel)
                    .await
                {
                    Ok(stats) => {
                        info!(
                            target = %target,
                            uploaded = stats.uploaded,
                            downloaded = stats.downloaded,
                            reason = ?stats.reason,
                            "tunnel closed"
                        );
                        SessionOutcome::Relayed(stats)
                    }
                    Err(e) => {
                        debug!(target = %target, error = %e, "tunnel setup failed");
                        SessionOutcome::Failed(e)
                    }
                };
                drop(permit);
                outcome
            }
            Err(Abort::Reject(rejection)) => {
                let status = rejection.status();
                let stage = rejection.stage();
                match status {
                    403 | 429 => warn!(target = %target, status, %stage, reason = %rejection, "CONNECT rejected"),
                    _ => debug!(target = %target, status, %stage, reason = %rejection, "CONNECT rejected"),
                }
                // Best-effort: the client may already be gone.
                let response = rejection.response(self.authenticator.realm());
                client.write_all(response.as_bytes()).await.ok();
                client.shutdown().await.ok();
                SessionOutcome::Rejected { status, stage }
            }
            Err(Abort::ClientGone(stage)) => {
                debug!(target = %target, stage = %stage, "client disconnected before tunnel was up");
                SessionOutcome::ClientGone(stage)
            }
        }
    }

    async fn prepare<S>(
        &self,
        client: &mut S,
        target: &str,
        authorization: Option<&str>,
        early_data: &mut Vec<u8>,
    ) -> Result<Ready, Abort>
    where
        S: AsyncRead + Unpin,
    {
        if !self.authenticator.authorize(authorization) {
            return Err(Rejection::AuthenticationRequired.into());
        }

        let authority = Authority::parse(target).map_err(Rejection::from)?;

        let candidates = watch_client(
            client,
            early_data,
            Stage::Resolved,
            self.resolver.resolve(authority.host()),
        )
        .await?;

        let timeout = self.tunnel.connect_timeout;
        let (ip, passthrough) = match select_address(&candidates) {
            Some(ip) => (ip, false),
            None if self.resolver.is_enabled() => {
                return Err(Rejection::Unresolvable {
                    host: authority.host().to_string(),
                }
                .into());
            }
            None => {
                let lookup =
                    tunnel::lookup_passthrough(authority.host(), authority.port(), timeout);
                let ip = watch_client(client, early_data, Stage::Resolved, lookup)
                    .await?
                    .map_err(Rejection::from)?;
                (ip, true)
            }
        };
        // `::ffff:a.b.c.d` is the same destination as `a.b.c.d`.
        let ip = ip.to_canonical();

        if let Verdict::Blocked(reason) = self.trust.classify(ip) {
            return Err(Rejection::Forbidden { addr: ip, reason }.into());
        }

        let key = if passthrough {
            authority.host().to_string()
        } else {
            ip.to_string()
        };
        let permit = self
            .admission
            .try_admit(&key)
            .ok_or(Rejection::TooManyTunnels { key })?;

        let addr = SocketAddr::new(ip, authority.port());
        let upstream = watch_client(client, early_data, Stage::Connected, tunnel::dial(addr, timeout))
            .await?
            .map_err(Rejection::from)?;

        Ok(Ready {
            upstream,
            upstream_addr: addr,
            permit,
        })
    }
}

/// Run `work` while watching the client for disconnects.
///
/// Bytes the client sends meanwhile are appended to `early_data`.
async fn watch_client<S, F>(
    client: &mut S,
    early_data: &mut Vec<u8>,
    stage: Stage,
    work: F,
) -> Result<F::Output, Abort>
where
    S: AsyncRead + Unpin,
    F: Future,
{
    tokio::select! {
        output = work => Ok(output),
        () = until_client_gone(client, early_data) => Err(Abort::ClientGone(stage)),
    }
}

async fn until_client_gone<S>(client: &mut S, early_data: &mut Vec<u8>)
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        if early_data.len() >= MAX_EARLY_DATA {
            // Stop reading; the client sees backpressure until the tunnel is up.
            std::future::pending::<()>().await;
        }
        let room = (MAX_EARLY_DATA - early_data.len()).min(buf.len());
        match client.read(&mut buf[..room]).await {
            Ok(0) | Err(_) => return,
            Ok(n) => early_data.extend_from_slice(&buf[..n]),
        }
    }
}
