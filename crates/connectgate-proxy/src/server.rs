//! Listener, per-connection transport and server lifecycle.
//!
//! # Lifecycle
//!
//! ```text
//! ProxyServer::new(config)            -- builds DoH client, loads TLS material
//!       |
//!       +-- with_lookup / with_resolution_store / with_admission_store
//!       |
//!       v
//! ProxyServer::start() --> ProxyHandle
//!       |                       |
//!       v                       |
//! accept loop, one task         |
//! per connection                |
//!       |                       v
//!       |               ProxyHandle::shutdown()
//!       v                       |
//! stop accepting <--------------+
//! ```
//!
//! # Per-Connection Transport
//!
//! ```text
//! accept --> [TLS handshake] --> read request head (16 KiB, 10 s)
//!                                     |
//!         +---------------------------+--------------------+
//!         |                           |                    |
//!      CONNECT              GET /healthz | /health      anything else
//!         |                           |                    |
//!    ConnectHandler               200 "ok"          405, Allow: CONNECT
//! ```
//!
//! Tunnels already running when the server shuts down are left to finish.

use crate::admission::{AdmissionController, AdmissionStore, MemoryAdmissionStore};
use crate::auth::{Authenticator, Credentials};
use crate::dns::{DnsLookup, DohClient, MemoryResolutionStore, ResolutionStore, Resolver, ResolverConfig};
use crate::handler::{status_response, ConnectHandler, ConnectRequest};
use crate::request::{is_health_path, read_request_head};
use crate::tls::{self, TlsFiles};
use crate::trust::TrustClassifier;
use crate::tunnel::TunnelConfig;
use crate::{ProxyError, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const HEALTH_RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
    Content-Type: text/plain\r\n\
    Content-Length: 2\r\n\
    Connection: close\r\n\r\nok";

const METHOD_NOT_ALLOWED_RESPONSE: &str = "HTTP/1.1 405 Method Not Allowed\r\n\
    Allow: CONNECT\r\n\
    Content-Length: 0\r\n\
    Connection: close\r\n\r\n";

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listener address.
    /// Default: `127.0.0.1:0` (loopback, OS-assigned port)
    pub bind_addr: SocketAddr,

    /// Serve TLS on the listener when set.
    /// Default: `None` (plaintext)
    pub tls: Option<TlsFiles>,

    /// Required proxy credentials.
    /// Default: `None` (open mode, every request authorized)
    pub credentials: Option<Credentials>,

    /// Realm in the `Proxy-Authenticate` challenge.
    /// Default: `connectgate`
    pub realm: String,

    /// Hostname resolution policy.
    pub resolver: ResolverConfig,

    /// Refuse private, loopback, link-local and other special ranges.
    /// Default: `true`
    pub block_private: bool,

    /// Concurrent tunnels allowed per destination.
    /// Default: 32
    pub max_tunnels_per_destination: usize,

    /// Connect / idle timeouts and the `Proxy-Agent` value.
    pub tunnel: TunnelConfig,

    /// Bound on the TLS handshake and on receiving the request head.
    /// Default: 10 seconds
    pub head_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().expect("hardcoded loopback address"),
            tls: None,
            credentials: None,
            realm: "connectgate".to_string(),
            resolver: ResolverConfig::default(),
            block_private: true,
            max_tunnels_per_destination: 32,
            tunnel: TunnelConfig::default(),
            head_timeout: Duration::from_secs(10),
        }
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    /// Shutdown signal sender.
    shutdown_tx: Option<oneshot::Sender<()>>,

    /// Join handle for the accept loop.
    join_handle: Option<tokio::task::JoinHandle<Result<()>>>,

    /// Actual listener address (OS-assigned port resolved).
    local_addr: SocketAddr,

    resolver: Resolver,
    admission: AdmissionController,
}

impl ProxyHandle {
    /// Check if the accept loop is still running.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// In-flight tunnels for an admission key (IP text or passthrough hostname).
    pub fn in_flight(&self, key: &str) -> usize {
        self.admission.in_flight(key)
    }

    /// Cached addresses for `host`, if a fresh entry exists.
    pub fn cached_addresses(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.resolver.cached(host)
    }

    /// Stop accepting new connections.
    ///
    /// If the accept loop does not stop within 2 seconds it is left to finish
    /// on its own. Established tunnels are not interrupted.
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`.
    pub async fn shutdown(mut self) -> Result<()> {
        let signal_sent = match self.shutdown_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        };

        if let Some(handle) = self.join_handle.take() {
            if signal_sent {
                match tokio::time::timeout(Duration::from_secs(2), handle).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) if e.is_cancelled() => {}
                    Ok(Err(_)) => {} // Task panicked, already logged
                    Err(_) => {
                        warn!("accept loop did not stop within 2s");
                    }
                }
            } else {
                handle.abort();
            }
        }

        Ok(())
    }
}

/// HTTP CONNECT forward proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    lookup: Arc<dyn DnsLookup>,
    resolution_store: Arc<dyn ResolutionStore>,
    admission_store: Arc<dyn AdmissionStore>,
    tls: Option<TlsAcceptor>,
}

impl ProxyServer {
    /// Create a new proxy server with the DoH lookup and in-memory stores.
    ///
    /// # Errors
    /// * `ProxyError::InvalidDohUrl` - the configured DoH URL is not http(s)
    /// * `ProxyError::HttpClient` - the DoH HTTP client could not be built
    /// * `ProxyError::TlsMaterial` - TLS is configured but the files are unusable
    ///
    /// # Example
    /// ```ignore
    /// let server = ProxyServer::new(ProxyConfig::default())?;
    /// let handle = server.start().await?;
    /// // ... later ...
    /// handle.shutdown().await?;
    /// ```
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let lookup = Arc::new(DohClient::new(&config.resolver.doh_url)?);
        let tls = config.tls.as_ref().map(tls::load_acceptor).transpose()?;
        Ok(Self {
            config,
            lookup,
            resolution_store: Arc::new(MemoryResolutionStore::new()),
            admission_store: Arc::new(MemoryAdmissionStore::new()),
            tls,
        })
    }

    /// Replace the name-resolution service.
    pub fn with_lookup(mut self, lookup: Arc<dyn DnsLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    /// Replace the resolution cache store.
    pub fn with_resolution_store(mut self, store: Arc<dyn ResolutionStore>) -> Self {
        self.resolution_store = store;
        self
    }

    /// Replace the admission counter store.
    pub fn with_admission_store(mut self, store: Arc<dyn AdmissionStore>) -> Self {
        self.admission_store = store;
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Start the proxy in a background task.
    ///
    /// The listener is bound before returning, so the OS-assigned port is
    /// known immediately via [`ProxyHandle::local_addr`].
    ///
    /// # Errors
    /// * `ProxyError::Bind` - the listener could not be bound
    pub async fn start(self) -> Result<ProxyHandle> {
        let (listener, local_addr) = self.bind().await?;
        let context = Arc::new(self.into_context());
        let resolver = context.handler.resolver().clone();
        let admission = context.handler.admission().clone();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(async move {
            tokio::select! {
                result = accept_loop(listener, context) => result,
                _ = shutdown_rx => Ok(()),
            }
        });

        Ok(ProxyHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
            local_addr,
            resolver,
            admission,
        })
    }

    /// Run the proxy on the current task until the process is stopped.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - the listener could not be bound
    pub async fn run(self) -> Result<()> {
        let (listener, _) = self.bind().await?;
        accept_loop(listener, Arc::new(self.into_context())).await
    }

    async fn bind(&self) -> Result<(TcpListener, SocketAddr)> {
        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind { addr, source })?;

        info!(
            addr = %local_addr,
            tls = self.tls.is_some(),
            auth = self.config.credentials.is_some(),
            resolution = self.config.resolver.enabled,
            block_private = self.config.block_private,
            "proxy listening"
        );
        Ok((listener, local_addr))
    }

    fn into_context(self) -> ServerContext {
        let resolver = Resolver::new(
            self.config.resolver.clone(),
            self.lookup,
            self.resolution_store,
        );
        let handler = ConnectHandler::new(
            Authenticator::new(self.config.credentials.clone(), self.config.realm.clone()),
            resolver,
            TrustClassifier::new(self.config.block_private),
            AdmissionController::new(self.admission_store, self.config.max_tunnels_per_destination),
            self.config.tunnel.clone(),
        );
        ServerContext {
            handler,
            tls: self.tls,
            head_timeout: self.config.head_timeout,
        }
    }
}

/// State shared by every connection task.
struct ServerContext {
    handler: ConnectHandler,
    tls: Option<TlsAcceptor>,
    head_timeout: Duration,
}

async fn accept_loop(listener: TcpListener, context: Arc<ServerContext>) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "TCP accept error");
                continue;
            }
        };
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            context.serve(stream, peer).await;
        });
    }
}

impl ServerContext {
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        // Disable Nagle for interactive traffic
        stream.set_nodelay(true).ok();

        let Some(acceptor) = &self.tls else {
            return self.serve_stream(stream, peer).await;
        };
        match tokio::time::timeout(self.head_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => self.serve_stream(tls_stream, peer).await,
            Ok(Err(e)) => debug!(client = %peer, error = %e, "TLS handshake failed"),
            Err(_) => debug!(client = %peer, "TLS handshake timed out"),
        }
    }

    async fn serve_stream<S>(&self, mut stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let head = match tokio::time::timeout(self.head_timeout, read_request_head(&mut stream)).await
        {
            Ok(Ok(head)) => head,
            Ok(Err(e)) if e.is_bad_request() => {
                debug!(client = %peer, error = %e, "bad request head");
                stream.write_all(status_response(400).as_bytes()).await.ok();
                stream.shutdown().await.ok();
                return;
            }
            Ok(Err(e)) => {
                debug!(client = %peer, error = %e, "connection ended before request head");
                return;
            }
            Err(_) => {
                debug!(client = %peer, "request head timed out");
                return;
            }
        };

        match head.method.as_str() {
            "CONNECT" => {
                debug!(client = %peer, target = %head.target, "CONNECT received");
                let request = ConnectRequest {
                    target: head.target,
                    proxy_authorization: head.proxy_authorization,
                    early_data: head.remainder,
                };
                let outcome = self.handler.handle(stream, request).await;
                debug!(client = %peer, ?outcome, "session finished");
            }
            "GET" if is_health_path(&head.target) => {
                stream.write_all(HEALTH_RESPONSE.as_bytes()).await.ok();
                stream.shutdown().await.ok();
            }
            method => {
                debug!(client = %peer, method, target = %head.target, "method not allowed");
                stream
                    .write_all(METHOD_NOT_ALLOWED_RESPONSE.as_bytes())
                    .await
                    .ok();
                stream.shutdown().await.ok();
            }
        }
    }
}
