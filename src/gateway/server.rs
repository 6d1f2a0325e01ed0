//! Gateway server and its lifecycle.

use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use super::assets::SpaAssets;
use super::router::{api_routes, build_router};
use super::tls::load_acceptor;
use crate::config::PorticoConfig;
use crate::error::{PorticoError, Result};
use crate::ratelimit::{CounterBackend, MemoryBackend, RateLimiter};

/// Pause before accepting again after running out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Where the server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, not yet accepting connections
    Starting,
    /// Accepting connections
    Serving,
    /// Listener closed, in-flight requests finishing
    Draining,
    /// Connections closed and counter cleanup halted
    Stopped,
}

/// HTTP gateway for the SPA bundle and its rate-limited API.
///
/// Starting the server starts the counter backend's cleanup; shutting it
/// down closes the listener, drains connections up to the configured
/// bound, and then stops the backend.
pub struct GatewayServer {
    config: PorticoConfig,
    assets: Arc<SpaAssets>,
    backend: Arc<dyn CounterBackend>,
    /// `None` when rate limiting is disabled
    limiter: Option<Arc<RateLimiter>>,
    /// Rate-limited API routes
    api: Router,
    tls: Option<TlsAcceptor>,
    state: watch::Sender<LifecycleState>,
}

impl GatewayServer {
    /// Create a server with an in-memory counter backend, loading the SPA
    /// bundle and any TLS material named by `config`.
    pub fn new(config: PorticoConfig) -> Result<Self> {
        let assets = SpaAssets::load(&config.server.public_dir)?;
        let backend = Arc::new(MemoryBackend::new(config.rate_limiting.cleanup_interval()));
        Self::with_backend(config, assets, backend)
    }

    /// Create a server over an existing counter backend.
    pub fn with_backend(
        config: PorticoConfig,
        assets: SpaAssets,
        backend: Arc<dyn CounterBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let tls = if config.tls.enabled {
            match (&config.tls.cert, &config.tls.key) {
                (Some(cert), Some(key)) => Some(load_acceptor(cert, key)?),
                _ => {
                    return Err(PorticoError::Config(
                        "tls.cert and tls.key are required when tls is enabled".to_string(),
                    ))
                }
            }
        } else {
            None
        };

        let limiter = config.rate_limiting.is_enabled().then(|| {
            Arc::new(RateLimiter::new(
                Arc::clone(&backend),
                config.rate_limiting.limit,
                config.rate_limiting.interval(),
            ))
        });

        if limiter.is_none() {
            warn!("Rate limiting disabled");
        }

        let (state, _) = watch::channel(LifecycleState::Starting);

        Ok(Self {
            config,
            assets: Arc::new(assets),
            backend,
            limiter,
            api: api_routes(),
            tls,
            state,
        })
    }

    /// Add routes to the rate-limited API group.
    pub fn with_api(mut self, api: Router) -> Self {
        self.api = self.api.merge(api);
        self
    }

    /// Subscribe to lifecycle transitions.
    pub fn lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn backend(&self) -> &Arc<dyn CounterBackend> {
        &self.backend
    }

    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// The fully layered gateway service.
    pub fn router(&self) -> Router {
        build_router(
            &self.config,
            Arc::clone(&self.assets),
            self.limiter.clone(),
            self.api.clone(),
        )
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.backend.start();

        let addr = self.config.server.bind;
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(%addr, error = %source, "Failed to bind listener");
                self.backend.stop().await;
                self.state.send_replace(LifecycleState::Stopped);
                return Err(PorticoError::Bind { addr, source });
            }
        };

        self.run(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.backend.start();
        self.run(listener, signal).await
    }

    async fn run<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (drain_tx, drain_rx) = watch::channel(false);
        let context = ConnectionContext {
            router: self.router(),
            tls: self.tls.clone(),
            read_timeout: self.config.server.read_timeout(),
            drain: drain_rx,
        };
        let mut connections = JoinSet::new();

        info!(
            addr = ?listener.local_addr().ok(),
            tls = self.tls.is_some(),
            "Gateway listening"
        );
        self.state.send_replace(LifecycleState::Serving);

        tokio::pin!(signal);

        let outcome = loop {
            tokio::select! {
                _ = &mut signal => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        connections.spawn(serve_connection(stream, remote, context.clone()));
                    }
                    Err(e) => {
                        if let Err(e) = recover_from_accept_error(e).await {
                            break Err(e);
                        }
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Connection task failed");
                    }
                }
            }
        };

        drop(listener);

        if let Err(e) = outcome {
            error!(error = %e, "Listener failed, closing all connections");
            connections.shutdown().await;
            self.backend.stop().await;
            self.state.send_replace(LifecycleState::Stopped);
            return Err(PorticoError::Serve(e));
        }

        let drain_timeout = self.config.server.drain_timeout();
        info!(
            connections = connections.len(),
            timeout = ?drain_timeout,
            "Shutdown requested, draining connections"
        );
        self.state.send_replace(LifecycleState::Draining);
        drain_tx.send_replace(true);

        let drained = tokio::time::timeout(drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Drain timeout elapsed, aborting remaining connections"
            );
            connections.shutdown().await;
        }

        self.backend.stop().await;
        self.state.send_replace(LifecycleState::Stopped);
        info!("Gateway stopped");

        Ok(())
    }
}

/// Per-listener state shared by every connection task.
#[derive(Clone)]
struct ConnectionContext {
    router: Router,
    tls: Option<TlsAcceptor>,
    /// Bound on the TLS handshake and on reading each request head
    read_timeout: Duration,
    drain: watch::Receiver<bool>,
}

async fn serve_connection(stream: TcpStream, remote: SocketAddr, context: ConnectionContext) {
    let Some(acceptor) = context.tls.clone() else {
        return drive(TokioIo::new(stream), remote, context).await;
    };

    match tokio::time::timeout(context.read_timeout, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => drive(TokioIo::new(stream), remote, context).await,
        Ok(Err(e)) => debug!(%remote, error = %e, "TLS handshake failed"),
        Err(_) => debug!(%remote, "TLS handshake timed out"),
    }
}

/// Serve HTTP/1.1 or HTTP/2 on one connection, finishing gracefully once
/// the drain signal fires.
async fn drive<I>(io: I, remote: SocketAddr, context: ConnectionContext)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let ConnectionContext {
        router,
        read_timeout,
        mut drain,
        ..
    } = context;

    let service = hyper::service::service_fn(move |mut request: hyper::Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(remote));
        router.clone().oneshot(request)
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout);
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(read_timeout)
        .keep_alive_timeout(read_timeout);

    let connection = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(connection);

    let mut draining = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    debug!(%remote, error = %e, "Connection closed with error");
                }
                break;
            }
            _ = drain.changed(), if !draining => {
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

/// How the accept loop treats a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// The peer went away before the connection was accepted
    Connection,
    /// Out of descriptors or memory; clears as connections close
    Exhausted,
    /// The listener itself is unusable
    Fatal,
}

/// `EMFILE` and `ENFILE`, which share values across Linux and the BSDs.
#[cfg(unix)]
const DESCRIPTOR_EXHAUSTION: &[i32] = &[24, 23];
/// `WSAEMFILE`.
#[cfg(windows)]
const DESCRIPTOR_EXHAUSTION: &[i32] = &[10024];
#[cfg(not(any(unix, windows)))]
const DESCRIPTOR_EXHAUSTION: &[i32] = &[];

fn classify_accept_error(e: &io::Error) -> AcceptFailure {
    match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => AcceptFailure::Connection,
        io::ErrorKind::OutOfMemory => AcceptFailure::Exhausted,
        _ if e
            .raw_os_error()
            .is_some_and(|code| DESCRIPTOR_EXHAUSTION.contains(&code)) =>
        {
            AcceptFailure::Exhausted
        }
        _ => AcceptFailure::Fatal,
    }
}

/// Decide whether the listener survives `e`, backing off first when the
/// process is out of resources. Returns the error if it is fatal.
async fn recover_from_accept_error(e: io::Error) -> io::Result<()> {
    match classify_accept_error(&e) {
        AcceptFailure::Connection => {
            debug!(error = %e, "Dropped connection during accept");
            Ok(())
        }
        AcceptFailure::Exhausted => {
            error!(error = %e, backoff = ?ACCEPT_BACKOFF, "Accept failed, retrying");
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            Ok(())
        }
        AcceptFailure::Fatal => Err(e),
    }
}
