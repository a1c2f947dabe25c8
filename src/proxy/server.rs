//! Listener supervision and connection serving
//!
//! Each listener moves through `Starting -> Serving` and, when binding or
//! accepting fails fatally, either `BackingOff -> Starting` or exits the
//! process, depending on the failure policy.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument, warn};

use crate::config::FailurePolicy;
use crate::context::ProxyContext;
use crate::dialer::BoxedConnection;
use crate::error::{ProxyError, Result};
use crate::obfuscation::ObfuscatedListener;
use crate::proxy::handler::{error_response, ProxyHandler, Scheme};
use crate::shutdown::ExitSignal;

/// Growth factor between consecutive restart waits
pub const BACKOFF_GROWTH: f64 = 1.618;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Restart delays: 1s, then ×1.618 per failure, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        Self {
            current: INITIAL_BACKOFF.min(max),
            max,
        }
    }

    /// The wait before the next restart
    pub fn next_wait(&mut self) -> Duration {
        let wait = self.current;
        self.current = self.current.mul_f64(BACKOFF_GROWTH).min(self.max);
        wait
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    Serving,
    BackingOff,
}

/// Bind parameters for one listener
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub addr: String,
    pub scheme: Scheme,
    /// Decode disguise headers on accepted connections
    pub obfuscate: bool,
}

enum Listener {
    Plain(TcpListener),
    Obfuscated(ObfuscatedListener),
}

impl Listener {
    async fn bind(addr: &str, obfuscate: bool) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::wrap(listener, obfuscate))
    }

    fn wrap(listener: TcpListener, obfuscate: bool) -> Self {
        if obfuscate {
            Self::Obfuscated(ObfuscatedListener::from_listener(listener))
        } else {
            Self::Plain(listener)
        }
    }

    async fn accept(&self) -> io::Result<(BoxedConnection, SocketAddr)> {
        match self {
            Listener::Plain(l) => {
                let (stream, peer) = l.accept().await?;
                let conn: BoxedConnection = Box::new(stream);
                Ok((conn, peer))
            }
            Listener::Obfuscated(l) => {
                let (stream, peer) = l.accept().await?;
                let conn: BoxedConnection = Box::new(stream);
                Ok((conn, peer))
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Plain(l) => l.local_addr(),
            Listener::Obfuscated(l) => l.local_addr(),
        }
    }
}

/// Accept errors that only concern one connection
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// One supervised proxy listener
pub struct ProxyServer {
    config: ListenerConfig,
    handler: Arc<ProxyHandler>,
    tls: Option<TlsAcceptor>,
    policy: FailurePolicy,
    max_backoff: Duration,
    exit: ExitSignal,
}

impl ProxyServer {
    /// HTTPS listeners terminate TLS with certificates minted per SNI name
    pub fn new(
        ctx: Arc<ProxyContext>,
        config: ListenerConfig,
        policy: FailurePolicy,
        max_backoff: Duration,
    ) -> Result<Self> {
        let tls = match config.scheme {
            Scheme::Http => None,
            Scheme::Https => Some(TlsAcceptor::from(ctx.minter().server_config()?)),
        };
        let exit = ctx.exit().clone();

        Ok(Self {
            handler: Arc::new(ProxyHandler::new(ctx, config.scheme)),
            config,
            tls,
            policy,
            max_backoff,
            exit,
        })
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Keep the listener up until the exit signal fires
    ///
    /// Under [`FailurePolicy::Exit`] the first fatal failure raises the exit
    /// signal and is returned.
    #[instrument(skip(self), fields(scheme = %self.config.scheme, addr = %self.config.addr))]
    pub async fn run(&self) -> Result<()> {
        let mut backoff = Backoff::new(self.max_backoff);

        loop {
            debug!(state = ?ListenerState::Starting, "Binding listener");
            let result = match Listener::bind(&self.config.addr, self.config.obfuscate).await {
                Ok(listener) => self.serve(listener).await,
                Err(source) => Err(ProxyError::Listen {
                    addr: self.config.addr.clone(),
                    source,
                }),
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            error!(error = %err, "Listener failed");

            if self.policy == FailurePolicy::Exit {
                self.exit
                    .trigger(format!("{} listener failed: {}", self.config.scheme, err));
                return Err(err);
            }

            let wait = backoff.next_wait();
            warn!(
                state = ?ListenerState::BackingOff,
                wait_secs = wait.as_secs_f64(),
                "Restarting listener after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.exit.wait() => return Ok(()),
            }
        }
    }

    /// Serve an already bound listener until exit or a fatal accept error
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        self.serve(Listener::wrap(listener, self.config.obfuscate))
            .await
    }

    async fn serve(&self, listener: Listener) -> Result<()> {
        let local = listener.local_addr()?;
        info!(state = ?ListenerState::Serving, %local, "Proxy listener ready");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        let handler = self.handler.clone();
                        let tls = self.tls.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(conn, handler, tls).await {
                                debug!(%peer, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) if is_transient(&e) => {
                        debug!(error = %e, "Transient accept error");
                    }
                    Err(source) => {
                        return Err(ProxyError::Listen {
                            addr: local.to_string(),
                            source,
                        });
                    }
                },
                _ = self.exit.wait() => {
                    info!(%local, "Proxy listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(
        conn: BoxedConnection,
        handler: Arc<ProxyHandler>,
        tls: Option<TlsAcceptor>,
    ) -> Result<()> {
        match tls {
            None => Self::serve_http(conn, handler).await,
            Some(acceptor) => {
                let stream = acceptor
                    .accept(conn)
                    .await
                    .map_err(|e| ProxyError::Transport(format!("TLS accept failed: {}", e)))?;
                Self::serve_http(stream, handler).await
            }
        }
    }

    async fn serve_http<IO>(io: IO, handler: Arc<ProxyHandler>) -> Result<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            async move {
                match handler.handle(req).await {
                    Ok(response) => Ok::<_, Infallible>(response),
                    Err(e) => {
                        warn!(error = %e, "Request handling error");
                        Ok(error_response(e.status_code(), &format!("Error: {}", e)))
                    }
                }
            }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await?;

        Ok(())
    }
}
