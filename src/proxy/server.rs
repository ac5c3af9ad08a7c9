//! Proxy server implementation using hyper
//!
//! Accepts TCP connections, terminates TLS and serves each connection with
//! the HTTP version the client negotiated through ALPN.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument};

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::proxy::handler::Dispatcher;
use crate::proxy::pool::BufferPool;
use crate::proxy::transport::TcpDialer;
use crate::tls::ALPN_H2;

/// HTTP flavour a connection is served with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Http1,
    Http2,
}

impl ConnectionMode {
    /// Pick the mode from the negotiated ALPN protocol
    pub fn from_alpn(protocol: Option<&[u8]>) -> Self {
        match protocol {
            Some(p) if p == ALPN_H2 => ConnectionMode::Http2,
            _ => ConnectionMode::Http1,
        }
    }
}

/// Proxy server
pub struct ProxyServer {
    listen_addr: String,
    acceptor: TlsAcceptor,
    dispatcher: Dispatcher,
    pool: BufferPool,
}

impl ProxyServer {
    /// Create a new proxy server from validated configuration
    pub fn new(config: &Config, acceptor: TlsAcceptor) -> Result<Self> {
        let pool = BufferPool::default();
        let dialer = Arc::new(TcpDialer::from_config(config));
        let dispatcher = Dispatcher::new(config, dialer, pool.clone());

        Ok(Self {
            listen_addr: config.listen_addr()?,
            acceptor,
            dispatcher,
            pool,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Bind the configured address and serve until `shutdown` flips to true
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr.as_str()).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    #[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Proxy server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let acceptor = self.acceptor.clone();
                            let dispatcher = self.dispatcher.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, client_addr, acceptor, dispatcher).await {
                                    debug!(client = %client_addr, category = %e.category(), "Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        let stats = self.pool.stats();
        debug!(
            idle = stats.idle,
            outstanding = stats.outstanding,
            leased_total = stats.leased_total,
            auth_verdicts = self.dispatcher.auth().verdicts(),
            "Final proxy statistics"
        );
        Ok(())
    }

    /// Terminate TLS and serve a single connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        acceptor: TlsAcceptor,
        dispatcher: Dispatcher,
    ) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let tls = acceptor
            .accept(stream)
            .await
            .map_err(|e| ProxyError::Tls(format!("handshake with {} failed: {}", client_addr, e)))?;

        let mode = ConnectionMode::from_alpn(tls.get_ref().1.alpn_protocol());
        debug!(client = %client_addr, mode = ?mode, "TLS session established");

        Self::serve_connection(dispatcher, tls, mode).await
    }

    /// Serve HTTP over any transport
    ///
    /// HTTP/1 connections keep upgrades enabled so CONNECT can take the
    /// transport back; HTTP/2 runs its streams on the tokio executor.
    pub async fn serve_connection<I>(dispatcher: Dispatcher, io: I, mode: ConnectionMode) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch::<I, Incoming>(req).await }
        });

        match mode {
            ConnectionMode::Http1 => {
                http1::Builder::new()
                    .preserve_header_case(true)
                    .title_case_headers(true)
                    .serve_connection(TokioIo::new(io), service)
                    .with_upgrades()
                    .await?
            }
            ConnectionMode::Http2 => {
                http2::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(io), service)
                    .await?
            }
        }

        Ok(())
    }
}
