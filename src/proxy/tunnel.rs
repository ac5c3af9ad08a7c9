//! CONNECT tunnel implementation
//!
//! HTTP/1.1 tunnels take over the raw client transport once hyper has written
//! the `200` head. HTTP/2 tunnels cannot do that, so the CONNECT stream itself
//! becomes the client side of the relay and every write is flushed.

use std::fmt;
use std::sync::Arc;

use hyper::header::HOST;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::error::{ProxyError, Result};
use crate::proxy::body::{self, ProxyBody};
use crate::proxy::handler::guarded;
use crate::proxy::stream::{Capabilities, Endpoint, StreamCopier};
use crate::proxy::transport::{format_tcp_addr, parse_authority, Dialer, ProxyConnection};

/// How the client side of a tunnel is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Http1Hijack,
    Http2Stream,
}

impl TransportMode {
    /// Pick the mode for a request's protocol version
    pub fn for_version(version: Version) -> Result<Self> {
        match version {
            Version::HTTP_10 | Version::HTTP_11 => Ok(TransportMode::Http1Hijack),
            Version::HTTP_2 => Ok(TransportMode::Http2Stream),
            other => Err(ProxyError::UnsupportedVersion(other)),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Http1Hijack => f.write_str("http1-hijack"),
            TransportMode::Http2Stream => f.write_str("http2-stream"),
        }
    }
}

/// Handles authenticated CONNECT requests
#[derive(Clone)]
pub struct TunnelEstablisher {
    dialer: Arc<dyn Dialer>,
    copier: StreamCopier,
}

impl TunnelEstablisher {
    pub fn new(dialer: Arc<dyn Dialer>, copier: StreamCopier) -> Self {
        Self { dialer, copier }
    }

    /// Dial the CONNECT target and answer `200`; the relay starts on upgrade
    ///
    /// `I` is the IO type the HTTP/1 connection was served over, needed to
    /// take the raw transport back from hyper.
    #[instrument(skip(self, req), fields(uri = %req.uri(), version = ?req.version()))]
    pub async fn establish<I, B>(&self, mut req: Request<B>) -> Result<Response<ProxyBody>>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mode = TransportMode::for_version(req.version())?;

        if mode == TransportMode::Http2Stream
            && (req.uri().scheme().is_some() || !req.uri().path().is_empty())
        {
            return Err(ProxyError::ConnectPseudoHeaders);
        }

        let authority = connect_target(&req)?;
        let (host, port) = parse_authority(&authority)?;
        let target_addr = format_tcp_addr(&host, port);

        let target = match self.dialer.dial(&target_addr).await {
            Ok(Some(conn)) => conn,
            Ok(None) => return Err(ProxyError::TargetNotAllowed(host)),
            Err(e) => {
                debug!("CONNECT dial to {} failed: {}", target_addr, e);
                return Err(e);
            }
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        let session = TunnelSession {
            target,
            target_addr,
            mode,
        };
        let copier = self.copier.clone();

        tokio::spawn(async move {
            let target_addr = session.target_addr.clone();
            if let Err(e) = guarded("tunnel", session.run::<I>(on_upgrade, copier)).await {
                warn!(target_addr = %target_addr, category = %e.category(), "Tunnel aborted: {}", e);
            }
        });

        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(body::empty())?)
    }
}

/// Authority of a CONNECT request, falling back to the `Host` header
fn connect_target<B>(req: &Request<B>) -> Result<String> {
    if let Some(authority) = req.uri().authority() {
        return Ok(authority.as_str().to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .ok_or(ProxyError::MissingTarget)
}

/// One established CONNECT tunnel
///
/// Owns the target connection; it is closed when the last copy direction
/// drops its half.
pub struct TunnelSession {
    target: Box<dyn ProxyConnection>,
    target_addr: String,
    mode: TransportMode,
}

impl TunnelSession {
    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    async fn run<I>(mut self, on_upgrade: OnUpgrade, copier: StreamCopier) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let upgraded = on_upgrade
            .await
            .map_err(|e| ProxyError::Upgrade(e.to_string()))?;

        let outcome = match self.mode {
            TransportMode::Http1Hijack => {
                let parts = upgraded
                    .downcast::<TokioIo<I>>()
                    .map_err(|_| ProxyError::HijackUnavailable)?;

                // Bytes the client pipelined behind the CONNECT head go first.
                if !parts.read_buf.is_empty() {
                    self.target.write_all(&parts.read_buf).await?;
                }

                info!(target_addr = %self.target_addr, mode = %self.mode, "CONNECT tunnel established");
                copier
                    .relay(
                        Endpoint::new(parts.io.into_inner(), Capabilities::RAW),
                        Endpoint::new(self.target, Capabilities::RAW),
                    )
                    .await
            }
            TransportMode::Http2Stream => {
                info!(target_addr = %self.target_addr, mode = %self.mode, "CONNECT tunnel established");
                copier
                    .relay(
                        Endpoint::new(TokioIo::new(upgraded), Capabilities::FLUSHING),
                        Endpoint::new(self.target, Capabilities::RAW),
                    )
                    .await
            }
        };

        let sent = outcome.client_to_target?;
        debug!(target_addr = %self.target_addr, bytes_sent = sent, "Tunnel primary direction closed");

        // The download keeps flowing after a client half-close until the target ends it.
        match outcome.target_to_client.await {
            Ok(Ok(received)) => {
                debug!(target_addr = %self.target_addr, bytes_received = received, "Tunnel closed")
            }
            Ok(Err(e)) => debug!(target_addr = %self.target_addr, "target->client ended: {}", e),
            Err(e) => warn!(target_addr = %self.target_addr, "target->client task failed: {}", e),
        }
        Ok(())
    }
}
