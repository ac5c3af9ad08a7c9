//! Upstream dialing
//!
//! The dispatcher only ever talks to the [`Dialer`] trait; the TCP
//! implementation below applies the connect timeout and keep-alive that are
//! configured once at startup.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::config::Config;
use crate::error::{ProxyError, Result};

/// Trait for upstream connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Capability to open a connection to `host:port`
///
/// `Ok(None)` means the dialer declined the target without failing.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, addr: &str) -> Result<Option<Box<dyn ProxyConnection>>>;
}

/// Plain TCP dialer with a bounded connect time
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
    keepalive: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration, keepalive: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.connect_timeout(), config.keepalive())
    }

    /// Connect and tune the socket
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::DialTimeout(addr.to_string()))?
            .map_err(|source| ProxyError::Dial {
                addr: addr.to_string(),
                source,
            })?;

        let _ = stream.set_nodelay(true);
        if !self.keepalive.is_zero() {
            let sock_ref = socket2::SockRef::from(&stream);
            let keepalive = socket2::TcpKeepalive::new().with_time(self.keepalive);
            if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
                debug!("Failed to enable keep-alive for {}: {}", addr, e);
            }
        }

        Ok(stream)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    #[instrument(skip(self))]
    async fn dial(&self, addr: &str) -> Result<Option<Box<dyn ProxyConnection>>> {
        let stream = self.connect(addr).await?;
        debug!("Connected to {}", addr);
        Ok(Some(Box::new(stream)))
    }
}

/// Parse host and port from authority (for CONNECT requests)
///
/// Bracketed IPv6 literals are accepted; a missing port defaults to 443.
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let url = url::Url::parse(&format!("https://{}", authority))
        .map_err(|_| ProxyError::InvalidTarget(authority.to_string()))?;

    if url.path() != "/" || url.query().is_some() || !url.username().is_empty() {
        return Err(ProxyError::InvalidTarget(authority.to_string()));
    }

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ProxyError::InvalidTarget(authority.to_string()))?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(443);

    Ok((host, port))
}

/// Format `host:port`, bracketing IPv6 literals
pub fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_authority("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("[::1]:9000").unwrap(),
            ("[::1]".to_string(), 9000)
        );
        assert!(parse_authority("example.com:notaport").is_err());
        assert!(parse_authority("example.com:443/path").is_err());
        assert!(parse_authority("").is_err());
    }

    #[test]
    fn test_format_tcp_addr() {
        assert_eq!(format_tcp_addr("example.com", 443), "example.com:443");
        assert_eq!(format_tcp_addr("::1", 80), "[::1]:80");
        assert_eq!(format_tcp_addr("[::1]", 80), "[::1]:80");
    }

    #[tokio::test]
    async fn test_tcp_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
        });

        let dialer = TcpDialer::new(Duration::from_secs(5), Duration::from_secs(30));
        let mut conn = dialer
            .dial(&addr.to_string())
            .await
            .unwrap()
            .expect("tcp dialer always yields a connection");

        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_tcp_dialer_refused() {
        // Bind then drop to get a port nobody is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = TcpDialer::new(Duration::from_secs(5), Duration::ZERO);
        let err = dialer.dial(&addr.to_string()).await.err().unwrap();
        assert!(matches!(err, ProxyError::Dial { .. }));
    }
}
