//! Relay to the decoy backend
//!
//! Failed-auth traffic and authenticated non-CONNECT traffic both end up
//! here, so to an observer the proxy looks like an ordinary reverse proxy in
//! front of the decoy site. Any failure aborts the request; nothing is
//! synthesized for the client.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, HOST};
use hyper::{Method, Request, Response, Uri, Version};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, instrument};

use crate::error::{ProxyError, Result};
use crate::proxy::body::ProxyBody;
use crate::proxy::handler::spawn_guarded;
use crate::proxy::headers::remove_hop_by_hop;
use crate::proxy::pool::BufferPool;
use crate::proxy::transport::Dialer;

/// Frames buffered between the pump task and hyper
const BODY_CHANNEL_DEPTH: usize = 4;

/// Forwards requests verbatim to the configured decoy host
#[derive(Clone)]
pub struct DecoyForwarder {
    dialer: Arc<dyn Dialer>,
    decoy_host: String,
    pool: BufferPool,
}

impl DecoyForwarder {
    pub fn new(dialer: Arc<dyn Dialer>, decoy_host: impl Into<String>, pool: BufferPool) -> Self {
        Self {
            dialer,
            decoy_host: decoy_host.into(),
            pool,
        }
    }

    pub fn decoy_host(&self) -> &str {
        &self.decoy_host
    }

    /// Send `req` to the decoy and return its response minus hop-by-hop headers
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn forward<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let conn = self
            .dialer
            .dial(&self.decoy_host)
            .await?
            .ok_or_else(|| ProxyError::TargetNotAllowed(self.decoy_host.clone()))?;

        let req = into_origin_request(req)?;

        let (mut sender, connection) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(conn))
            .await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Decoy connection ended: {}", e);
            }
        });

        let response = sender.send_request(req).await?;
        let (mut parts, incoming) = response.into_parts();
        remove_hop_by_hop(&mut parts.headers);

        debug!(status = %parts.status, "Decoy responded");
        Ok(Response::from_parts(parts, self.relay_body(incoming)))
    }

    /// Stream `body` to the client through a pooled buffer
    ///
    /// The pump task holds one lease for its whole life and stops as soon as
    /// either side goes away.
    fn relay_body<B>(&self, body: B) -> ProxyBody
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (tx, rx) = mpsc::channel::<io::Result<Frame<Bytes>>>(BODY_CHANNEL_DEPTH);
        let pool = self.pool.clone();

        spawn_guarded("decoy_body", async move {
            let stream = body.into_data_stream().map_err(io::Error::other);
            let reader = StreamReader::new(stream);
            tokio::pin!(reader);
            let mut lease = pool.lease();

            loop {
                match reader.read(&mut lease[..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&lease[..n]);
                        if tx.send(Ok(Frame::data(chunk))).await.is_err() {
                            debug!("Client went away during decoy body");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Decoy body failed: {}", e);
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }

            drop(lease);
            drop(tx);
            Ok(())
        });

        StreamBody::new(ReceiverStream::new(rx)).boxed()
    }
}

/// Rewrite a proxy request into what an origin server expects on HTTP/1.1
///
/// Absolute-form targets become origin-form, CONNECT keeps its authority, and
/// a missing `Host` header is filled from the authority.
fn into_origin_request<B>(req: Request<B>) -> Result<Request<B>> {
    let (mut parts, body) = req.into_parts();
    let authority = parts.uri.authority().cloned();

    if parts.method != Method::CONNECT {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");
        parts.uri = path
            .parse::<Uri>()
            .map_err(|e| ProxyError::Http(e.to_string()))?;
    }

    if !parts.headers.contains_key(HOST) {
        if let Some(authority) = authority {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|e| ProxyError::Http(e.to_string()))?;
            parts.headers.insert(HOST, value);
        }
    }

    parts.version = Version::HTTP_11;
    Ok(Request::from_parts(parts, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::transport::TcpDialer;
    use http_body_util::{Empty, Full};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Accept one connection, capture the request head and answer with `response`
    async fn spawn_decoy(response: &'static [u8]) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (head_tx, head_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                if socket.read(&mut byte).await.unwrap() == 0 {
                    break;
                }
                head.push(byte[0]);
            }
            let _ = head_tx.send(String::from_utf8_lossy(&head).into_owned());
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        (addr, head_rx)
    }

    fn forwarder(decoy: &str, pool: BufferPool) -> DecoyForwarder {
        let dialer = Arc::new(TcpDialer::new(Duration::from_secs(5), Duration::ZERO));
        DecoyForwarder::new(dialer, decoy, pool)
    }

    #[test]
    fn test_into_origin_request_rewrites_absolute_form() {
        let req = Request::builder()
            .uri("http://example.com:8080/a/b?c=d")
            .body(())
            .unwrap();
        let req = into_origin_request(req).unwrap();

        assert_eq!(req.uri(), "/a/b?c=d");
        assert_eq!(req.headers()[HOST], "example.com:8080");
        assert_eq!(req.version(), Version::HTTP_11);
    }

    #[test]
    fn test_into_origin_request_keeps_existing_host_and_connect_target() {
        let req = Request::builder()
            .uri("http://ignored.example/")
            .header(HOST, "kept.example")
            .body(())
            .unwrap();
        let req = into_origin_request(req).unwrap();
        assert_eq!(req.headers()[HOST], "kept.example");

        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("target.example:443")
            .version(Version::HTTP_2)
            .body(())
            .unwrap();
        let req = into_origin_request(req).unwrap();
        assert_eq!(req.uri(), "target.example:443");
        assert_eq!(req.headers()[HOST], "target.example:443");
    }

    #[tokio::test]
    async fn test_forward_strips_hop_by_hop_and_streams_body() {
        let (decoy, head_rx) = spawn_decoy(
            b"HTTP/1.1 200 OK\r\n\
              Content-Type: text/html\r\n\
              Content-Length: 14\r\n\
              Connection: keep-alive, X-Decoy-Hop\r\n\
              Keep-Alive: timeout=5\r\n\
              X-Decoy-Hop: 1\r\n\
              \r\n\
              <h1>hello</h1>",
        )
        .await;
        let pool = BufferPool::new(4, 4);
        let forwarder = forwarder(&decoy, pool.clone());

        let req = Request::builder()
            .uri("http://www.example.com/index.html")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = forwarder.forward(req).await.unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], "text/html");
        assert!(response.headers().get("connection").is_none());
        assert!(response.headers().get("keep-alive").is_none());
        assert!(response.headers().get("x-decoy-hop").is_none());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"<h1>hello</h1>");

        let head = head_rx.await.unwrap();
        assert!(head.starts_with("GET /index.html HTTP/1.1\r\n"), "{}", head);
        assert!(head.contains("Host: www.example.com\r\n"), "{}", head);

        // The pump task returns its buffer once the body is drained.
        for _ in 0..50 {
            if pool.outstanding() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_forward_fails_without_decoy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let forwarder = forwarder(&addr, BufferPool::default());
        let req = Request::builder()
            .uri("/")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(forwarder.forward(req).await.is_err());
    }

    #[tokio::test]
    async fn test_forward_fails_on_garbage_response() {
        let (decoy, _head_rx) = spawn_decoy(b"this is not http\r\n\r\n").await;
        let forwarder = forwarder(&decoy, BufferPool::default());

        let req = Request::builder()
            .uri("/")
            .header(HOST, "www.example.com")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(forwarder.forward(req).await.is_err());
    }
}
