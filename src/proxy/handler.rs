//! Request dispatcher
//!
//! Routes every request through the fixed stage order: info page, auth,
//! probe-resist page, decoy for rejected clients, protocol gate, then tunnel
//! or decoy. A failing stage aborts the request; no error page is produced.

use std::any::Any;
use std::error::Error as StdError;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use futures::FutureExt;
use hyper::body::Body;
use hyper::{Method, Request, Response, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::proxy::body::ProxyBody;
use crate::proxy::decoy::DecoyForwarder;
use crate::proxy::headers::{request_host, strip_port};
use crate::proxy::middleware::{AuthGate, AuthVerdict, CredentialSet};
use crate::proxy::pages;
use crate::proxy::pool::BufferPool;
use crate::proxy::stream::StreamCopier;
use crate::proxy::transport::Dialer;
use crate::proxy::tunnel::TunnelEstablisher;

/// Per-request router shared by every connection
#[derive(Clone)]
pub struct Dispatcher {
    auth: AuthGate,
    tunnel: TunnelEstablisher,
    decoy: DecoyForwarder,
    probe_resist_domain: Option<Arc<str>>,
}

impl Dispatcher {
    /// Wire up the dispatcher from validated configuration
    pub fn new(config: &Config, dialer: Arc<dyn Dialer>, pool: BufferPool) -> Self {
        let auth = AuthGate::new(CredentialSet::single(&config.username, &config.password));
        let tunnel = TunnelEstablisher::new(dialer.clone(), StreamCopier::new(pool.clone()));
        let decoy = DecoyForwarder::new(dialer, config.decoy_host.clone(), pool);

        Self {
            auth,
            tunnel,
            decoy,
            probe_resist_domain: config.probe_resist_domain().map(Arc::from),
        }
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    /// Route one request
    ///
    /// `I` is the transport the connection is served over; HTTP/1 tunnels
    /// take it back from hyper.
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri(), version = ?req.version()))]
    pub async fn dispatch<I, B>(&self, req: Request<B>) -> Result<Response<ProxyBody>>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        if guard("info", || Ok(is_info_request(&req)))? {
            debug!("Serving info page");
            return guard("info", pages::info_response);
        }

        let verdict = guard("auth", || Ok(self.auth.check_request(&req)))?;

        if let Some(domain) = self.probe_resist_domain.as_deref() {
            let on_probe_domain = request_host(&req)
                .map(|host| strip_port(&host) == domain)
                .unwrap_or(false);
            if on_probe_domain {
                debug!(authenticated = verdict.is_authenticated(), "Serving hidden page");
                return guard("hidden_page", || pages::hidden_page(&verdict));
            }
        }

        if let AuthVerdict::Rejected(reason) = verdict {
            debug!(reason = %reason, "Relaying unauthenticated request to decoy");
            return guarded("decoy", self.decoy.forward(req)).await;
        }

        let version = req.version();
        if protocol_major(version).is_none() {
            return Err(ProxyError::UnsupportedVersion(version));
        }

        if req.method() == Method::CONNECT {
            info!("Authenticated CONNECT to {}", req.uri());
            guarded("connect", self.tunnel.establish::<I, B>(req)).await
        } else {
            guarded("decoy", self.decoy.forward(req)).await
        }
    }
}

/// `GET /info` in origin form
///
/// HTTP/2 requests always carry a full URI built from the pseudo-headers, so
/// only their path is considered.
fn is_info_request<B>(req: &Request<B>) -> bool {
    let relative = req.version() == Version::HTTP_2 || req.uri().scheme().is_none();
    req.method() == Method::GET && relative && req.uri().path() == "/info"
}

fn protocol_major(version: Version) -> Option<u8> {
    match version {
        Version::HTTP_10 | Version::HTTP_11 => Some(1),
        Version::HTTP_2 => Some(2),
        _ => None,
    }
}

/// Run one asynchronous dispatch stage, turning a panic into a logged
/// [`ProxyError::Panic`]
pub async fn guarded<F, T>(stage: &'static str, stage_future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let outcome = AssertUnwindSafe(stage_future).catch_unwind().await;
    settle(stage, outcome)
}

/// Spawn a detached task under [`guarded`]
///
/// A panic resolves the handle to [`ProxyError::Panic`] instead of a join
/// error, after it has been logged like any other stage.
pub fn spawn_guarded<F, T>(stage: &'static str, task: F) -> JoinHandle<Result<T>>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(guarded(stage, task))
}

/// Synchronous counterpart of [`guarded`]
pub fn guard<F, T>(stage: &'static str, stage_fn: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    settle(stage, panic::catch_unwind(AssertUnwindSafe(stage_fn)))
}

fn settle<T>(stage: &'static str, outcome: thread::Result<Result<T>>) -> Result<T> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            debug!(stage, category = %e.category(), "Stage failed: {}", e);
            Err(e)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(stage, "Stage panicked: {}", message);
            Err(ProxyError::Panic { stage, message })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_info_request() {
        let req = Request::get("/info").body(()).unwrap();
        assert!(is_info_request(&req));

        let req = Request::get("http://example.com/info").body(()).unwrap();
        assert!(!is_info_request(&req));

        let req = Request::get("https://example.com/info")
            .version(Version::HTTP_2)
            .body(())
            .unwrap();
        assert!(is_info_request(&req));

        let req = Request::post("/info").body(()).unwrap();
        assert!(!is_info_request(&req));

        let req = Request::get("/info/").body(()).unwrap();
        assert!(!is_info_request(&req));
    }

    #[test]
    fn test_protocol_major() {
        assert_eq!(protocol_major(Version::HTTP_10), Some(1));
        assert_eq!(protocol_major(Version::HTTP_11), Some(1));
        assert_eq!(protocol_major(Version::HTTP_2), Some(2));
        assert_eq!(protocol_major(Version::HTTP_09), None);
        assert_eq!(protocol_major(Version::HTTP_3), None);
    }

    #[tokio::test]
    async fn test_guarded_passes_results_through() {
        assert_eq!(guarded("auth", async { Ok(7) }).await.unwrap(), 7);

        let err = guarded::<_, ()>("connect", async { Err(ProxyError::MissingTarget) })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::MissingTarget));
    }

    #[tokio::test]
    async fn test_guarded_converts_panics() {
        let err = guarded::<_, ()>("decoy", async { panic!("decoy exploded") })
            .await
            .unwrap_err();

        match err {
            ProxyError::Panic { stage, message } => {
                assert_eq!(stage, "decoy");
                assert_eq!(message, "decoy exploded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_guarded_reports_panics_through_the_handle() {
        let handle = spawn_guarded::<_, ()>("tunnel", async { panic!("relay exploded") });
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Panic { stage: "tunnel", ref message } if message == "relay exploded"
        ));

        let handle = spawn_guarded("decoy_body", async { Ok(3) });
        assert_eq!(handle.await.unwrap().unwrap(), 3);
    }

    #[test]
    fn test_guard_catches_synchronous_panics() {
        assert_eq!(guard("info", || Ok("page")).unwrap(), "page");

        let err = guard::<_, bool>("auth", || panic!("bad header")).unwrap_err();
        assert!(matches!(err, ProxyError::Panic { stage: "auth", .. }));
    }

    #[tokio::test]
    async fn test_guarded_formats_string_panics() {
        let code = 42;
        let err = guarded::<_, ()>("auth", async move { panic!("code {}", code) })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Panic { ref message, .. } if message == "code 42"));
    }
}
