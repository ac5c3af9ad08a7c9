//! Proxy authentication gate
//!
//! Parses the `Proxy-Authorization` header and checks the Basic credential
//! against the configured set. The verdict is only ever acted on by the
//! dispatcher; nothing here writes a response.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::{HeaderValue, PROXY_AUTHORIZATION};
use hyper::Request;
use tracing::debug;

/// Why a request failed authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Malformed,
    UnsupportedScheme,
    InvalidCredentials,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Malformed => "malformed",
            RejectReason::UnsupportedScheme => "unsupported-scheme",
            RejectReason::InvalidCredentials => "invalid-credentials",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of checking one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    Authenticated,
    Rejected(RejectReason),
}

impl AuthVerdict {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthVerdict::Authenticated)
    }
}

/// Pre-encoded `base64(user:pass)` tokens accepted by the proxy
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    tokens: Vec<Vec<u8>>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set holding the single configured username/password pair
    pub fn single(username: &str, password: &str) -> Self {
        let mut set = Self::new();
        set.push(username, password);
        set
    }

    pub fn push(&mut self, username: &str, password: &str) {
        let encoded = BASE64.encode(format!("{}:{}", username, password));
        self.tokens.push(encoded.into_bytes());
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Compare `token` against every entry without short-circuiting on content
    fn contains(&self, token: &[u8]) -> bool {
        self.tokens
            .iter()
            .any(|expected| constant_time_eq(expected, token))
    }
}

/// Authentication gate shared by every connection
#[derive(Clone)]
pub struct AuthGate {
    credentials: Arc<CredentialSet>,
    verdicts: Arc<AtomicU64>,
}

impl AuthGate {
    pub fn new(credentials: CredentialSet) -> Self {
        Self {
            credentials: Arc::new(credentials),
            verdicts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Check the `Proxy-Authorization` header of a request
    pub fn check_request<B>(&self, req: &Request<B>) -> AuthVerdict {
        self.check(req.headers().get(PROXY_AUTHORIZATION))
    }

    /// Check a raw header value
    pub fn check(&self, header: Option<&HeaderValue>) -> AuthVerdict {
        self.verdicts.fetch_add(1, Ordering::Relaxed);

        let verdict = self.evaluate(header);
        if let AuthVerdict::Rejected(reason) = verdict {
            debug!(reason = %reason, "Proxy authentication rejected");
        }
        verdict
    }

    fn evaluate(&self, header: Option<&HeaderValue>) -> AuthVerdict {
        let Some(header) = header else {
            return AuthVerdict::Rejected(RejectReason::Malformed);
        };

        let mut parts = header
            .as_bytes()
            .split(|b| b.is_ascii_whitespace())
            .filter(|part| !part.is_empty());

        let (scheme, token) = match (parts.next(), parts.next(), parts.next()) {
            (Some(scheme), Some(token), None) => (scheme, token),
            _ => return AuthVerdict::Rejected(RejectReason::Malformed),
        };

        if !scheme.eq_ignore_ascii_case(b"basic") {
            return AuthVerdict::Rejected(RejectReason::UnsupportedScheme);
        }

        if self.credentials.contains(token) {
            AuthVerdict::Authenticated
        } else {
            AuthVerdict::Rejected(RejectReason::InvalidCredentials)
        }
    }

    /// Number of verdicts computed since startup
    pub fn verdicts(&self) -> u64 {
        self.verdicts.load(Ordering::Relaxed)
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Only the length is allowed to leak.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    std::hint::black_box(acc) == 0
}
