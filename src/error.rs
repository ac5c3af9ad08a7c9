use std::fmt;

use hyper::Version;
use thiserror::Error;

/// Unified error type for ShadowProxy
///
/// Any of these returned from the request service makes hyper drop the
/// HTTP/1 connection or reset the HTTP/2 stream without writing a response.
#[derive(Error, Debug)]
pub enum ProxyError {
    // Protocol boundary faults
    #[error("HTTP version not supported: {0:?}")]
    UnsupportedVersion(Version),

    #[error("CONNECT request has :scheme or/and :path pseudo-header fields")]
    ConnectPseudoHeaders,

    #[error("CONNECT request has no target")]
    MissingTarget,

    #[error("Invalid target address: {0}")]
    InvalidTarget(String),

    // Transport faults
    #[error("Remote connect to {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote connect to {0} timed out")]
    DialTimeout(String),

    #[error("Hostname {0} is not allowed")]
    TargetNotAllowed(String),

    #[error("Hijacking not supported")]
    HijackUnavailable,

    #[error("Upgrade failed: {0}")]
    Upgrade(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal faults
    #[error("Panic in {stage}: {message}")]
    Panic { stage: &'static str, message: String },

    // Startup errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Result type alias for ShadowProxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Coarse fault classes used when logging aborted requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCategory {
    Protocol,
    Transport,
    Internal,
    Startup,
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultCategory::Protocol => "protocol",
            FaultCategory::Transport => "transport",
            FaultCategory::Internal => "internal",
            FaultCategory::Startup => "startup",
        };
        f.write_str(name)
    }
}

impl ProxyError {
    /// Classify this error for logging
    pub fn category(&self) -> FaultCategory {
        match self {
            ProxyError::UnsupportedVersion(_)
            | ProxyError::ConnectPseudoHeaders
            | ProxyError::MissingTarget
            | ProxyError::InvalidTarget(_) => FaultCategory::Protocol,

            ProxyError::Dial { .. }
            | ProxyError::DialTimeout(_)
            | ProxyError::TargetNotAllowed(_)
            | ProxyError::HijackUnavailable
            | ProxyError::Upgrade(_)
            | ProxyError::Http(_)
            | ProxyError::Io(_) => FaultCategory::Transport,

            ProxyError::Panic { .. } => FaultCategory::Internal,

            ProxyError::InvalidConfig(_) | ProxyError::Tls(_) => FaultCategory::Startup,
        }
    }
}

// Convert from hyper errors
impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

impl From<http::Error> for ProxyError {
    fn from(err: http::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_mapping() {
        assert_eq!(
            ProxyError::UnsupportedVersion(Version::HTTP_3).category(),
            FaultCategory::Protocol
        );
        assert_eq!(
            ProxyError::ConnectPseudoHeaders.category(),
            FaultCategory::Protocol
        );
        assert_eq!(
            ProxyError::TargetNotAllowed("example.com".to_string()).category(),
            FaultCategory::Transport
        );
        assert_eq!(
            ProxyError::HijackUnavailable.category(),
            FaultCategory::Transport
        );
        assert_eq!(
            ProxyError::Panic {
                stage: "request",
                message: "boom".to_string()
            }
            .category(),
            FaultCategory::Internal
        );
        assert_eq!(
            ProxyError::InvalidConfig("bad".to_string()).category(),
            FaultCategory::Startup
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ProxyError::HijackUnavailable.to_string(),
            "Hijacking not supported"
        );
        assert_eq!(
            ProxyError::TargetNotAllowed("blocked.example".to_string()).to_string(),
            "Hostname blocked.example is not allowed"
        );
        assert_eq!(FaultCategory::Transport.to_string(), "transport");
    }
}
