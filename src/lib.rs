//! ShadowProxy - probe-resistant TLS forward proxy
//!
//! Authenticated clients get HTTP CONNECT tunnels over HTTP/1.1 or HTTP/2.
//! Everyone else is relayed to a decoy web server, so the listener looks
//! like an ordinary HTTPS site to active probes.
//!
//! ## Features
//!
//! - Basic proxy authentication with constant-time credential checks
//! - Raw-transport tunnels on HTTP/1.1, stream tunnels on HTTP/2
//! - Optional hidden status page on a dedicated domain
//! - Bounded buffer pool shared by every copy loop

pub mod config;
pub mod error;
pub mod proxy;
pub mod tls;

pub use config::Config;
pub use error::{ProxyError, Result};
