//! Proxy server implementation
//!
//! This module provides the proxy server functionality including:
//! - Proxy authentication and the probe-resist pages
//! - CONNECT tunnels over HTTP/1.1 and HTTP/2
//! - Decoy relaying for everything that is not a tunnel
//! - Pooled copy buffers shared by every session

pub mod body;
pub mod decoy;
pub mod handler;
pub mod headers;
pub mod middleware;
pub mod pages;
pub mod pool;
pub mod server;
pub mod stream;
pub mod transport;
pub mod tunnel;


pub use decoy::DecoyForwarder;
pub use handler::Dispatcher;
pub use middleware::{AuthGate, AuthVerdict, CredentialSet, RejectReason};
pub use pool::{BufferLease, BufferPool, BufferPoolStats};
pub use server::{ConnectionMode, ProxyServer};
pub use stream::StreamCopier;
pub use transport::{Dialer, ProxyConnection, TcpDialer};
pub use tunnel::{TransportMode, TunnelEstablisher};
