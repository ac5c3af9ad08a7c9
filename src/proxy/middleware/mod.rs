//! Proxy middleware for authentication

mod auth;

pub use auth::{AuthGate, AuthVerdict, CredentialSet, RejectReason};
