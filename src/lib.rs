//! YakYak Auth - authentication module of a SIP proxy
//!
//! Decides whether the sender of each inbound SIP request is authenticated:
//! trusted peers, TLS client certificates and digest challenge/response
//! against per-realm credential stores.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{AuthOutcome, AuthenticationEngine};
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
