//! Application layer - Use cases and application services
//!
//! The authentication engine orchestrates the domain rules and the
//! protocol plumbing to decide on every inbound request.

pub mod authentication;

pub use authentication::{AuthMethod, AuthOutcome, AuthSettings, AuthenticationEngine};
