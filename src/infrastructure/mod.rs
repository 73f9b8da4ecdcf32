//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Credential backends (password file, memory, PostgreSQL)
//! - SIP protocol plumbing used by the authentication module
//! - Metrics

pub mod metrics;
pub mod persistence;
pub mod protocols;
