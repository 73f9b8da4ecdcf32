//! Domain layer - Core authentication rules
//!
//! This layer contains:
//! - Value Objects: normalized addresses, SIP URIs, event ids
//! - Domain Services: certificate identity matching, trusted peers
//! - Repository Interfaces: the credential backend port

pub mod binary_ip;
pub mod certificate;
pub mod credential;
pub mod shared;
pub mod trusted_peers;

// Re-export commonly used types
pub use shared::{DomainError, Result};
