//! SIP protocol plumbing for the authentication module
//!
//! Message wrappers over `rsip`, digest primitives, per-realm nonce state,
//! server transactions and the request/response events the module chain
//! passes around.

pub mod auth_module;
pub mod builder;
pub mod digest;
pub mod event;
pub mod handler;
pub mod message;
pub mod nonce_store;
pub mod transaction;
pub mod via;

pub use auth_module::{AuthModule, DigestVerdict, RealmSettings};
pub use builder::ResponseBuilder;
pub use digest::{AuthChallenge, AuthorizationHeader, DigestAlgorithm};
pub use event::{Lifecycle, ProcessingState, RequestEvent, ResponseEvent, TransportInfo};
pub use handler::{ModuleAction, SipModule};
pub use message::{SipError, SipMethod, SipRequest, SipResponse};
pub use nonce_store::NonceStore;
pub use transaction::{Transaction, TransactionId, TransactionLayer};
pub use via::ViaHeader;
