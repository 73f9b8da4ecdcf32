//! Request and response events flowing through the module chain
//!
//! An event owns the message being processed together with everything its
//! processing needs: transport facts, the transaction it belongs to, and a
//! shareable lifecycle handle. The pipeline keeps a clone of the handle so
//! it can terminate a request (client gone, transaction timeout) while a
//! module is suspended on it.

use super::message::{SipRequest, SipResponse};
use super::transaction::{Transaction, TransactionLayer};
use crate::domain::certificate::PeerCertificate;
use crate::domain::shared::EventId;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Processing state of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Active,
    /// Waiting for an asynchronous result; the pipeline must not advance it
    Suspended,
    /// Answered or dropped; absorbing
    Terminated,
}

#[derive(Debug)]
struct LifecycleInner {
    state: ProcessingState,
    current_module: Option<&'static str>,
}

/// Shareable lifecycle handle of a request
#[derive(Debug, Clone)]
pub struct Lifecycle {
    inner: Arc<Mutex<LifecycleInner>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LifecycleInner {
                state: ProcessingState::Active,
                current_module: None,
            })),
        }
    }

    pub fn state(&self) -> ProcessingState {
        self.inner.lock().state
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ProcessingState::Terminated
    }

    /// Module holding the request while it is suspended
    pub fn current_module(&self) -> Option<&'static str> {
        self.inner.lock().current_module
    }

    /// Hand the request to an asynchronous waiter.
    pub fn suspend(&self, module: &'static str) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(
            inner.state,
            ProcessingState::Active,
            "suspending a request that is not active"
        );
        inner.state = ProcessingState::Suspended;
        inner.current_module = Some(module);
    }

    /// Take the request back after suspension. Returns false when it was
    /// terminated meanwhile; the caller must then drop whatever it resumed with.
    pub fn resume(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            ProcessingState::Terminated => false,
            state => {
                debug_assert_eq!(
                    state,
                    ProcessingState::Suspended,
                    "resuming a request that is not suspended"
                );
                inner.state = ProcessingState::Active;
                inner.current_module = None;
                true
            }
        }
    }

    pub fn terminate(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ProcessingState::Terminated {
            debug!(
                "Request terminated while {:?} (module: {:?})",
                inner.state, inner.current_module
            );
        }
        inner.state = ProcessingState::Terminated;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Facts about the connection a request arrived on
#[derive(Debug, Clone, Default)]
pub struct TransportInfo {
    /// Accepted by one of our listeners
    pub is_server: bool,
    /// The listener demands a client certificate
    pub requires_peer_certificate: bool,
    /// The client certificate chain was verified by the TLS layer
    pub peer_verified: bool,
    pub peer_certificate: Option<PeerCertificate>,
}

impl TransportInfo {
    /// Plain UDP/TCP server connection
    pub fn plain() -> Self {
        Self {
            is_server: true,
            ..Default::default()
        }
    }

    /// TLS server connection requiring client certificates
    pub fn tls_client_auth(certificate: PeerCertificate, verified: bool) -> Self {
        Self {
            is_server: true,
            requires_peer_certificate: true,
            peer_verified: verified,
            peer_certificate: Some(certificate),
        }
    }
}

/// An inbound request being processed
#[derive(Debug)]
pub struct RequestEvent {
    id: EventId,
    request: SipRequest,
    transport: TransportInfo,
    lifecycle: Lifecycle,
    transaction: Option<Arc<Transaction>>,
    reply: Option<SipResponse>,
}

impl RequestEvent {
    pub fn new(request: SipRequest, transport: TransportInfo) -> Self {
        Self {
            id: EventId::new(),
            request,
            transport,
            lifecycle: Lifecycle::new(),
            transaction: None,
            reply: None,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn request(&self) -> &SipRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut SipRequest {
        &mut self.request
    }

    pub fn transport(&self) -> &TransportInfo {
        &self.transport
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn state(&self) -> ProcessingState {
        self.lifecycle.state()
    }

    pub fn is_terminated(&self) -> bool {
        self.lifecycle.is_terminated()
    }

    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref()
    }

    /// Attach the server transaction, creating it when needed.
    pub async fn create_incoming_transaction(&mut self, layer: &TransactionLayer) -> Arc<Transaction> {
        if let Some(txn) = &self.transaction {
            return Arc::clone(txn);
        }
        let txn = layer.get_or_create(&self.request).await;
        self.transaction = Some(Arc::clone(&txn));
        txn
    }

    /// Answer the request. The event is terminated; the pipeline sends
    /// the stored response.
    pub fn reply(&mut self, response: SipResponse) {
        debug_assert!(!self.is_terminated(), "replying to a terminated request");
        debug!(
            "Replying {} to {} {}",
            response.status_code(),
            self.request.method_name(),
            self.id
        );
        self.reply = Some(response);
        self.lifecycle.terminate();
    }

    /// Response produced by a module, if any
    pub fn reply_response(&self) -> Option<&SipResponse> {
        self.reply.as_ref()
    }

    pub fn take_reply(&mut self) -> Option<SipResponse> {
        self.reply.take()
    }
}

/// A response relayed back through the module chain
#[derive(Debug)]
pub struct ResponseEvent {
    response: SipResponse,
    transaction: Option<Arc<Transaction>>,
}

impl ResponseEvent {
    pub fn new(response: SipResponse, transaction: Option<Arc<Transaction>>) -> Self {
        Self {
            response,
            transaction,
        }
    }

    pub fn response(&self) -> &SipResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut SipResponse {
        &mut self.response
    }

    pub fn into_response(self) -> SipResponse {
        self.response
    }

    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspend_resume_cycle() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), ProcessingState::Active);

        lifecycle.suspend("authentication");
        assert_eq!(lifecycle.state(), ProcessingState::Suspended);
        assert_eq!(lifecycle.current_module(), Some("authentication"));

        assert!(lifecycle.resume());
        assert_eq!(lifecycle.state(), ProcessingState::Active);
        assert_eq!(lifecycle.current_module(), None);
    }

    #[test]
    fn test_terminated_while_suspended() {
        let lifecycle = Lifecycle::new();
        let pipeline_handle = lifecycle.clone();

        lifecycle.suspend("authentication");
        pipeline_handle.terminate();

        assert!(!lifecycle.resume());
        assert!(lifecycle.is_terminated());
    }

    #[test]
    fn test_terminated_is_absorbing() {
        let lifecycle = Lifecycle::new();
        lifecycle.terminate();
        lifecycle.terminate();
        assert!(!lifecycle.resume());
        assert_eq!(lifecycle.state(), ProcessingState::Terminated);
    }

    #[test]
    #[should_panic(expected = "not active")]
    #[cfg(debug_assertions)]
    fn test_double_suspend_is_a_contract_violation() {
        let lifecycle = Lifecycle::new();
        lifecycle.suspend("a");
        lifecycle.suspend("b");
    }

    #[test]
    fn test_reply_terminates_event() {
        use super::super::builder::ResponseBuilder;

        let request = SipRequest::parse(
            b"OPTIONS sip:example.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKev\r\n\
              From: <sip:alice@example.com>;tag=1\r\n\
              To: <sip:example.com>\r\n\
              Call-ID: event-test\r\n\
              CSeq: 1 OPTIONS\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap();
        let mut event = RequestEvent::new(request, TransportInfo::plain());
        let response = ResponseBuilder::ok().build_for_request(event.request()).unwrap();

        event.reply(response);
        assert!(event.is_terminated());
        assert_eq!(event.reply_response().map(|r| r.status_code()), Some(200));
    }
}
