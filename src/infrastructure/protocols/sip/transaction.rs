//! SIP server transactions as seen by the proxy modules
//!
//! A transaction groups a request, its retransmissions and the responses
//! relayed back for it (RFC 3261 section 17). Modules use it to carry
//! context from the request path to the response path through a small
//! write-once property map.

use super::message::{SipMethod, SipRequest};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Transaction ID - uniquely identifies a server transaction
/// Built from the top Via branch, its sent-by and the method, the fields
/// RFC 3261 section 17.2.3 matches requests on
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn new(branch: &str, sent_by: &str, method: &str) -> Self {
        Self(format!("{};{};{}", branch, sent_by.to_lowercase(), method))
    }

    /// Generate a new transaction ID
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let random: u64 = rng.gen();
        Self(format!("z9hG4bK{:x}", random))
    }

    /// Transaction ID of a request. Requests without a branch get a
    /// transaction of their own.
    pub fn for_request(request: &SipRequest) -> Self {
        let via = match request.top_via() {
            Some(via) => via,
            None => return Self::generate(),
        };
        let branch = match via.branch.as_deref() {
            Some(branch) => branch,
            None => return Self::generate(),
        };
        let sent_by = match via.port {
            Some(port) => format!("{}:{}", via.host, port),
            None => via.host.clone(),
        };
        // An ACK belongs to the INVITE transaction it acknowledges
        let method = match request.method() {
            Some(SipMethod::Ack) => SipMethod::Invite.as_str().to_string(),
            _ => request.method_name(),
        };
        Self::new(branch, &sent_by, &method)
    }
}

type Property = Arc<dyn Any + Send + Sync>;

/// One request/response exchange
pub struct Transaction {
    id: TransactionId,
    method: String,
    created_at: DateTime<Utc>,
    properties: Mutex<HashMap<String, Property>>,
}

impl Transaction {
    pub fn new(id: TransactionId, method: impl Into<String>) -> Self {
        Self {
            id,
            method: method.into(),
            created_at: Utc::now(),
            properties: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Attach a value under `key`. A key is written at most once; returns
    /// false and keeps the existing value when it is already set.
    pub fn set_property<T>(&self, key: &str, value: T) -> bool
    where
        T: Any + Send + Sync,
    {
        let mut properties = self.properties.lock();
        if properties.contains_key(key) {
            return false;
        }
        properties.insert(key.to_string(), Arc::new(value));
        true
    }

    /// Value under `key`, if set with type `T`
    pub fn property<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = self.properties.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.lock().contains_key(key)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("created_at", &self.created_at)
            .field("properties", &self.properties.lock().len())
            .finish()
    }
}

/// Server transactions indexed by ID
#[derive(Default)]
pub struct TransactionLayer {
    transactions: Arc<RwLock<HashMap<TransactionId, Arc<Transaction>>>>,
}

impl TransactionLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transaction of `request`, created on first sight
    pub async fn get_or_create(&self, request: &SipRequest) -> Arc<Transaction> {
        let id = TransactionId::for_request(request);

        if let Some(txn) = self.transactions.read().await.get(&id) {
            return Arc::clone(txn);
        }

        let mut txns = self.transactions.write().await;
        let txn = txns
            .entry(id.clone())
            .or_insert_with(|| {
                debug!("Created server transaction {}", id.0);
                Arc::new(Transaction::new(id, request.method_name()))
            });
        Arc::clone(txn)
    }

    /// Get a transaction by ID
    pub async fn get_transaction(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        let txns = self.transactions.read().await;
        txns.get(id).cloned()
    }

    /// Check if a transaction exists
    pub async fn has_transaction(&self, id: &TransactionId) -> bool {
        let txns = self.transactions.read().await;
        txns.contains_key(id)
    }

    /// Get count of active transactions
    pub async fn transaction_count(&self) -> usize {
        let txns = self.transactions.read().await;
        txns.len()
    }

    /// Forget a completed transaction
    pub async fn remove(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        self.transactions.write().await.remove(id)
    }

    /// Drop transactions created before `cutoff`
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut txns = self.transactions.write().await;
        let before = txns.len();
        txns.retain(|_, txn| txn.created_at() >= cutoff);

        let removed = before - txns.len();
        if removed > 0 {
            info!("Cleaned up {} expired transactions", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(branch: &str) -> SipRequest {
        request_from("OPTIONS", "10.0.0.1:5060", branch)
    }

    fn request_from(method: &str, sent_by: &str, branch: &str) -> SipRequest {
        let raw = format!(
            "{method} sip:example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP {sent_by};branch={branch}\r\n\
             From: <sip:alice@example.com>;tag=1\r\n\
             To: <sip:example.com>\r\n\
             Call-ID: txn-test\r\n\
             CSeq: 1 {method}\r\n\
             Content-Length: 0\r\n\r\n"
        );
        SipRequest::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_transaction_id() {
        let id1 = TransactionId::new("z9hG4bK776asdhds", "10.0.0.1:5060", "INVITE");
        let id2 = TransactionId::new("z9hG4bK776asdhds", "10.0.0.1:5060", "INVITE");
        assert_eq!(id1, id2);

        let id3 = TransactionId::generate();
        assert!(id3.0.starts_with("z9hG4bK"));

        assert_eq!(
            TransactionId::for_request(&request("z9hG4bKabc")),
            TransactionId::new("z9hG4bKabc", "10.0.0.1:5060", "OPTIONS")
        );
    }

    #[test]
    fn test_transaction_id_matches_sent_by_and_method() {
        let invite = TransactionId::for_request(&request_from("INVITE", "192.0.2.1:5060", "z9hG4bKr"));

        let other_host = TransactionId::for_request(&request_from("INVITE", "203.0.113.66:5060", "z9hG4bKr"));
        let other_method = TransactionId::for_request(&request_from("BYE", "192.0.2.1:5060", "z9hG4bKr"));
        let ack = TransactionId::for_request(&request_from("ACK", "192.0.2.1:5060", "z9hG4bKr"));

        assert_ne!(invite, other_host);
        assert_ne!(invite, other_method);
        assert_eq!(invite, ack);
    }

    #[test]
    fn test_properties_are_write_once() {
        let txn = Transaction::new(TransactionId::generate(), "INVITE");
        assert!(txn.set_property("realm", "example.com".to_string()));
        assert!(!txn.set_property("realm", "other.org".to_string()));

        let realm = txn.property::<String>("realm").unwrap();
        assert_eq!(realm.as_str(), "example.com");
        assert!(txn.property::<u32>("realm").is_none());
        assert!(txn.property::<String>("missing").is_none());
    }

    #[tokio::test]
    async fn test_retransmission_reuses_transaction() {
        let layer = TransactionLayer::new();
        let first = layer.get_or_create(&request("z9hG4bKretx")).await;
        let again = layer.get_or_create(&request("z9hG4bKretx")).await;
        let other = layer.get_or_create(&request("z9hG4bKother")).await;

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(layer.transaction_count().await, 2);
        assert_eq!(first.method(), "OPTIONS");

        assert!(layer.remove(first.id()).await.is_some());
        assert!(!layer.has_transaction(first.id()).await);
    }

    #[tokio::test]
    async fn test_cleanup_older_than() {
        let layer = TransactionLayer::new();
        layer.get_or_create(&request("z9hG4bKold")).await;
        let removed = layer
            .cleanup_older_than(Utc::now() + chrono::Duration::seconds(1))
            .await;
        assert_eq!(removed, 1);
        assert_eq!(layer.transaction_count().await, 0);
    }
}
