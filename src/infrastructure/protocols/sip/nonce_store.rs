//! Digest nonce cache
//!
//! Every challenge issued by a realm records its nonce here. Lookups only
//! check presence: an expired nonce keeps validating until the idle sweep
//! removes it, so staleness is bounded by the sweep period.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Default nonce lifetime in seconds
pub const DEFAULT_NONCE_EXPIRE_SECS: i64 = 1800;

#[derive(Debug, Clone)]
struct NonceEntry {
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    /// Highest nonce-count accepted so far (qop=auth)
    last_nc: u32,
}

/// Result of a nonce-count check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceCount {
    Accepted,
    Replayed { last: u32 },
    UnknownNonce,
}

/// Per-realm store of issued nonces
pub struct NonceStore {
    entries: Mutex<HashMap<String, NonceEntry>>,
    lifetime: Duration,
}

impl NonceStore {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lifetime,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Record a freshly issued nonce.
    pub fn insert(&self, nonce: &str) {
        self.insert_at(nonce, Utc::now());
    }

    pub fn insert_at(&self, nonce: &str, now: DateTime<Utc>) {
        let entry = NonceEntry {
            issued_at: now,
            expires_at: now.checked_add_signed(self.lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC),
            last_nc: 0,
        };
        self.entries.lock().insert(nonce.to_string(), entry);
    }

    /// Whether `nonce` was issued by this realm and not swept yet
    pub fn contains(&self, nonce: &str) -> bool {
        self.entries.lock().contains_key(nonce)
    }

    /// When `nonce` was issued
    pub fn issued_at(&self, nonce: &str) -> Option<DateTime<Utc>> {
        self.entries.lock().get(nonce).map(|e| e.issued_at)
    }

    /// Accept `nc` for `nonce` if it is higher than every count seen before.
    pub fn check_nonce_count(&self, nonce: &str, nc: u32) -> NonceCount {
        let mut entries = self.entries.lock();
        match entries.get_mut(nonce) {
            None => NonceCount::UnknownNonce,
            Some(entry) if nc <= entry.last_nc => NonceCount::Replayed {
                last: entry.last_nc,
            },
            Some(entry) => {
                entry.last_nc = nc;
                NonceCount::Accepted
            }
        }
    }

    /// Remove every nonce whose expiry has been reached.
    pub fn clean_expired(&self) -> usize {
        self.clean_expired_at(Utc::now())
    }

    pub fn clean_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Cleaned {} expired nonces, {} left", removed, entries.len());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for NonceStore {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_NONCE_EXPIRE_SECS))
    }
}
