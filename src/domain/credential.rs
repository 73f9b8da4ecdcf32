//! Credential backend port
//!
//! The authentication engine only needs two things from a password store:
//! look up the secret of `user@domain` usable with a digest algorithm, and
//! (for automated test setups) create a temporary account. A lookup either
//! answers immediately or hands back a channel that will carry the answer.
//!
//! A lookup also names the From user of the request. The secret is only
//! returned when the account found for the digest username is the one the
//! request claims to come from, by user name or by phone alias.

use super::shared::Result;
use crate::infrastructure::protocols::sip::digest::DigestAlgorithm;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::oneshot;

/// Secret material usable to check a digest response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialMaterial {
    /// Clear-text password, usable with any algorithm
    ClearText(String),
    /// Precomputed HA1 = H(user:realm:password) for one algorithm
    Ha1 {
        algorithm: DigestAlgorithm,
        hash: String,
    },
}

impl CredentialMaterial {
    /// HA1 for `user@realm` with `algorithm`, if this material can produce it.
    pub fn ha1(&self, user: &str, realm: &str, algorithm: DigestAlgorithm) -> Option<String> {
        match self {
            CredentialMaterial::ClearText(password) => {
                Some(algorithm.ha1(user, realm, password))
            }
            CredentialMaterial::Ha1 {
                algorithm: stored,
                hash,
            } if *stored == algorithm => Some(hash.to_lowercase()),
            CredentialMaterial::Ha1 { .. } => None,
        }
    }
}

/// Outcome of one password lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordLookup {
    Found(CredentialMaterial),
    NotFound,
    /// The store could not answer; treated as not found, reported separately
    BackendError(String),
}

impl PasswordLookup {
    pub fn is_found(&self) -> bool {
        matches!(self, PasswordLookup::Found(_))
    }
}

/// A lookup as returned by a backend
#[derive(Debug)]
pub enum CredentialLookup {
    /// Answer available right away
    Ready(PasswordLookup),
    /// Answer delivered later on the channel
    Pending(oneshot::Receiver<PasswordLookup>),
}

impl CredentialLookup {
    /// Create a pending lookup and the sender that completes it.
    pub fn pending() -> (oneshot::Sender<PasswordLookup>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, CredentialLookup::Pending(rx))
    }
}

/// Temporary account created through the test-account shortcut
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestAccount {
    pub user: String,
    pub domain: String,
    pub login: String,
    pub password: String,
    /// Lifetime in seconds
    pub expires: u32,
    pub phone_alias: String,
}

impl TestAccount {
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(i64::from(self.expires))
    }
}

/// Password store used by digest authentication
#[cfg_attr(test, mockall::automock)]
pub trait CredentialBackend: Send + Sync {
    /// Look up the secret of `user@domain` for `algorithm`. Answers
    /// `NotFound` unless that account is also `from_user`.
    fn lookup(&self, user: &str, from_user: &str, domain: &str, algorithm: DigestAlgorithm) -> CredentialLookup;

    /// Create a temporary account.
    fn create_account(&self, account: &TestAccount) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_text_produces_ha1_for_any_algorithm() {
        let material = CredentialMaterial::ClearText("secret".to_string());
        let md5 = material.ha1("alice", "example.com", DigestAlgorithm::Md5).unwrap();
        let sha = material.ha1("alice", "example.com", DigestAlgorithm::Sha256).unwrap();
        assert_eq!(md5.len(), 32);
        assert_eq!(sha.len(), 64);
    }

    #[test]
    fn test_stored_ha1_only_for_its_algorithm() {
        let material = CredentialMaterial::Ha1 {
            algorithm: DigestAlgorithm::Md5,
            hash: "97FFB1C6AF18E5687BF26CDF35E45D30".to_string(),
        };
        assert_eq!(
            material.ha1("bellesip", "sip.linphone.org", DigestAlgorithm::Md5),
            Some("97ffb1c6af18e5687bf26cdf35e45d30".to_string())
        );
        assert_eq!(
            material.ha1("bellesip", "sip.linphone.org", DigestAlgorithm::Sha256),
            None
        );
    }

    #[tokio::test]
    async fn test_pending_lookup_delivers_answer() {
        let (tx, lookup) = CredentialLookup::pending();
        tx.send(PasswordLookup::NotFound).unwrap();
        match lookup {
            CredentialLookup::Pending(rx) => assert_eq!(rx.await.unwrap(), PasswordLookup::NotFound),
            CredentialLookup::Ready(_) => panic!("expected a pending lookup"),
        }
    }
}
