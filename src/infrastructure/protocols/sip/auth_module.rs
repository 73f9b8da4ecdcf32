//! Per-realm digest authentication state
//!
//! One `AuthModule` exists per realm (SIP domain). It issues challenges,
//! remembers the nonces it handed out and checks digest responses once the
//! credential material is known.

use super::digest::{generate_nonce, AuthChallenge, AuthorizationHeader, DigestAlgorithm};
use super::nonce_store::{NonceCount, NonceStore};
use crate::domain::credential::CredentialMaterial;
use chrono::Duration;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Invoked with the found / not-found outcome of each credential lookup
pub type PasswordFetchCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Settings a realm is created with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmSettings {
    /// Accepted algorithms; the first one is used for single challenges
    pub algorithms: Vec<DigestAlgorithm>,
    /// Offer qop=auth in challenges
    pub qop_auth: bool,
    pub nonce_expire: Duration,
}

impl Default for RealmSettings {
    fn default() -> Self {
        Self {
            algorithms: vec![DigestAlgorithm::Md5],
            qop_auth: true,
            nonce_expire: Duration::seconds(super::nonce_store::DEFAULT_NONCE_EXPIRE_SECS),
        }
    }
}

/// Result of checking a digest response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestVerdict {
    Valid,
    /// No usable credential for this user and algorithm
    NoCredential,
    /// The response does not match the expected digest
    WrongResponse,
    /// The nonce-count did not increase
    Replayed,
    /// The nonce is unknown to this realm
    StaleNonce,
}

pub struct AuthModule {
    realm: String,
    settings: RealmSettings,
    nonce_store: NonceStore,
    on_password_fetch: PasswordFetchCallback,
}

impl AuthModule {
    pub fn new(realm: impl Into<String>, settings: RealmSettings, on_password_fetch: PasswordFetchCallback) -> Self {
        let nonce_store = NonceStore::new(settings.nonce_expire);
        Self {
            realm: realm.into(),
            settings,
            nonce_store,
            on_password_fetch,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn algorithms(&self) -> &[DigestAlgorithm] {
        &self.settings.algorithms
    }

    pub fn default_algorithm(&self) -> DigestAlgorithm {
        self.settings
            .algorithms
            .first()
            .copied()
            .unwrap_or(DigestAlgorithm::Md5)
    }

    pub fn supports(&self, algorithm: DigestAlgorithm) -> bool {
        self.settings.algorithms.contains(&algorithm)
    }

    pub fn nonce_store(&self) -> &NonceStore {
        &self.nonce_store
    }

    /// One challenge per accepted algorithm, all sharing a freshly stored nonce
    pub fn challenges(&self, stale: bool) -> Vec<AuthChallenge> {
        let nonce = self.issue_nonce();
        self.settings
            .algorithms
            .iter()
            .map(|algorithm| self.make_challenge(&nonce, *algorithm, stale))
            .collect()
    }

    /// Single challenge with the default algorithm
    pub fn challenge(&self) -> AuthChallenge {
        let nonce = self.issue_nonce();
        self.make_challenge(&nonce, self.default_algorithm(), false)
    }

    fn issue_nonce(&self) -> String {
        let nonce = generate_nonce();
        self.nonce_store.insert(&nonce);
        debug!("Issued nonce for realm {}", self.realm);
        nonce
    }

    fn make_challenge(&self, nonce: &str, algorithm: DigestAlgorithm, stale: bool) -> AuthChallenge {
        AuthChallenge {
            realm: self.realm.clone(),
            nonce: nonce.to_string(),
            algorithm,
            qop: self.settings.qop_auth.then(|| "auth".to_string()),
            stale,
        }
    }

    /// Credentials addressed to this realm
    pub fn select_credentials<'a>(&self, credentials: &'a [AuthorizationHeader]) -> Option<&'a AuthorizationHeader> {
        credentials.iter().find(|c| c.realm == self.realm)
    }

    /// Report the outcome of a credential lookup.
    pub fn password_fetched(&self, found: bool) {
        (self.on_password_fetch)(found);
    }

    /// Check `credentials` against the stored nonce and `material`.
    ///
    /// `skip_nonce_count` is set when the same request was already
    /// accepted once in this transaction (retransmission).
    pub fn verify(
        &self,
        credentials: &AuthorizationHeader,
        method: &str,
        material: Option<&CredentialMaterial>,
        skip_nonce_count: bool,
    ) -> DigestVerdict {
        if !self.nonce_store.contains(&credentials.nonce) {
            return DigestVerdict::StaleNonce;
        }

        let algorithm = match credentials.digest_algorithm() {
            Ok(algorithm) if self.supports(algorithm) => algorithm,
            _ => return DigestVerdict::NoCredential,
        };

        let ha1 = match material.and_then(|m| m.ha1(&credentials.username, &self.realm, algorithm)) {
            Some(ha1) => ha1,
            None => return DigestVerdict::NoCredential,
        };

        let qop = credentials.qop_params();
        let expected = algorithm.response(&ha1, &credentials.nonce, method, &credentials.uri, qop.as_ref());
        if !expected.eq_ignore_ascii_case(&credentials.response) {
            debug!("Digest response mismatch for {}@{}", credentials.username, self.realm);
            return DigestVerdict::WrongResponse;
        }

        if qop.is_some() && !skip_nonce_count {
            let nc = credentials.nonce_count().unwrap_or(0);
            match self.nonce_store.check_nonce_count(&credentials.nonce, nc) {
                NonceCount::Accepted => {}
                NonceCount::Replayed { last } => {
                    warn!(
                        "Replayed nonce-count {} (last {}) for {}@{}",
                        nc, last, credentials.username, self.realm
                    );
                    return DigestVerdict::Replayed;
                }
                NonceCount::UnknownNonce => return DigestVerdict::StaleNonce,
            }
        }

        DigestVerdict::Valid
    }
}

impl fmt::Debug for AuthModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthModule")
            .field("realm", &self.realm)
            .field("settings", &self.settings)
            .field("nonces", &self.nonce_store.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn module(algorithms: Vec<DigestAlgorithm>) -> AuthModule {
        AuthModule::new(
            "example.com",
            RealmSettings {
                algorithms,
                ..Default::default()
            },
            Arc::new(|_| {}),
        )
    }

    fn answer(challenge: &AuthChallenge, password: &str, nc: &str) -> AuthorizationHeader {
        let algorithm = challenge.algorithm;
        let ha1 = algorithm.ha1("alice", &challenge.realm, password);
        let uri = "sip:example.com";
        let qop = super::super::digest::QopParams {
            qop: "auth",
            nc,
            cnonce: "0a4f113b",
        };
        AuthorizationHeader {
            username: "alice".to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response: algorithm.response(&ha1, &challenge.nonce, "REGISTER", uri, Some(&qop)),
            algorithm: Some(algorithm.to_string()),
            qop: Some("auth".to_string()),
            nc: Some(nc.to_string()),
            cnonce: Some("0a4f113b".to_string()),
        }
    }

    fn secret() -> CredentialMaterial {
        CredentialMaterial::ClearText("secret".to_string())
    }

    #[test]
    fn test_challenges_share_one_nonce() {
        let module = module(vec![DigestAlgorithm::Sha256, DigestAlgorithm::Md5]);
        let challenges = module.challenges(false);

        assert_eq!(challenges.len(), 2);
        assert_eq!(challenges[0].algorithm, DigestAlgorithm::Sha256);
        assert_eq!(challenges[0].nonce, challenges[1].nonce);
        assert_eq!(challenges[0].qop.as_deref(), Some("auth"));
        assert!(module.nonce_store().contains(&challenges[0].nonce));
        assert_eq!(module.nonce_store().len(), 1);
        assert_eq!(module.challenge().algorithm, DigestAlgorithm::Sha256);
    }

    #[test]
    fn test_valid_response() {
        let module = module(vec![DigestAlgorithm::Md5]);
        let challenge = module.challenge();
        let credentials = answer(&challenge, "secret", "00000001");

        assert_eq!(
            module.verify(&credentials, "REGISTER", Some(&secret()), false),
            DigestVerdict::Valid
        );
    }

    #[test]
    fn test_wrong_password_and_missing_credential() {
        let module = module(vec![DigestAlgorithm::Md5]);
        let challenge = module.challenge();
        let credentials = answer(&challenge, "guess", "00000001");

        assert_eq!(
            module.verify(&credentials, "REGISTER", Some(&secret()), false),
            DigestVerdict::WrongResponse
        );
        assert_eq!(
            module.verify(&credentials, "REGISTER", None, false),
            DigestVerdict::NoCredential
        );
    }

    #[test]
    fn test_unknown_nonce_is_stale() {
        let module = module(vec![DigestAlgorithm::Md5]);
        let mut challenge = module.challenge();
        challenge.nonce = "forged".to_string();
        let credentials = answer(&challenge, "secret", "00000001");

        assert_eq!(
            module.verify(&credentials, "REGISTER", Some(&secret()), false),
            DigestVerdict::StaleNonce
        );
    }

    #[test]
    fn test_replayed_nonce_count() {
        let module = module(vec![DigestAlgorithm::Md5]);
        let challenge = module.challenge();
        let credentials = answer(&challenge, "secret", "00000001");

        assert_eq!(module.verify(&credentials, "REGISTER", Some(&secret()), false), DigestVerdict::Valid);
        assert_eq!(module.verify(&credentials, "REGISTER", Some(&secret()), false), DigestVerdict::Replayed);
        assert_eq!(module.verify(&credentials, "REGISTER", Some(&secret()), true), DigestVerdict::Valid);

        let next = answer(&challenge, "secret", "00000002");
        assert_eq!(module.verify(&next, "REGISTER", Some(&secret()), false), DigestVerdict::Valid);
    }

    #[test]
    fn test_unsupported_algorithm() {
        let md5_only = module(vec![DigestAlgorithm::Md5]);
        let sha_module = module(vec![DigestAlgorithm::Sha256]);
        let mut challenge = sha_module.challenge();
        // Nonce known to the MD5 realm, algorithm not accepted there
        md5_only.nonce_store().insert(&challenge.nonce);
        challenge.realm = "example.com".to_string();
        let credentials = answer(&challenge, "secret", "00000001");

        assert_eq!(
            md5_only.verify(&credentials, "REGISTER", Some(&secret()), false),
            DigestVerdict::NoCredential
        );
    }

    #[test]
    fn test_password_fetch_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let module = AuthModule::new(
            "example.com",
            RealmSettings::default(),
            Arc::new(move |found| {
                if found {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        module.password_fetched(true);
        module.password_fetched(false);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_select_credentials_by_realm() {
        let module = module(vec![DigestAlgorithm::Md5]);
        let mut other = answer(&module.challenge(), "secret", "00000001");
        other.realm = "downstream.org".to_string();
        let mine = answer(&module.challenge(), "secret", "00000001");
        let all = vec![other, mine.clone()];

        assert_eq!(module.select_credentials(&all), Some(&mine));
    }
}
