//! In-memory credential store
//!
//! Backs the `memory` and `file` implementations. Lookups always answer
//! synchronously. Test accounts carry an expiry and disappear once it passed.

use crate::domain::credential::{
    CredentialBackend, CredentialLookup, CredentialMaterial, PasswordLookup, TestAccount,
};
use crate::domain::shared::{DomainError, Result};
use crate::infrastructure::protocols::sip::digest::DigestAlgorithm;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// One account of the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAccount {
    pub user: String,
    pub domain: String,
    pub credentials: Vec<CredentialMaterial>,
    /// Phone number the account can also be looked up by
    pub phone_alias: Option<String>,
    /// Set for temporary accounts
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredAccount {
    pub fn new(user: impl Into<String>, domain: impl Into<String>, credentials: Vec<CredentialMaterial>) -> Self {
        Self {
            user: user.into(),
            domain: domain.into(),
            credentials,
            phone_alias: None,
            expires_at: None,
        }
    }

    pub fn with_phone_alias(mut self, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        self.phone_alias = (!alias.is_empty()).then_some(alias);
        self
    }

    /// Whether `name` designates this account, by user name or phone alias
    pub fn answers_to(&self, name: &str) -> bool {
        self.user.eq_ignore_ascii_case(name) || self.phone_alias.as_deref() == Some(name)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Material usable with `algorithm`: clear text first, then a stored HA1.
    fn material_for(&self, algorithm: DigestAlgorithm) -> Option<&CredentialMaterial> {
        self.credentials
            .iter()
            .find(|m| matches!(m, CredentialMaterial::ClearText(_)))
            .or_else(|| {
                self.credentials.iter().find(|m| {
                    matches!(m, CredentialMaterial::Ha1 { algorithm: stored, .. } if *stored == algorithm)
                })
            })
    }
}

fn account_key(user: &str, domain: &str) -> String {
    format!("{}@{}", user.to_lowercase(), domain.to_lowercase())
}

/// In-memory credential store
#[derive(Debug, Default)]
pub struct InMemoryAuthDb {
    accounts: RwLock<HashMap<String, StoredAccount>>,
}

impl InMemoryAuthDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an account.
    pub fn add_account(&self, account: StoredAccount) {
        let key = account_key(&account.user, &account.domain);
        debug!("Adding account {}", key);
        self.accounts.write().insert(key, account);
    }

    pub fn remove_account(&self, user: &str, domain: &str) -> bool {
        self.accounts.write().remove(&account_key(user, domain)).is_some()
    }

    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.read().is_empty()
    }

    /// Look up `user@domain`, or the account whose phone alias is `user`.
    /// The account must also answer to `from_user`.
    pub fn lookup_at(
        &self,
        user: &str,
        from_user: &str,
        domain: &str,
        algorithm: DigestAlgorithm,
        now: DateTime<Utc>,
    ) -> PasswordLookup {
        let key = account_key(user, domain);
        let found = {
            let accounts = self.accounts.read();
            accounts.get(&key).cloned().or_else(|| {
                accounts
                    .values()
                    .find(|a| {
                        a.domain.eq_ignore_ascii_case(domain) && a.phone_alias.as_deref() == Some(user)
                    })
                    .cloned()
            })
        };

        let account = match found {
            Some(account) => account,
            None => return PasswordLookup::NotFound,
        };

        if account.is_expired(now) {
            debug!("Account {} expired", key);
            self.remove_account(&account.user, &account.domain);
            return PasswordLookup::NotFound;
        }

        if !account.answers_to(from_user) {
            debug!("Account {} does not match From user {}", key, from_user);
            return PasswordLookup::NotFound;
        }

        match account.material_for(algorithm) {
            Some(material) => PasswordLookup::Found(material.clone()),
            None => {
                debug!("No {} credential for {}", algorithm, key);
                PasswordLookup::NotFound
            }
        }
    }

    pub fn create_account_at(&self, account: &TestAccount, now: DateTime<Utc>) -> Result<()> {
        if account.user.is_empty() || account.domain.is_empty() {
            return Err(DomainError::ValidationError(
                "Test account needs a user and a domain".to_string(),
            ));
        }

        let stored = StoredAccount {
            expires_at: Some(account.expires_at(now)),
            ..StoredAccount::new(
                &account.user,
                &account.domain,
                vec![CredentialMaterial::ClearText(account.password.clone())],
            )
            .with_phone_alias(&account.phone_alias)
        };
        self.add_account(stored);
        Ok(())
    }
}

impl CredentialBackend for InMemoryAuthDb {
    fn lookup(&self, user: &str, from_user: &str, domain: &str, algorithm: DigestAlgorithm) -> CredentialLookup {
        CredentialLookup::Ready(self.lookup_at(user, from_user, domain, algorithm, Utc::now()))
    }

    fn create_account(&self, account: &TestAccount) -> Result<()> {
        self.create_account_at(account, Utc::now())
    }
}
