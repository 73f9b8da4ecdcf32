//! PostgreSQL credential backend
//!
//! Accounts live in an `accounts` table:
//!
//! ```sql
//! CREATE TABLE accounts (
//!     username    TEXT NOT NULL,
//!     domain      TEXT NOT NULL,
//!     password    TEXT NOT NULL,
//!     algorithm   TEXT NOT NULL DEFAULT 'CLRTXT',  -- CLRTXT, MD5 or SHA-256
//!     phone_alias TEXT,
//!     expires_at  TIMESTAMPTZ,
//!     PRIMARY KEY (username, domain, algorithm)
//! );
//! ```
//!
//! Lookups run on the runtime and answer through a oneshot channel. A row
//! only matches when the From user names the same account.

use crate::domain::credential::{
    CredentialBackend, CredentialLookup, CredentialMaterial, PasswordLookup, TestAccount,
};
use crate::domain::shared::{DomainError, Result};
use crate::infrastructure::protocols::sip::digest::DigestAlgorithm;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{debug, error};

const CLEAR_TEXT: &str = "CLRTXT";

pub struct PgAuthDb {
    pool: PgPool,
}

impl PgAuthDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(
        pool: PgPool,
        user: String,
        from_user: String,
        domain: String,
        algorithm: DigestAlgorithm,
    ) -> PasswordLookup {
        let result = sqlx::query(
            r#"
            SELECT password, algorithm
            FROM accounts
            WHERE (username = $1 OR phone_alias = $1)
              AND (lower(username) = lower($2) OR phone_alias = $2)
              AND domain = $3
              AND algorithm IN ($4, $5)
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(&user)
        .bind(&from_user)
        .bind(&domain)
        .bind(CLEAR_TEXT)
        .bind(algorithm.as_str())
        .fetch_all(&pool)
        .await;

        match result {
            Ok(rows) => {
                let materials: Vec<CredentialMaterial> = rows
                    .iter()
                    .filter_map(|row| {
                        let password: String = row.get("password");
                        let stored: String = row.get("algorithm");
                        row_to_material(&stored, password)
                    })
                    .collect();
                // Clear text works with any algorithm and wins over a stored hash
                let chosen = materials
                    .iter()
                    .find(|m| matches!(m, CredentialMaterial::ClearText(_)))
                    .or_else(|| materials.first())
                    .cloned();

                match chosen {
                    Some(material) => PasswordLookup::Found(material),
                    None => {
                        debug!("No {} credential for {}@{}", algorithm, user, domain);
                        PasswordLookup::NotFound
                    }
                }
            }
            Err(e) => {
                error!("Failed to look up account {}@{}: {}", user, domain, e);
                PasswordLookup::BackendError(format!("Database error: {}", e))
            }
        }
    }

    async fn insert(pool: PgPool, account: TestAccount) {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts (username, domain, password, algorithm, phone_alias, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (username, domain, algorithm)
            DO UPDATE SET password = EXCLUDED.password,
                          phone_alias = EXCLUDED.phone_alias,
                          expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&account.user)
        .bind(&account.domain)
        .bind(&account.password)
        .bind(CLEAR_TEXT)
        .bind((!account.phone_alias.is_empty()).then(|| account.phone_alias.clone()))
        .bind(account.expires_at(Utc::now()))
        .execute(&pool)
        .await;

        match result {
            Ok(_) => debug!("Created test account {}@{}", account.user, account.domain),
            Err(e) => error!(
                "Failed to create test account {}@{}: {}",
                account.user, account.domain, e
            ),
        }
    }
}

fn row_to_material(stored: &str, password: String) -> Option<CredentialMaterial> {
    if stored.eq_ignore_ascii_case(CLEAR_TEXT) {
        return Some(CredentialMaterial::ClearText(password));
    }
    stored
        .parse::<DigestAlgorithm>()
        .ok()
        .map(|algorithm| CredentialMaterial::Ha1 {
            algorithm,
            hash: password.to_lowercase(),
        })
}

impl CredentialBackend for PgAuthDb {
    fn lookup(&self, user: &str, from_user: &str, domain: &str, algorithm: DigestAlgorithm) -> CredentialLookup {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                return CredentialLookup::Ready(PasswordLookup::BackendError(format!(
                    "no runtime for database lookup: {}",
                    e
                )))
            }
        };

        let (sender, lookup) = CredentialLookup::pending();
        let pool = self.pool.clone();
        let (user, from_user, domain) = (user.to_string(), from_user.to_string(), domain.to_string());
        handle.spawn(async move {
            let result = Self::fetch(pool, user, from_user, domain, algorithm).await;
            // The request may be gone already
            let _ = sender.send(result);
        });
        lookup
    }

    fn create_account(&self, account: &TestAccount) -> Result<()> {
        let handle = Handle::try_current().map_err(|e| DomainError::Backend(e.to_string()))?;
        handle.spawn(Self::insert(self.pool.clone(), account.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_to_material() {
        assert_eq!(
            row_to_material("CLRTXT", "secret".to_string()),
            Some(CredentialMaterial::ClearText("secret".to_string()))
        );
        assert_eq!(
            row_to_material("SHA-256", "ABCD".to_string()),
            Some(CredentialMaterial::Ha1 {
                algorithm: DigestAlgorithm::Sha256,
                hash: "abcd".to_string(),
            })
        );
        assert_eq!(row_to_material("bcrypt", "x".to_string()), None);
    }
}
