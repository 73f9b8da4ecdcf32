//! Password file backend
//!
//! ```text
//! version:1
//! alice@example.com clrtxt:secret ;+33612345678
//! bob@example.com md5:97ffb1c6af18e5687bf26cdf35e45d30 sha256:... ;
//! ```
//!
//! The first non-comment line must declare the format version. Each account
//! line holds `user@domain`, any number of `clrtxt:`, `md5:` and `sha256:`
//! credentials, then an optional phone alias after `;`.

use super::memory::{InMemoryAuthDb, StoredAccount};
use crate::config::ConfigError;
use crate::domain::credential::CredentialMaterial;
use crate::infrastructure::protocols::sip::digest::DigestAlgorithm;
use std::path::Path;
use tracing::info;

const SUPPORTED_VERSION: &str = "1";

fn parse_error(path: &str, line: usize, reason: impl Into<String>) -> ConfigError {
    ConfigError::PasswordFile {
        path: path.to_string(),
        line,
        reason: reason.into(),
    }
}

/// Parse password file content. `origin` names the file in errors.
pub fn parse_password_file(content: &str, origin: &str) -> Result<Vec<StoredAccount>, ConfigError> {
    let mut lines = content
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

    match lines.next() {
        Some((number, header)) => {
            let version = header
                .strip_prefix("version:")
                .ok_or_else(|| parse_error(origin, number, "expected 'version:' header"))?;
            if version.trim() != SUPPORTED_VERSION {
                return Err(parse_error(
                    origin,
                    number,
                    format!("unsupported version {}", version.trim()),
                ));
            }
        }
        None => return Err(parse_error(origin, 0, "empty password file")),
    }

    lines
        .map(|(number, line)| parse_account_line(line).map_err(|reason| parse_error(origin, number, reason)))
        .collect()
}

fn parse_account_line(line: &str) -> Result<StoredAccount, String> {
    let (accounts_part, alias) = match line.split_once(';') {
        Some((left, right)) => (left, right.trim()),
        None => (line, ""),
    };

    let mut fields = accounts_part.split_whitespace();
    let identity = fields.next().ok_or("missing user@domain")?;
    let (user, domain) = identity
        .split_once('@')
        .filter(|(user, domain)| !user.is_empty() && !domain.is_empty())
        .ok_or_else(|| format!("invalid identity '{}'", identity))?;

    let credentials = fields
        .map(|field| {
            let (kind, value) = field
                .split_once(':')
                .ok_or_else(|| format!("invalid credential '{}'", field))?;
            match kind {
                "clrtxt" => Ok(CredentialMaterial::ClearText(value.to_string())),
                "md5" => hashed(DigestAlgorithm::Md5, value, 32),
                "sha256" => hashed(DigestAlgorithm::Sha256, value, 64),
                other => Err(format!("unknown credential type '{}'", other)),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    if credentials.is_empty() {
        return Err(format!("no credential for {}", identity));
    }

    Ok(StoredAccount::new(user, domain, credentials).with_phone_alias(alias))
}

fn hashed(algorithm: DigestAlgorithm, value: &str, len: usize) -> Result<CredentialMaterial, String> {
    if value.len() != len || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("invalid {} hash", algorithm));
    }
    Ok(CredentialMaterial::Ha1 {
        algorithm,
        hash: value.to_lowercase(),
    })
}

/// Load a password file into a fresh in-memory store.
pub fn load_password_file(path: &Path) -> Result<InMemoryAuthDb, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let accounts = parse_password_file(&content, &path.display().to_string())?;

    let db = InMemoryAuthDb::new();
    let count = accounts.len();
    for account in accounts {
        db.add_account(account);
    }
    info!("Loaded {} accounts from {}", count, path.display());
    Ok(db)
}
