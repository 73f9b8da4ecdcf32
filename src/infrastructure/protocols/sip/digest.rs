//! SIP Digest primitives (RFC 2617, RFC 3261, RFC 8760)

use super::message::SipError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    #[serde(rename = "MD5")]
    Md5,
    #[serde(rename = "SHA-256")]
    Sha256,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
        }
    }

    /// Hex digest of `data`
    pub fn hash(&self, data: &str) -> String {
        match self {
            DigestAlgorithm::Md5 => format!("{:x}", md5::compute(data)),
            DigestAlgorithm::Sha256 => {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                hasher.update(data.as_bytes());
                format!("{:x}", hasher.finalize())
            }
        }
    }

    /// HA1 = H(username:realm:password)
    pub fn ha1(&self, username: &str, realm: &str, password: &str) -> String {
        self.hash(&format!("{}:{}:{}", username, realm, password))
    }

    /// HA2 = H(method:uri)
    pub fn ha2(&self, method: &str, uri: &str) -> String {
        self.hash(&format!("{}:{}", method, uri))
    }

    /// Response = H(HA1:nonce:HA2) or H(HA1:nonce:nc:cnonce:qop:HA2)
    pub fn response(
        &self,
        ha1: &str,
        nonce: &str,
        method: &str,
        uri: &str,
        qop: Option<&QopParams<'_>>,
    ) -> String {
        let ha2 = self.ha2(method, uri);
        match qop {
            Some(q) => self.hash(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, nonce, q.nc, q.cnonce, q.qop, ha2
            )),
            None => self.hash(&format!("{}:{}:{}", ha1, nonce, ha2)),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "MD5" => Ok(DigestAlgorithm::Md5),
            "SHA-256" => Ok(DigestAlgorithm::Sha256),
            other => Err(SipError::Authentication(format!(
                "Unsupported digest algorithm: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality-of-protection fields of a digest response
#[derive(Debug, Clone, Copy)]
pub struct QopParams<'a> {
    pub qop: &'a str,
    pub nc: &'a str,
    pub cnonce: &'a str,
}

/// Generate a random nonce
pub fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}

/// Authentication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: DigestAlgorithm,
    pub qop: Option<String>,
    pub stale: bool,
}

impl AuthChallenge {
    /// Parse a WWW-Authenticate / Proxy-Authenticate header value
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let params = parse_digest_params(value)?;
        let realm = params
            .get("realm")
            .cloned()
            .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?;
        let nonce = params
            .get("nonce")
            .cloned()
            .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?;
        let algorithm = match params.get("algorithm") {
            Some(name) => name.parse()?,
            None => DigestAlgorithm::Md5,
        };

        Ok(Self {
            realm,
            nonce,
            algorithm,
            qop: params.get("qop").cloned(),
            stale: params
                .get("stale")
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// Format as WWW-Authenticate / Proxy-Authenticate header value
    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            r#"Digest realm="{}", nonce="{}", algorithm={}"#,
            self.realm, self.nonce, self.algorithm
        );
        if let Some(qop) = &self.qop {
            value.push_str(&format!(r#", qop="{}""#, qop));
        }
        if self.stale {
            value.push_str(", stale=true");
        }
        value
    }
}

/// Parsed Authorization / Proxy-Authorization header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationHeader {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
}

impl AuthorizationHeader {
    /// Parse a `Digest ...` credentials value
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let params = parse_digest_params(value)?;
        let required = |name: &str| {
            params.get(name).cloned().ok_or_else(|| {
                SipError::Authentication(format!("Missing {} in Authorization", name))
            })
        };

        Ok(Self {
            username: required("username")?,
            realm: required("realm")?,
            nonce: required("nonce")?,
            uri: required("uri")?,
            response: required("response")?,
            algorithm: params.get("algorithm").cloned(),
            qop: params.get("qop").cloned(),
            nc: params.get("nc").cloned(),
            cnonce: params.get("cnonce").cloned(),
        })
    }

    /// Algorithm named in the credentials, MD5 when absent
    pub fn digest_algorithm(&self) -> Result<DigestAlgorithm, SipError> {
        match &self.algorithm {
            Some(name) => name.parse(),
            None => Ok(DigestAlgorithm::Md5),
        }
    }

    /// Numeric nonce-count, when qop is in use
    pub fn nonce_count(&self) -> Option<u32> {
        self.nc
            .as_deref()
            .and_then(|nc| u32::from_str_radix(nc, 16).ok())
    }

    pub fn qop_params(&self) -> Option<QopParams<'_>> {
        match (&self.qop, &self.nc, &self.cnonce) {
            (Some(qop), Some(nc), Some(cnonce)) => Some(QopParams { qop, nc, cnonce }),
            _ => None,
        }
    }
}

/// Parse Digest authentication parameters
fn parse_digest_params(auth_value: &str) -> Result<HashMap<String, String>, SipError> {
    let trimmed = auth_value.trim();
    let digest_str = match trimmed.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("Digest") => rest,
        _ => {
            return Err(SipError::Authentication(format!(
                "Not a Digest credential: {}",
                auth_value
            )))
        }
    };

    let mut params = HashMap::new();
    for part in split_params(digest_str) {
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim().to_lowercase();
            let value = value.trim().trim_matches('"');
            params.insert(key, value.to_string());
        }
    }

    debug!("Parsed {} digest parameters", params.len());
    Ok(params)
}

/// Split on commas that are not inside a quoted string
fn split_params(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(value[start..].trim());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_digest_params() {
        let auth = AuthorizationHeader::parse(
            r#"Digest username="alice", realm="test.com", nonce="abc123", uri="sip:bob@test.com", response="def456""#,
        )
        .unwrap();

        assert_eq!(auth.username, "alice");
        assert_eq!(auth.realm, "test.com");
        assert_eq!(auth.nonce, "abc123");
        assert_eq!(auth.digest_algorithm().unwrap(), DigestAlgorithm::Md5);
        assert!(auth.qop_params().is_none());
    }

    #[test]
    fn test_parse_quoted_commas_and_qop() {
        let auth = AuthorizationHeader::parse(
            r#"Digest username="alice", realm="a,b", nonce="n", uri="sip:x;lr", response="r", algorithm=SHA-256, qop=auth, nc=0000000a, cnonce="c""#,
        )
        .unwrap();

        assert_eq!(auth.realm, "a,b");
        assert_eq!(auth.digest_algorithm().unwrap(), DigestAlgorithm::Sha256);
        assert_eq!(auth.nonce_count(), Some(10));
        assert_eq!(auth.qop_params().unwrap().qop, "auth");
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let result = AuthorizationHeader::parse(r#"Digest username="alice", realm="x""#);
        assert!(result.is_err());
        assert!(AuthorizationHeader::parse(r#"Basic YWxhZGRpbjpvcGVuc2VzYW1l"#).is_err());
    }

    #[test]
    fn test_rfc2617_response() {
        // RFC 2617 section 3.5 example, with the SIP method and URI
        let algorithm = DigestAlgorithm::Md5;
        let ha1 = algorithm.ha1("Mufasa", "testrealm@host.com", "Circle Of Life");
        assert_eq!(ha1, "939e7578ed9e3c518a452acee763bce9");

        let qop = QopParams {
            qop: "auth",
            nc: "00000001",
            cnonce: "0a4f113b",
        };
        let response = algorithm.response(
            &ha1,
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some(&qop),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_algorithm_lengths() {
        assert_eq!(DigestAlgorithm::Md5.ha1("alice", "example.com", "secret").len(), 32);
        assert_eq!(DigestAlgorithm::Sha256.ha1("alice", "example.com", "secret").len(), 64);
    }

    #[test]
    fn test_algorithm_string_conversion() {
        assert_eq!("md5".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Md5);
        assert_eq!("SHA-256".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha256);
        assert!("SHA-512-256".parse::<DigestAlgorithm>().is_err());
        assert_eq!(DigestAlgorithm::Sha256.to_string(), "SHA-256");
    }

    #[test]
    fn test_challenge_header_value() {
        let challenge = AuthChallenge {
            realm: "example.com".to_string(),
            nonce: "abc".to_string(),
            algorithm: DigestAlgorithm::Md5,
            qop: Some("auth".to_string()),
            stale: true,
        };
        assert_eq!(
            challenge.to_header_value(),
            r#"Digest realm="example.com", nonce="abc", algorithm=MD5, qop="auth", stale=true"#
        );
        assert_eq!(generate_nonce().len(), 32);
        assert_eq!(AuthChallenge::parse(&challenge.to_header_value()).unwrap(), challenge);
    }
}
