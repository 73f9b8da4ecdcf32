//! TLS client certificate identity matching
//!
//! The transport layer hands us the names a verified peer certificate
//! presents (subjectAltName DNS / URI / IP entries and the CN). This module
//! decides whether those names vouch for the identity claimed in the From
//! header of a request.

use super::shared::{DomainError, SipUri};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Names presented by a peer certificate, already extracted by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCertificate {
    pub san_dns_names: Vec<String>,
    pub san_uris: Vec<String>,
    pub san_ip_addresses: Vec<String>,
    pub common_name: Option<String>,
}

impl PeerCertificate {
    /// All presented subjects: DNS, URI, IP, then CN.
    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.san_dns_names
            .iter()
            .chain(self.san_uris.iter())
            .chain(self.san_ip_addresses.iter())
            .map(String::as_str)
            .chain(self.common_name.as_deref())
    }

    /// Whether any presented subject designates `searched`.
    pub fn find_subject(&self, searched: &str) -> bool {
        self.subjects().any(|subject| subject_matches(subject, searched))
    }

    /// First entry of `candidates` designated by a presented subject.
    pub fn find_any_subject<'a>(&self, candidates: &'a [String]) -> Option<&'a str> {
        candidates
            .iter()
            .find(|candidate| self.find_subject(candidate))
            .map(String::as_str)
    }

    /// Whether `pattern` matches at least one presented subject.
    pub fn match_subject(&self, pattern: &Regex) -> bool {
        self.subjects().any(|subject| pattern.is_match(subject))
    }
}

/// Compare a presented subject with a searched identity. A leading `sip:` or
/// `sips:` scheme is ignored on both sides, comparison is case-insensitive and
/// a presented `*` stands for any identity.
pub fn subject_matches(presented: &str, searched: &str) -> bool {
    if presented == "*" {
        return true;
    }
    strip_scheme(presented).eq_ignore_ascii_case(strip_scheme(searched))
}

fn strip_scheme(value: &str) -> &str {
    let value = value.trim();
    for scheme in ["sips:", "sip:"] {
        if value.len() >= scheme.len() && value[..scheme.len()].eq_ignore_ascii_case(scheme) {
            return &value[scheme.len()..];
        }
    }
    value
}

/// Certificate trust policy
#[derive(Debug, Clone, Default)]
pub struct CertificateTrustConfig {
    /// Checked against the presented subjects once an identity matched
    pub required_subject: Option<Regex>,
    /// `user@domain` or bare `user` (qualified with the From domain)
    pub trusted_client_certificates: Vec<String>,
    /// Accept certificates issued for the request URI domain
    pub trust_domain_certificates: bool,
}

impl CertificateTrustConfig {
    /// Build the policy, compiling the required-subject expression. An empty
    /// expression disables the post-check.
    pub fn new(
        required_subject: &str,
        trusted_client_certificates: Vec<String>,
        trust_domain_certificates: bool,
    ) -> Result<Self, DomainError> {
        let required_subject = if required_subject.trim().is_empty() {
            None
        } else {
            Some(Regex::new(required_subject).map_err(|e| {
                DomainError::InvalidConfiguration(format!(
                    "Could not compile regex for 'tls-client-certificate-required-subject' '{}': {}",
                    required_subject, e
                ))
            })?)
        };

        Ok(Self {
            required_subject,
            trusted_client_certificates,
            trust_domain_certificates,
        })
    }
}

/// The identity a request claims, as far as certificate matching goes
#[derive(Debug, Clone, Copy)]
pub struct ClaimedIdentity<'a> {
    pub from_user: Option<&'a str>,
    pub from_domain: &'a str,
    pub request_uri_domain: &'a str,
    pub is_register: bool,
}

/// Which rule accepted the certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateMatch {
    /// A subject equals `sip:user@domain`
    ExactIdentity,
    /// A subject is listed in `trusted-client-certificates`
    TrustedCertificate(String),
    /// A subject equals `sip:domain`, the certificate covers the whole domain
    DomainWide,
    /// A subject equals `sip:<request-uri domain>`
    RequestUriDomain,
}

/// Why a verified certificate was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateRejection {
    /// No rule matched the claimed identity
    IdentityMismatch,
    /// An identity matched but the required-subject expression did not
    RequiredSubjectMismatch,
}

#[derive(Debug, Clone, Copy)]
enum Rule {
    ExactIdentity,
    TrustedCertificate,
    DomainWide,
    RequestUriDomain,
}

const RULES: [Rule; 4] = [
    Rule::ExactIdentity,
    Rule::TrustedCertificate,
    Rule::DomainWide,
    Rule::RequestUriDomain,
];

/// Matches peer certificates against claimed identities
#[derive(Debug, Clone, Default)]
pub struct CertificateMatcher {
    config: CertificateTrustConfig,
}

impl CertificateMatcher {
    pub fn new(config: CertificateTrustConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CertificateTrustConfig {
        &self.config
    }

    /// Full check: identity rules first, then the required-subject post-check.
    pub fn authenticate(
        &self,
        certificate: &PeerCertificate,
        identity: &ClaimedIdentity<'_>,
    ) -> Result<CertificateMatch, CertificateRejection> {
        let matched = self
            .match_identity(certificate, identity)
            .ok_or(CertificateRejection::IdentityMismatch)?;

        if self.post_check(certificate) {
            Ok(matched)
        } else {
            Err(CertificateRejection::RequiredSubjectMismatch)
        }
    }

    /// Evaluate the identity rules in priority order; first match wins.
    pub fn match_identity(
        &self,
        certificate: &PeerCertificate,
        identity: &ClaimedIdentity<'_>,
    ) -> Option<CertificateMatch> {
        RULES
            .iter()
            .find_map(|rule| self.apply(*rule, certificate, identity))
    }

    fn apply(
        &self,
        rule: Rule,
        certificate: &PeerCertificate,
        identity: &ClaimedIdentity<'_>,
    ) -> Option<CertificateMatch> {
        match rule {
            Rule::ExactIdentity => {
                let user = identity.from_user?;
                let searched = SipUri::identity(Some(user), identity.from_domain);
                certificate.find_subject(&searched).then(|| {
                    debug!("Allowing message from matching TLS certificate");
                    CertificateMatch::ExactIdentity
                })
            }
            Rule::TrustedCertificate => {
                if identity.is_register {
                    return None;
                }
                let trusted = self.qualified_trusted_certificates(identity.from_domain);
                certificate.find_any_subject(&trusted).map(|found| {
                    debug!("Found trusted TLS certificate {}", found);
                    CertificateMatch::TrustedCertificate(found.to_string())
                })
            }
            Rule::DomainWide => {
                if identity.is_register {
                    return None;
                }
                let searched = SipUri::identity(None, identity.from_domain);
                certificate.find_subject(&searched).then(|| {
                    debug!("Found TLS certificate for entire domain");
                    CertificateMatch::DomainWide
                })
            }
            Rule::RequestUriDomain => {
                if identity.is_register || !self.config.trust_domain_certificates {
                    return None;
                }
                let searched = SipUri::identity(None, identity.request_uri_domain);
                certificate.find_subject(&searched).then(|| {
                    debug!("Found trusted TLS certificate for the request URI domain");
                    CertificateMatch::RequestUriDomain
                })
            }
        }
    }

    /// Required-subject post-check; passes when no expression is configured.
    pub fn post_check(&self, certificate: &PeerCertificate) -> bool {
        match &self.config.required_subject {
            Some(pattern) => {
                let ok = certificate.match_subject(pattern);
                if ok {
                    debug!("TLS certificate postcheck successful.");
                } else {
                    warn!("TLS certificate postcheck failed.");
                }
                ok
            }
            None => true,
        }
    }

    fn qualified_trusted_certificates(&self, from_domain: &str) -> Vec<String> {
        self.config
            .trusted_client_certificates
            .iter()
            .map(|entry| {
                if entry.contains('@') {
                    entry.clone()
                } else {
                    format!("{}@{}", entry, from_domain)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(uris: &[&str]) -> PeerCertificate {
        PeerCertificate {
            san_uris: uris.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn invite_from<'a>(user: &'a str, domain: &'a str) -> ClaimedIdentity<'a> {
        ClaimedIdentity {
            from_user: Some(user),
            from_domain: domain,
            request_uri_domain: "target.example.org",
            is_register: false,
        }
    }

    #[test]
    fn test_exact_identity_is_order_independent() {
        let matcher = CertificateMatcher::default();
        let identity = invite_from("alice", "example.com");

        let first = cert(&["sip:alice@example.com", "sip:other@example.net"]);
        let last = cert(&["sip:other@example.net", "sip:carol@x.org", "sip:alice@example.com"]);

        assert_eq!(matcher.authenticate(&first, &identity), Ok(CertificateMatch::ExactIdentity));
        assert_eq!(matcher.authenticate(&last, &identity), Ok(CertificateMatch::ExactIdentity));
    }

    #[test]
    fn test_domain_certificate_matches_any_user() {
        let matcher = CertificateMatcher::default();
        let certificate = cert(&["sip:example.com"]);

        assert_eq!(
            matcher.authenticate(&certificate, &invite_from("bob", "example.com")),
            Ok(CertificateMatch::DomainWide)
        );
        assert_eq!(
            matcher.authenticate(&certificate, &invite_from("bob", "example.net")),
            Err(CertificateRejection::IdentityMismatch)
        );
    }

    #[test]
    fn test_dns_name_designates_domain() {
        let matcher = CertificateMatcher::default();
        let certificate = PeerCertificate {
            san_dns_names: vec!["Example.COM".to_string()],
            ..Default::default()
        };
        assert!(matcher
            .match_identity(&certificate, &invite_from("bob", "example.com"))
            .is_some());
    }

    #[test]
    fn test_trusted_list_is_qualified_with_from_domain() {
        let config = CertificateTrustConfig::new("", vec!["gateway".to_string()], false).unwrap();
        let matcher = CertificateMatcher::new(config);
        let certificate = cert(&["sip:gateway@example.com"]);

        assert_eq!(
            matcher.authenticate(&certificate, &invite_from("alice", "example.com")),
            Ok(CertificateMatch::TrustedCertificate("gateway@example.com".to_string()))
        );
    }

    #[test]
    fn test_register_only_accepts_exact_identity() {
        let config = CertificateTrustConfig::new(
            "",
            vec!["gateway@example.com".to_string()],
            true,
        )
        .unwrap();
        let matcher = CertificateMatcher::new(config);
        let mut identity = invite_from("alice", "example.com");
        identity.is_register = true;

        let trusted = cert(&["sip:gateway@example.com"]);
        assert_eq!(
            matcher.match_identity(&trusted, &identity),
            None,
            "trusted list must not apply to REGISTER"
        );

        let request_domain = cert(&["sip:target.example.org"]);
        assert_eq!(matcher.match_identity(&request_domain, &identity), None);

        let domain = cert(&["sip:example.com"]);
        assert_eq!(matcher.match_identity(&domain, &identity), None);

        let exact = cert(&["sip:alice@example.com"]);
        assert_eq!(
            matcher.match_identity(&exact, &identity),
            Some(CertificateMatch::ExactIdentity)
        );
    }

    #[test]
    fn test_request_uri_domain_requires_flag() {
        let certificate = cert(&["sip:target.example.org"]);
        let identity = invite_from("alice", "example.com");

        let disabled = CertificateMatcher::default();
        assert_eq!(disabled.match_identity(&certificate, &identity), None);

        let enabled =
            CertificateMatcher::new(CertificateTrustConfig::new("", Vec::new(), true).unwrap());
        assert_eq!(
            enabled.match_identity(&certificate, &identity),
            Some(CertificateMatch::RequestUriDomain)
        );
    }

    #[test]
    fn test_exact_identity_wins_over_domain() {
        let matcher = CertificateMatcher::default();
        let certificate = cert(&["sip:example.com", "sip:alice@example.com"]);
        assert_eq!(
            matcher.match_identity(&certificate, &invite_from("alice", "example.com")),
            Some(CertificateMatch::ExactIdentity)
        );
    }

    #[test]
    fn test_required_subject_post_check() {
        let config =
            CertificateTrustConfig::new(r"^sip:.*@example\.com$", Vec::new(), false).unwrap();
        let matcher = CertificateMatcher::new(config);

        let good = cert(&["sip:alice@example.com"]);
        assert!(matcher
            .authenticate(&good, &invite_from("alice", "example.com"))
            .is_ok());

        // Domain certificate matches the identity rules but not the expression
        let domain_only = cert(&["sip:example.com"]);
        assert_eq!(
            matcher.authenticate(&domain_only, &invite_from("alice", "example.com")),
            Err(CertificateRejection::RequiredSubjectMismatch)
        );
    }

    #[test]
    fn test_required_subject_checks_common_name() {
        let config = CertificateTrustConfig::new("^edge-proxy$", Vec::new(), false).unwrap();
        let matcher = CertificateMatcher::new(config);
        let certificate = PeerCertificate {
            san_uris: vec!["sip:example.com".to_string()],
            common_name: Some("edge-proxy".to_string()),
            ..Default::default()
        };
        assert!(matcher.post_check(&certificate));
    }

    #[test]
    fn test_invalid_required_subject_is_rejected() {
        let result = CertificateTrustConfig::new("([unclosed", Vec::new(), false);
        assert!(matches!(result, Err(DomainError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_subject_comparison() {
        assert!(subject_matches("sip:Bob@Example.com", "sip:bob@example.com"));
        assert!(subject_matches("bob@example.com", "sip:bob@example.com"));
        assert!(subject_matches("sips:example.com", "sip:example.com"));
        assert!(subject_matches("*", "sip:anyone@anywhere"));
        assert!(!subject_matches("sip:bob@example.com", "sip:example.com"));
    }
}
