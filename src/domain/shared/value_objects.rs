//! Shared value objects used across the authentication engine

use super::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Request event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SIP URI value object
///
/// Only the parts the authentication engine looks at are kept: scheme, user,
/// password, host and port. URI parameters and headers are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    secure: bool,
    user: Option<String>,
    password: Option<String>,
    host: String,
    port: Option<u16>,
}

impl SipUri {
    pub fn new(user: Option<String>, host: String, port: Option<u16>) -> Self {
        Self {
            secure: false,
            user,
            password: None,
            host,
            port,
        }
    }

    /// Parse `sip:[user[:password]@]host[:port][;params][?headers]`.
    pub fn parse(uri: &str) -> Result<Self, DomainError> {
        let uri = uri.trim();
        let (secure, rest) = if let Some(rest) = strip_prefix_ignore_case(uri, "sips:") {
            (true, rest)
        } else if let Some(rest) = strip_prefix_ignore_case(uri, "sip:") {
            (false, rest)
        } else {
            return Err(DomainError::InvalidUri(format!(
                "URI must start with 'sip:' or 'sips:': {}",
                uri
            )));
        };

        // Parameters and headers never carry identity
        let rest = rest.split(|c| c == ';' || c == '?').next().unwrap_or_default();

        let (userinfo, host_port) = match rest.rsplit_once('@') {
            Some((userinfo, host_port)) => (Some(userinfo), host_port),
            None => (None, rest),
        };

        let (user, password) = match userinfo {
            Some(userinfo) => match userinfo.split_once(':') {
                Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
                None => (Some(userinfo.to_string()), None),
            },
            None => (None, None),
        };

        let (host, port) = split_host_port(host_port)?;
        if host.is_empty() {
            return Err(DomainError::InvalidUri(format!("Missing host in URI: {}", uri)));
        }

        Ok(Self {
            secure,
            user: user.filter(|u| !u.is_empty()),
            password,
            host,
            port,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// `sip:user@host` or `sip:host`, without port or password. This is the
    /// form certificate subjects are compared against.
    pub fn identity(user: Option<&str>, host: &str) -> String {
        match user {
            Some(user) => format!("sip:{}@{}", user, host),
            None => format!("sip:{}", host),
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "sips" } else { "sip" };
        write!(f, "{}:", scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

/// Split `host[:port]`, keeping IPv6 references (`[::1]:5060`) intact.
pub(crate) fn split_host_port(host_port: &str) -> Result<(String, Option<u16>), DomainError> {
    let host_port = host_port.trim();

    if let Some(rest) = host_port.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| DomainError::InvalidUri(format!("Unterminated IPv6 reference: {}", host_port)))?;
        let port = match after.strip_prefix(':') {
            Some(port) => Some(parse_port(port)?),
            None => None,
        };
        return Ok((host.to_string(), port));
    }

    match host_port.rsplit_once(':') {
        // More than one colon without brackets: a bare IPv6 address
        Some((host, _)) if host.contains(':') => Ok((host_port.to_string(), None)),
        Some((host, port)) => Ok((host.to_string(), Some(parse_port(port)?))),
        None => Ok((host_port.to_string(), None)),
    }
}

fn parse_port(port: &str) -> Result<u16, DomainError> {
    port.parse()
        .map_err(|_| DomainError::InvalidUri(format!("Invalid port: {}", port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip_uri_parse() {
        let uri = SipUri::parse("sip:alice@example.com").unwrap();
        assert_eq!(uri.user(), Some("alice"));
        assert_eq!(uri.host(), "example.com");
        assert_eq!(uri.port(), None);

        let uri_with_port = SipUri::parse("sip:bob@example.com:5060").unwrap();
        assert_eq!(uri_with_port.user(), Some("bob"));
        assert_eq!(uri_with_port.host(), "example.com");
        assert_eq!(uri_with_port.port(), Some(5060));
    }

    #[test]
    fn test_sip_uri_password_and_params() {
        let uri = SipUri::parse("sip:carol:s3cret@example.com;transport=tls").unwrap();
        assert_eq!(uri.user(), Some("carol"));
        assert_eq!(uri.password(), Some("s3cret"));
        assert_eq!(uri.host(), "example.com");
    }

    #[test]
    fn test_sip_uri_without_user() {
        let uri = SipUri::parse("sips:example.com").unwrap();
        assert!(uri.is_secure());
        assert_eq!(uri.user(), None);
        assert_eq!(uri.to_string(), "sips:example.com");
    }

    #[test]
    fn test_sip_uri_ipv6_host() {
        let uri = SipUri::parse("sip:[2001:db8::1]:5070;transport=tcp").unwrap();
        assert_eq!(uri.host(), "2001:db8::1");
        assert_eq!(uri.port(), Some(5070));
    }

    #[test]
    fn test_sip_uri_rejects_other_schemes() {
        assert!(SipUri::parse("tel:+33123456789").is_err());
        assert!(SipUri::parse("sip:").is_err());
    }

    #[test]
    fn test_identity_string() {
        assert_eq!(SipUri::identity(Some("bob"), "example.com"), "sip:bob@example.com");
        assert_eq!(SipUri::identity(None, "example.com"), "sip:example.com");
    }
}
