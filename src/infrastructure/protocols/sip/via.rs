//! Via header inspection
//!
//! The authentication engine identifies the previous hop from the topmost
//! Via: the `received` parameter set by the transport layer when the packet
//! source differs from the sent-by address (RFC 3261 section 18.2.1, RFC 3581),
//! otherwise the sent-by host itself.

use super::message::SipError;
use tracing::debug;

/// Parsed Via header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub branch: Option<String>,
    pub received: Option<String>,
    pub rport: Option<u16>,
}

impl ViaHeader {
    /// Parse `SIP/2.0/UDP host:port;branch=...;received=...`
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let value = value.trim();
        let mut parts = value.split(';');
        let sent = parts.next().unwrap_or_default().trim();

        let (protocol, sent_by) = sent
            .split_once(char::is_whitespace)
            .ok_or_else(|| SipError::InvalidMessage(format!("Malformed Via: {}", value)))?;
        let transport = protocol
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_uppercase();

        let (host, port) = crate::domain::shared::value_objects::split_host_port(sent_by.trim())
            .map_err(|e| SipError::InvalidMessage(e.to_string()))?;

        let params: Vec<&str> = parts.map(str::trim).collect();

        Ok(Self {
            transport,
            host,
            port,
            branch: param_value(&params, "branch").map(str::to_string),
            received: extract_received_from_via(value),
            rport: extract_rport_from_via(value),
        })
    }

    /// Address of the previous hop: `received` when present, else sent-by host
    pub fn effective_host(&self) -> &str {
        self.received.as_deref().unwrap_or(&self.host)
    }
}

fn param_value<'a>(params: &[&'a str], name: &str) -> Option<&'a str> {
    params.iter().find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// Extract rport value from Via header
///
/// Returns the port number if rport parameter is present with a value
pub fn extract_rport_from_via(via_header: &str) -> Option<u16> {
    for param in via_header.split(';') {
        if let Some(port_str) = param.trim().strip_prefix("rport=") {
            if let Ok(port) = port_str.parse::<u16>() {
                debug!("Extracted rport value: {}", port);
                return Some(port);
            }
        }
    }
    None
}

/// Extract received parameter from Via header
pub fn extract_received_from_via(via_header: &str) -> Option<String> {
    for param in via_header.split(';') {
        if let Some(ip_str) = param.trim().strip_prefix("received=") {
            debug!("Extracted received value: {}", ip_str);
            return Some(ip_str.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_via() {
        let via = ViaHeader::parse("SIP/2.0/udp 192.168.1.100:5060;branch=z9hG4bK776asdhds").unwrap();
        assert_eq!(via.transport, "UDP");
        assert_eq!(via.host, "192.168.1.100");
        assert_eq!(via.port, Some(5060));
        assert_eq!(via.branch.as_deref(), Some("z9hG4bK776asdhds"));
        assert_eq!(via.effective_host(), "192.168.1.100");
    }

    #[test]
    fn test_received_takes_precedence() {
        let via = ViaHeader::parse(
            "SIP/2.0/TLS client.example.com;branch=z9hG4bKabc;rport=51234;received=203.0.113.7",
        )
        .unwrap();
        assert_eq!(via.host, "client.example.com");
        assert_eq!(via.port, None);
        assert_eq!(via.rport, Some(51234));
        assert_eq!(via.effective_host(), "203.0.113.7");
    }

    #[test]
    fn test_ipv6_sent_by() {
        let via = ViaHeader::parse("SIP/2.0/TCP [2001:db8::1]:5061;branch=z9hG4bKx").unwrap();
        assert_eq!(via.host, "2001:db8::1");
        assert_eq!(via.port, Some(5061));
    }

    #[test]
    fn test_malformed_via() {
        assert!(ViaHeader::parse("garbage").is_err());
    }

    #[test]
    fn test_extract_rport_no_value() {
        let via = "SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds;rport";
        assert_eq!(extract_rport_from_via(via), None);
        assert_eq!(extract_received_from_via(via), None);
    }
}
