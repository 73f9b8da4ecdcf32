//! SIP message types and header access

use super::via::ViaHeader;
use crate::domain::shared::SipUri;
use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            Method::Info => Some(SipMethod::Info),
            Method::Update => Some(SipMethod::Update),
            Method::PRack => Some(SipMethod::Prack),
            Method::Subscribe => Some(SipMethod::Subscribe),
            Method::Notify => Some(SipMethod::Notify),
            Method::Refer => Some(SipMethod::Refer),
            Method::Message => Some(SipMethod::Message),
            Method::Publish => Some(SipMethod::Publish),
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compact header forms (RFC 3261 section 7.3.3) the engine reads
const COMPACT_NAMES: &[(&str, &str)] = &[("f", "From"), ("v", "Via"), ("m", "Contact"), ("t", "To")];

/// Split a rendered `Name: value` header line.
fn split_header(rendered: &str) -> Option<(&str, &str)> {
    rendered
        .split_once(':')
        .map(|(name, value)| (name.trim(), value.trim()))
}

fn header_name_matches(found: &str, wanted: &str) -> bool {
    if found.eq_ignore_ascii_case(wanted) {
        return true;
    }
    COMPACT_NAMES
        .iter()
        .any(|(compact, full)| found.eq_ignore_ascii_case(compact) && full.eq_ignore_ascii_case(wanted))
}

/// Values of every header called `name`, in message order
pub(crate) fn header_values(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter_map(|h| {
            let rendered = h.to_string();
            let (found, value) = split_header(&rendered)?;
            header_name_matches(found, name).then(|| value.to_string())
        })
        .collect()
}

/// URI inside a name-addr (`"Alice" <sip:alice@example.com>;tag=x`) or addr-spec
pub(crate) fn extract_uri(value: &str) -> Option<&str> {
    let value = value.trim();
    if let Some(start) = value.find('<') {
        let rest = &value[start + 1..];
        return rest.find('>').map(|end| &rest[..end]);
    }
    // addr-spec form: header parameters follow the first ';'
    value.split(';').next().map(str::trim).filter(|v| !v.is_empty())
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn method_name(&self) -> String {
        self.inner.method.to_string()
    }

    pub fn is_register(&self) -> bool {
        self.method() == Some(SipMethod::Register)
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    /// First value of header `name` (case-insensitive, compact forms accepted)
    pub fn header(&self, name: &str) -> Option<String> {
        header_values(&self.inner.headers, name).into_iter().next()
    }

    /// Every value of header `name`
    pub fn header_all(&self, name: &str) -> Vec<String> {
        header_values(&self.inner.headers, name)
    }

    /// Request-URI as text
    pub fn request_uri(&self) -> String {
        self.inner.uri.to_string()
    }

    /// Parsed request-URI
    pub fn request_uri_parsed(&self) -> Option<SipUri> {
        SipUri::parse(&self.request_uri()).ok()
    }

    /// URI of the From header
    pub fn from_uri(&self) -> Option<SipUri> {
        let from = self.header("From")?;
        SipUri::parse(extract_uri(&from)?).ok()
    }

    /// Topmost Via header
    pub fn top_via(&self) -> Option<ViaHeader> {
        let via = self.header("Via")?;
        // Several Via values can share one header line
        let first = via.split(',').next()?;
        ViaHeader::parse(first).ok()
    }

    /// Expires header value in seconds
    pub fn expires(&self) -> Option<u32> {
        self.header("Expires")?.trim().parse().ok()
    }

    pub fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<String> {
        self.header("CSeq")
    }

    /// `tag` parameter of the From header
    pub fn from_tag(&self) -> Option<String> {
        let from = self.header("From")?;
        // Parameters after a name-addr belong to the header, not the URI
        let params = from.rsplit_once('>').map(|(_, params)| params).unwrap_or(&from);
        params.split(';').find_map(|param| {
            let (key, value) = param.split_once('=')?;
            key.trim().eq_ignore_ascii_case("tag").then(|| value.trim().to_string())
        })
    }

    /// Remove every header called `name` for which `remove` returns true.
    pub fn remove_headers<F>(&mut self, name: &str, mut remove: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let before = self.inner.headers.iter().count();
        self.inner.headers.retain(|h| {
            let rendered = h.to_string();
            match split_header(&rendered) {
                Some((found, value)) if header_name_matches(found, name) => !remove(value),
                _ => true,
            }
        });
        before - self.inner.headers.iter().count()
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn header(&self, name: &str) -> Option<String> {
        header_values(&self.inner.headers, name).into_iter().next()
    }

    pub fn header_all(&self, name: &str) -> Vec<String> {
        header_values(&self.inner.headers, name)
    }

    pub fn from_uri(&self) -> Option<SipUri> {
        let from = self.header("From")?;
        SipUri::parse(extract_uri(&from)?).ok()
    }

    /// Append a header built from a name and a raw value
    pub fn push_header(&mut self, name: &str, value: String) {
        self.inner
            .headers
            .push(Header::Other(name.to_string(), value));
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &[u8] = b"REGISTER sip:registrar.example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds;received=203.0.113.7\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Contact: <sip:alice@192.168.1.100:5060>\r\n\
                     Expires: 3600\r\n\
                     X-Create-Account: yes\r\n\
                     Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_register_request() {
        let req = SipRequest::parse(REGISTER).unwrap();
        assert_eq!(req.method(), Some(SipMethod::Register));
        assert!(req.is_register());
        assert_eq!(req.call_id(), Some("a84b4c76e66710@pc33.example.com".to_string()));
        assert_eq!(req.expires(), Some(3600));
    }

    #[test]
    fn test_from_uri_and_custom_header() {
        let req = SipRequest::parse(REGISTER).unwrap();
        let from = req.from_uri().unwrap();
        assert_eq!(from.user(), Some("alice"));
        assert_eq!(from.host(), "example.com");
        assert_eq!(req.header("x-create-account"), Some("yes".to_string()));
        assert_eq!(req.header("X-Phone-Alias"), None);
    }

    #[test]
    fn test_from_tag_and_cseq() {
        let req = SipRequest::parse(REGISTER).unwrap();
        assert_eq!(req.from_tag(), Some("1928301774".to_string()));
        assert_eq!(req.cseq(), Some("314159 REGISTER".to_string()));
    }

    #[test]
    fn test_top_via() {
        let req = SipRequest::parse(REGISTER).unwrap();
        let via = req.top_via().unwrap();
        assert_eq!(via.host, "192.168.1.100");
        assert_eq!(via.received.as_deref(), Some("203.0.113.7"));
        assert_eq!(via.branch.as_deref(), Some("z9hG4bK776asdhds"));
    }

    #[test]
    fn test_remove_headers() {
        let mut req = SipRequest::parse(REGISTER).unwrap();
        let removed = req.remove_headers("X-Create-Account", |_| true);
        assert_eq!(removed, 1);
        assert_eq!(req.header("X-Create-Account"), None);
        assert!(req.header("Call-ID").is_some());
    }

    #[test]
    fn test_extract_uri() {
        assert_eq!(
            extract_uri("\"Bob\" <sip:bob@example.com>;tag=abc"),
            Some("sip:bob@example.com")
        );
        assert_eq!(extract_uri("sip:bob@example.com;tag=abc"), Some("sip:bob@example.com"));
        assert_eq!(extract_uri(""), None);
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 407 Proxy Authentication Required\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Bob <sip:bob@example.com>;tag=a6c85cf\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 1 INVITE\r\n\
                     Proxy-Authenticate: Digest realm=\"downstream.org\", nonce=\"x\"\r\n\
                     Content-Length: 0\r\n\r\n";

        let mut resp = SipResponse::parse(data).unwrap();
        assert_eq!(resp.status_code(), 407);
        assert_eq!(resp.header_all("Proxy-Authenticate").len(), 1);

        resp.push_header("Proxy-Authenticate", "Digest realm=\"example.com\"".to_string());
        assert_eq!(resp.header_all("Proxy-Authenticate").len(), 2);
    }
}
