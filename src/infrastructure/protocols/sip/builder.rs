//! SIP response builder

use super::message::{SipError, SipRequest, SipResponse};
use rsip::{Header, Headers, Response, StatusCode, Version};

/// Value of the Server header on locally generated responses
pub const SERVER_NAME: &str = concat!("yakyak-auth/", env!("CARGO_PKG_VERSION"));

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    reason: Option<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn unauthorized() -> Self {
        Self::new(401)
    }

    pub fn forbidden() -> Self {
        Self::new(403)
    }

    pub fn proxy_authentication_required() -> Self {
        Self::new(407)
    }

    /// Use a reason phrase other than the standard one
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// Add a header the typed model has no variant for
    pub fn raw_header(self, name: &str, value: impl Into<String>) -> Self {
        self.header(Header::Other(name.to_string(), value.into()))
    }

    pub fn build_for_request(mut self, request: &SipRequest) -> Result<SipResponse, SipError> {
        // Copy essential headers from request
        let mut headers: Vec<Header> = request
            .headers()
            .iter()
            .filter(|header| {
                matches!(
                    header,
                    Header::Via(_) | Header::From(_) | Header::To(_) | Header::CallId(_) | Header::CSeq(_)
                )
            })
            .cloned()
            .collect();
        headers.append(&mut self.headers);
        headers.push(Header::Other("Server".to_string(), SERVER_NAME.to_string()));

        headers.push(Header::ContentLength(
            if self.body.is_empty() {
                "0".into()
            } else {
                self.body.len().to_string().into()
            },
        ));

        let status_code = match self.reason {
            Some(reason) => StatusCode::Other(self.status_code, reason),
            None => StatusCode::from(self.status_code),
        };

        let response = Response {
            status_code,
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}
