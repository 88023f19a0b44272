//! SIP message builders

use rsip::{Header, Headers, Request, Response, StatusCode, Uri, Version};

use super::message::{
    header_name_value, header_param, make_header, same_header_name, SipError, SipHeaders,
    SipMethod, SipRequest, SipResponse,
};

pub const DEFAULT_MAX_FORWARDS: u32 = 70;

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<Header>,
    body: Vec<u8>,
    content_type: Option<String>,
    to_tag: Option<String>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: Vec::new(),
            content_type: None,
            to_tag: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn trying() -> Self {
        Self::new(100)
    }

    pub fn body(mut self, body: Vec<u8>, content_type: &str) -> Self {
        self.body = body;
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn with(self, name: &str, value: impl Into<String>) -> Self {
        self.header(make_header(name, value))
    }

    /// Tag added to the To header unless the request already carries one
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers = Vec::new();

        // Record-Route is mirrored on dialog-creating responses only
        let mirror_record_route = request.method() == Some(SipMethod::Invite)
            && self.status_code > 100
            && self.status_code < 300;

        for header in request.headers().iter() {
            let Some((name, value)) = header_name_value(header) else {
                continue;
            };
            if same_header_name(&name, "To") {
                match (&self.to_tag, header_param(&value, "tag")) {
                    (Some(tag), None) if self.status_code > 100 => {
                        headers.push(make_header("To", format!("{};tag={}", value, tag)));
                    }
                    _ => headers.push(header.clone()),
                }
            } else if ["Via", "From", "Call-ID", "CSeq"]
                .iter()
                .any(|n| same_header_name(&name, n))
                || (mirror_record_route && same_header_name(&name, "Record-Route"))
            {
                headers.push(header.clone());
            }
        }

        headers.extend(self.headers);

        if let Some(content_type) = self.content_type.filter(|_| !self.body.is_empty()) {
            headers.push(make_header("Content-Type", content_type));
        }
        headers.push(make_header("Content-Length", self.body.len().to_string()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

/// Build a new out-of-transaction request
pub struct RequestBuilder {
    method: SipMethod,
    uri: String,
    headers: Vec<Header>,
    body: Vec<u8>,
    content_type: Option<String>,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
            body: Vec::new(),
            content_type: None,
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push(make_header(name, value));
        self
    }

    pub fn via(self, via: impl Into<String>) -> Self {
        self.with("Via", via)
    }

    pub fn from(self, from: impl Into<String>) -> Self {
        self.with("From", from)
    }

    pub fn to(self, to: impl Into<String>) -> Self {
        self.with("To", to)
    }

    pub fn call_id(self, call_id: impl Into<String>) -> Self {
        self.with("Call-ID", call_id)
    }

    pub fn cseq(self, seq: u32) -> Self {
        let method = self.method;
        self.with("CSeq", format!("{} {}", seq, method))
    }

    pub fn contact(self, contact: impl Into<String>) -> Self {
        self.with("Contact", contact)
    }

    pub fn routes(mut self, routes: &[String]) -> Self {
        for route in routes {
            self.headers.push(make_header("Route", route.clone()));
        }
        self
    }

    pub fn body(mut self, body: Vec<u8>, content_type: &str) -> Self {
        self.body = body;
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn build(mut self) -> Result<SipRequest, SipError> {
        let has_max_forwards = self.headers.iter().any(|h| {
            header_name_value(h)
                .map(|(n, _)| same_header_name(&n, "Max-Forwards"))
                .unwrap_or(false)
        });
        if !has_max_forwards {
            self.headers
                .push(make_header("Max-Forwards", DEFAULT_MAX_FORWARDS.to_string()));
        }
        if let Some(content_type) = self.content_type.filter(|_| !self.body.is_empty()) {
            self.headers.push(make_header("Content-Type", content_type));
        }
        self.headers
            .push(make_header("Content-Length", self.body.len().to_string()));

        let request = Request {
            method: self.method.to_rsip(),
            uri: Uri::try_from(self.uri.as_str())?,
            version: Version::V2,
            headers: Headers::from(self.headers),
            body: self.body,
        };
        Ok(SipRequest::new(request))
    }
}

/// ACK for a non-2xx final response (RFC 3261 §17.1.1.3): same branch and
/// request-URI as the INVITE, To taken from the response
pub fn build_non_2xx_ack(invite: &SipRequest, response: &SipResponse) -> Result<SipRequest, SipError> {
    let top_via = invite
        .header_entries("Via")
        .into_iter()
        .next()
        .ok_or_else(|| SipError::InvalidMessage("INVITE without Via".to_string()))?;
    let cseq = invite
        .cseq()
        .ok_or_else(|| SipError::InvalidMessage("INVITE without CSeq".to_string()))?;

    RequestBuilder::new(SipMethod::Ack, invite.uri_string())
        .via(top_via)
        .from(invite.header("From").unwrap_or_default())
        .to(response.header("To").unwrap_or_default())
        .call_id(invite.call_id().unwrap_or_default())
        .cseq(cseq)
        .routes(&invite.routes())
        .build()
}

/// CANCEL matching a pending request (RFC 3261 §9.1)
pub fn build_cancel(request: &SipRequest) -> Result<SipRequest, SipError> {
    let top_via = request
        .header_entries("Via")
        .into_iter()
        .next()
        .ok_or_else(|| SipError::InvalidMessage("request without Via".to_string()))?;
    let cseq = request
        .cseq()
        .ok_or_else(|| SipError::InvalidMessage("request without CSeq".to_string()))?;

    RequestBuilder::new(SipMethod::Cancel, request.uri_string())
        .via(top_via)
        .from(request.header("From").unwrap_or_default())
        .to(request.header("To").unwrap_or_default())
        .call_id(request.call_id().unwrap_or_default())
        .cseq(cseq)
        .routes(&request.routes())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> SipRequest {
        let data = b"INVITE sip:bob@biloxi.example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP proxy.example.com;branch=z9hG4bKp1\r\n\
                     Via: SIP/2.0/UDP client.atlanta.example.com:5060;branch=z9hG4bK74bf9\r\n\
                     Max-Forwards: 69\r\n\
                     Record-Route: <sip:proxy.example.com;lr>\r\n\
                     Route: <sip:edge.biloxi.example.com;lr>\r\n\
                     From: Alice <sip:alice@atlanta.example.com>;tag=9fxced76sl\r\n\
                     To: Bob <sip:bob@biloxi.example.com>\r\n\
                     Call-ID: 3848276298220188511@atlanta.example.com\r\n\
                     CSeq: 2 INVITE\r\n\
                     Content-Length: 0\r\n\r\n";
        SipRequest::parse(data).unwrap()
    }

    #[test]
    fn test_response_copies_dialog_headers() {
        let response = ResponseBuilder::new(180)
            .to_tag("314159")
            .build_for_request(&invite())
            .unwrap();
        assert_eq!(response.status_code(), 180);
        assert_eq!(response.header_entries("Via").len(), 2);
        assert_eq!(response.to_tag(), Some("314159".to_string()));
        assert_eq!(response.header_entries("Record-Route").len(), 1);
        assert!(!response.has_header("Route"));
        assert_eq!(response.cseq(), Some(2));
    }

    #[test]
    fn test_trying_has_no_tag() {
        let response = ResponseBuilder::trying()
            .to_tag("314159")
            .build_for_request(&invite())
            .unwrap();
        assert_eq!(response.to_tag(), None);
        assert!(!response.has_header("Record-Route"));
    }

    #[test]
    fn test_non_2xx_ack() {
        let response = ResponseBuilder::new(486)
            .to_tag("abc")
            .build_for_request(&invite())
            .unwrap();
        let ack = build_non_2xx_ack(&invite(), &response).unwrap();
        assert_eq!(ack.method(), Some(SipMethod::Ack));
        assert_eq!(ack.header_entries("Via").len(), 1);
        assert_eq!(ack.top_via().unwrap().branch(), Some("z9hG4bKp1"));
        assert_eq!(ack.to_tag(), Some("abc".to_string()));
        assert_eq!(ack.cseq(), Some(2));
        assert_eq!(ack.cseq_method(), Some(SipMethod::Ack));
        assert_eq!(ack.routes().len(), 1);
    }

    #[test]
    fn test_cancel() {
        let cancel = build_cancel(&invite()).unwrap();
        assert_eq!(cancel.method(), Some(SipMethod::Cancel));
        assert_eq!(cancel.uri_string(), "sip:bob@biloxi.example.com");
        assert_eq!(cancel.top_via().unwrap().branch(), Some("z9hG4bKp1"));
        assert_eq!(cancel.cseq_method(), Some(SipMethod::Cancel));
        assert_eq!(cancel.max_forwards(), Some(DEFAULT_MAX_FORWARDS));
    }
}
