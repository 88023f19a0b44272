//! SIP message types and header access
//!
//! Messages wrap the rsip types. Header access is name based: the typed rsip
//! headers and `Header::Other` entries are treated alike, so a header built
//! locally and one parsed off the wire are read the same way.

use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

use super::via::ViaHeader;

#[derive(Error, Debug, Clone)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

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

impl From<crate::domain::DomainError> for SipError {
    fn from(err: crate::domain::DomainError) -> Self {
        SipError::Internal(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
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

    pub fn parse(value: &str) -> Option<Self> {
        let method = match value.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "CANCEL" => SipMethod::Cancel,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            _ => return None,
        };
        Some(method)
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
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
            SipMethod::Info => Method::Info,
            SipMethod::Update => Method::Update,
            SipMethod::Prack => Method::PRack,
            SipMethod::Subscribe => Method::Subscribe,
            SipMethod::Notify => Method::Notify,
            SipMethod::Refer => Method::Refer,
            SipMethod::Message => Method::Message,
            SipMethod::Publish => Method::Publish,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Expand compact header forms (RFC 3261 §7.3.3)
fn canonical_name(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "k" | "K" => "Supported",
        _ => name,
    }
}

pub fn same_header_name(a: &str, b: &str) -> bool {
    canonical_name(a.trim()).eq_ignore_ascii_case(canonical_name(b.trim()))
}

/// Name and value of a header, whatever its rsip representation
pub fn header_name_value(header: &Header) -> Option<(String, String)> {
    if let Header::Other(name, value) = header {
        return Some((name.to_string(), value.trim().to_string()));
    }
    let line = header.to_string();
    let (name, value) = line.split_once(':')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

/// Build a header, typed where rsip knows the name
pub fn make_header(name: &str, value: impl Into<String>) -> Header {
    let value: String = value.into();
    match canonical_name(name).to_ascii_lowercase().as_str() {
        "via" => Header::Via(value.into()),
        "from" => Header::From(value.into()),
        "to" => Header::To(value.into()),
        "call-id" => Header::CallId(value.into()),
        "cseq" => Header::CSeq(value.into()),
        "contact" => Header::Contact(value.into()),
        "content-length" => Header::ContentLength(value.into()),
        "content-type" => Header::ContentType(value.into()),
        "max-forwards" => Header::MaxForwards(value.into()),
        "route" => Header::Route(value.into()),
        "record-route" => Header::RecordRoute(value.into()),
        "expires" => Header::Expires(value.into()),
        "allow" => Header::Allow(value.into()),
        "supported" => Header::Supported(value.into()),
        "require" => Header::Require(value.into()),
        "authorization" => Header::Authorization(value.into()),
        "proxy-authorization" => Header::ProxyAuthorization(value.into()),
        "www-authenticate" => Header::WwwAuthenticate(value.into()),
        "proxy-authenticate" => Header::ProxyAuthenticate(value.into()),
        "user-agent" => Header::UserAgent(value.into()),
        _ => Header::Other(name.to_string(), value),
    }
}

/// Split a header value on commas that are outside quotes and angle brackets
pub fn split_header_list(value: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for ch in value.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                let entry = current.trim();
                if !entry.is_empty() {
                    entries.push(entry.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    let entry = current.trim();
    if !entry.is_empty() {
        entries.push(entry.to_string());
    }
    entries
}

/// Header parameter of a name-addr value, e.g. the `tag` of a From header.
/// Flag parameters yield an empty string.
pub fn header_param(value: &str, param: &str) -> Option<String> {
    let tail = match value.rfind('>') {
        Some(idx) => &value[idx + 1..],
        None => match value.find(';') {
            Some(idx) => &value[idx..],
            None => "",
        },
    };
    tail.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .find_map(|segment| {
            let (key, val) = segment.split_once('=').unwrap_or((segment, ""));
            key.trim()
                .eq_ignore_ascii_case(param)
                .then(|| val.trim().trim_matches('"').to_string())
        })
}

/// URI part of a name-addr or addr-spec value
pub fn header_uri(value: &str) -> String {
    match (value.find('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim().to_string(),
        _ => value.split(';').next().unwrap_or_default().trim().to_string(),
    }
}

/// Name-based access to message headers, shared by requests and responses
pub trait SipHeaders {
    fn headers(&self) -> &Headers;
    fn headers_mut(&mut self) -> &mut Headers;

    /// Raw value of each header line with this name, in order
    fn header_values(&self, name: &str) -> Vec<String> {
        self.headers()
            .iter()
            .filter_map(header_name_value)
            .filter(|(n, _)| same_header_name(n, name))
            .map(|(_, v)| v)
            .collect()
    }

    /// Comma separated entries across every header line with this name
    fn header_entries(&self, name: &str) -> Vec<String> {
        self.header_values(name)
            .iter()
            .flat_map(|v| split_header_list(v))
            .collect()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.header_values(name).into_iter().next()
    }

    fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    fn push_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers_mut().push(make_header(name, value));
    }

    fn push_front_header(&mut self, name: &str, value: impl Into<String>) {
        let mut headers: Vec<Header> = vec![make_header(name, value)];
        headers.extend(self.headers().iter().cloned());
        *self.headers_mut() = Headers::from(headers);
    }

    fn remove_header(&mut self, name: &str) {
        let headers: Vec<Header> = self
            .headers()
            .iter()
            .filter(|h| {
                header_name_value(h)
                    .map(|(n, _)| !same_header_name(&n, name))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        *self.headers_mut() = Headers::from(headers);
    }

    /// Replace every header with this name by a single one, keeping the
    /// position of the first occurrence
    fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let mut replacement = Some(make_header(name, value));
        let mut headers = Vec::new();
        for header in self.headers().iter() {
            let matches = header_name_value(header)
                .map(|(n, _)| same_header_name(&n, name))
                .unwrap_or(false);
            if matches {
                if let Some(h) = replacement.take() {
                    headers.push(h);
                }
            } else {
                headers.push(header.clone());
            }
        }
        if let Some(h) = replacement {
            headers.push(h);
        }
        *self.headers_mut() = Headers::from(headers);
    }

    /// Remove the topmost entry of a list header, e.g. the top Via, whether
    /// it shares its line with other entries or not
    fn pop_first_entry(&mut self, name: &str) -> Option<String> {
        let mut popped = None;
        let mut headers = Vec::new();
        for header in self.headers().iter() {
            if popped.is_none() {
                if let Some((n, v)) = header_name_value(header) {
                    if same_header_name(&n, name) {
                        let mut entries = split_header_list(&v).into_iter();
                        popped = entries.next();
                        let rest: Vec<String> = entries.collect();
                        if !rest.is_empty() {
                            headers.push(make_header(&n, rest.join(", ")));
                        }
                        continue;
                    }
                }
            }
            headers.push(header.clone());
        }
        *self.headers_mut() = Headers::from(headers);
        popped
    }

    fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    fn from_tag(&self) -> Option<String> {
        self.header("From").and_then(|v| header_param(&v, "tag"))
    }

    fn to_tag(&self) -> Option<String> {
        self.header("To").and_then(|v| header_param(&v, "tag"))
    }

    fn cseq(&self) -> Option<u32> {
        self.header("CSeq")
            .and_then(|v| v.split_whitespace().next().and_then(|n| n.parse().ok()))
    }

    fn cseq_method(&self) -> Option<SipMethod> {
        self.header("CSeq")
            .and_then(|v| v.split_whitespace().nth(1).and_then(SipMethod::parse))
    }

    fn top_via(&self) -> Option<ViaHeader> {
        self.header_entries("Via")
            .first()
            .and_then(|v| ViaHeader::parse(v).ok())
    }

    fn vias(&self) -> Vec<ViaHeader> {
        self.header_entries("Via")
            .iter()
            .filter_map(|v| ViaHeader::parse(v).ok())
            .collect()
    }

    /// Whether an option-tag list header (Supported, Require, Allow...) holds `tag`
    fn has_option_tag(&self, header: &str, tag: &str) -> bool {
        self.header_entries(header)
            .iter()
            .any(|t| t.eq_ignore_ascii_case(tag))
    }

    fn contact_uri(&self) -> Option<String> {
        self.header_entries("Contact").first().map(|c| header_uri(c))
    }

    fn expires(&self) -> Option<u32> {
        self.header("Expires").and_then(|v| v.trim().parse().ok())
    }
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

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn uri_string(&self) -> String {
        self.inner.uri.to_string()
    }

    pub fn set_uri(&mut self, uri: &str) -> Result<(), SipError> {
        self.inner.uri = Uri::try_from(uri)?;
        Ok(())
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn set_body(&mut self, body: Vec<u8>, content_type: Option<&str>) {
        match content_type {
            Some(ct) if !body.is_empty() => self.set_header("Content-Type", ct),
            _ => self.remove_header("Content-Type"),
        }
        self.set_header("Content-Length", body.len().to_string());
        self.inner.body = body;
    }

    pub fn max_forwards(&self) -> Option<u32> {
        self.header("Max-Forwards").and_then(|v| v.trim().parse().ok())
    }

    pub fn routes(&self) -> Vec<String> {
        self.header_entries("Route")
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl SipHeaders for SipRequest {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.inner.headers
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.inner.method, self.inner.uri)
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

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn is_final(&self) -> bool {
        self.status_code() >= 200
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn set_body(&mut self, body: Vec<u8>, content_type: Option<&str>) {
        match content_type {
            Some(ct) if !body.is_empty() => self.set_header("Content-Type", ct),
            _ => self.remove_header("Content-Type"),
        }
        self.set_header("Content-Length", body.len().to_string());
        self.inner.body = body;
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl SipHeaders for SipResponse {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.inner.headers
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.status_code)
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        if data.starts_with(b"SIP/") {
            return SipResponse::parse(data).map(SipMessage::Response);
        }
        SipRequest::parse(data).map(SipMessage::Request)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

impl From<SipRequest> for SipMessage {
    fn from(request: SipRequest) -> Self {
        SipMessage::Request(request)
    }
}

impl From<SipResponse> for SipMessage {
    fn from(response: SipResponse) -> Self {
        SipMessage::Response(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &[u8] = b"REGISTER sip:registrar.example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Contact: <sip:alice@192.168.1.100:5060>\r\n\
                     Expires: 3600\r\n\
                     Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_register_request() {
        let msg = SipMessage::parse(REGISTER).unwrap();
        assert!(msg.is_request());

        let req = msg.as_request().unwrap();
        assert_eq!(req.method(), Some(SipMethod::Register));
        assert_eq!(req.call_id(), Some("a84b4c76e66710@pc33.example.com".to_string()));
        assert_eq!(req.cseq(), Some(314159));
        assert_eq!(req.cseq_method(), Some(SipMethod::Register));
        assert_eq!(req.from_tag(), Some("1928301774".to_string()));
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.expires(), Some(3600));
        assert_eq!(req.contact_uri(), Some("sip:alice@192.168.1.100:5060".to_string()));
        assert_eq!(req.top_via().unwrap().branch(), Some("z9hG4bK776asdhds"));
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 200 OK\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>;tag=a6c85cf\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Contact: <sip:alice@192.168.1.100:5060>\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_response());

        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 200);
        assert!(resp.is_success());
        assert_eq!(resp.to_tag(), Some("a6c85cf".to_string()));
    }

    #[test]
    fn test_split_header_list_respects_quotes_and_brackets() {
        let entries = split_header_list("\"Doe, John\" <sip:a@x;lr>, <sip:b@y,z>;q=0.5, sip:c@z");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], "\"Doe, John\" <sip:a@x;lr>");
        assert_eq!(entries[1], "<sip:b@y,z>;q=0.5");
    }

    #[test]
    fn test_header_param_and_uri() {
        let value = "\"Bob\" <sip:bob@biloxi.com;transport=tcp>;tag=a6c85cf;expires=60";
        assert_eq!(header_param(value, "tag"), Some("a6c85cf".to_string()));
        assert_eq!(header_param(value, "transport"), None);
        assert_eq!(header_uri(value), "sip:bob@biloxi.com;transport=tcp");

        let bare = "sip:bob@biloxi.com;tag=1";
        assert_eq!(header_param(bare, "tag"), Some("1".to_string()));
        assert_eq!(header_uri(bare), "sip:bob@biloxi.com");
    }

    #[test]
    fn test_pop_first_entry_on_shared_line() {
        let mut req = SipRequest::parse(REGISTER).unwrap();
        req.set_header(
            "Via",
            "SIP/2.0/UDP proxy.example.com;branch=z9hG4bKa, SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKb",
        );
        let popped = req.pop_first_entry("Via").unwrap();
        assert!(popped.contains("proxy.example.com"));
        assert_eq!(req.header_entries("Via").len(), 1);
        assert_eq!(req.top_via().unwrap().branch(), Some("z9hG4bKb"));
    }

    #[test]
    fn test_set_and_remove_header() {
        let mut req = SipRequest::parse(REGISTER).unwrap();
        req.set_header("Max-Forwards", "69");
        assert_eq!(req.max_forwards(), Some(69));
        req.set_header("Max-Forwards", "68");
        assert_eq!(req.header_values("Max-Forwards").len(), 1);
        req.remove_header("Max-Forwards");
        assert_eq!(req.max_forwards(), None);

        req.push_header("Supported", "timer, 100rel");
        assert!(req.has_option_tag("Supported", "100rel"));
        assert!(!req.has_option_tag("Require", "100rel"));
    }
}
