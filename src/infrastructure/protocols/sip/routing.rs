//! Request validation, classification and forwarding mutations
//! (RFC 3261 Section 16.3 - 16.7, RFC 3581)

use tracing::{debug, warn};

use super::builder::DEFAULT_MAX_FORWARDS;
use super::message::{header_uri, SipError, SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
use super::transport::{request_target, response_target, IncomingMessage, SipTarget, TransportProtocol};
use super::via::{branch_with_loop_tag, generate_branch, loop_tag, ViaHeader};
use crate::domain::location::LocationStore;
use crate::domain::shared::SipUri;

/// This node, as seen by the routing engine
#[derive(Debug, Clone)]
pub struct ServerProfile {
    /// Address put in Via and Record-Route
    pub host: String,
    pub port: u16,
    /// Domains served besides `host`
    pub domains: Vec<String>,
    pub transport: TransportProtocol,
    pub record_route: bool,
    pub loose_route: bool,
    pub loop_detection: bool,
    pub max_forwards: u32,
    pub outbound_proxy: Option<SipUri>,
}

impl Default for ServerProfile {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5060,
            domains: Vec::new(),
            transport: TransportProtocol::Udp,
            record_route: false,
            loose_route: true,
            loop_detection: true,
            max_forwards: DEFAULT_MAX_FORWARDS,
            outbound_proxy: None,
        }
    }
}

impl ServerProfile {
    /// Whether a URI designates this node: its own address, or one of the
    /// served domains on any port
    pub fn is_local(&self, uri: &SipUri) -> bool {
        uri.points_to(&self.host, self.port)
            || self
                .domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(uri.host()))
    }

    /// The URI of this node itself (never a served domain)
    pub fn is_self(&self, uri: &SipUri) -> bool {
        uri.points_to(&self.host, self.port)
    }

    pub fn uri(&self) -> String {
        format!("sip:{}:{}", self.host, self.port)
    }

    fn record_route_value(&self) -> String {
        if self.loose_route {
            format!("<{};lr>", self.uri())
        } else {
            format!("<{}>", self.uri())
        }
    }
}

/// Who a request is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// This server itself (REGISTER, OPTIONS...)
    LocalServer,
    /// A known user of a served domain
    LocalUser(String),
    /// A user part in a served domain that the location store does not know
    UnknownLocalUser(String),
    RemoteUa,
}

/// Record the packet source in the top Via of a request (received/rport)
pub fn stamp_source(incoming: &mut IncomingMessage) {
    let source = incoming.source;
    let SipMessage::Request(request) = &mut incoming.message else {
        return;
    };
    let Some(mut via) = request.top_via() else {
        return;
    };
    via.stamp_source(source);
    request.pop_first_entry("Via");
    request.push_front_header("Via", via.to_string());
}

/// Checks run before anything else. `Err` carries the status code of the
/// rejection.
pub fn validate_request(request: &SipRequest, profile: &ServerProfile) -> Result<(), u16> {
    if request.max_forwards() == Some(0) {
        warn!("Max-Forwards exhausted for {}", request.uri_string());
        return Err(483);
    }

    if profile.loop_detection {
        let tag = request_loop_tag(request);
        let looped = request
            .vias()
            .iter()
            .filter(|via| via.is_from(&profile.host, profile.port))
            .any(|via| via.branch().map(|b| b.ends_with(&tag)).unwrap_or(false));
        if looped {
            warn!("Loop detected for {}", request.uri_string());
            return Err(482);
        }
    }
    Ok(())
}

fn request_loop_tag(request: &SipRequest) -> String {
    loop_tag(
        &request.uri_string(),
        &request.from_tag().unwrap_or_default(),
        &request.call_id().unwrap_or_default(),
        request.cseq().unwrap_or_default(),
    )
}

/// RFC 2543 strict routing towards us: the request-URI is our own URI and
/// the real target is the last Route entry
pub fn rewrite_strict_route(request: &mut SipRequest, profile: &ServerProfile) -> Result<(), SipError> {
    let uri = SipUri::parse(&request.uri_string())?;
    if !profile.is_self(&uri) {
        return Ok(());
    }
    let mut routes = request.routes();
    let Some(last) = routes.pop() else {
        return Ok(());
    };
    debug!("Strict route: request-URI becomes {}", header_uri(&last));
    request.set_uri(&header_uri(&last))?;
    request.remove_header("Route");
    for route in routes {
        request.push_header("Route", route);
    }
    Ok(())
}

pub async fn classify(
    request: &SipRequest,
    profile: &ServerProfile,
    location: &dyn LocationStore,
) -> Result<Destination, SipError> {
    let uri = SipUri::parse(&request.uri_string())?;
    if !profile.is_local(&uri) {
        return Ok(Destination::RemoteUa);
    }
    let Some(user) = uri.user() else {
        return Ok(Destination::LocalServer);
    };
    if location.has_user(user).await? {
        Ok(Destination::LocalUser(user.to_string()))
    } else {
        Ok(Destination::UnknownLocalUser(user.to_string()))
    }
}

/// Prepare a copy of an incoming request for one outgoing hop and return
/// where it goes. `target` replaces the request-URI when given.
pub fn update_proxying_request(
    request: &mut SipRequest,
    profile: &ServerProfile,
    target: Option<&str>,
) -> Result<SipTarget, SipError> {
    // Computed on the request as received so that it matches if it comes back
    let tag = request_loop_tag(request);

    if let Some(target) = target {
        request.set_uri(target)?;
    }

    if let Some(top) = request.routes().first() {
        if SipUri::parse(top).map(|uri| profile.is_self(&uri)).unwrap_or(false) {
            request.pop_first_entry("Route");
        }
    }

    if profile.record_route && request.method() == Some(SipMethod::Invite) {
        request.push_front_header("Record-Route", profile.record_route_value());
    }

    let max_forwards = request
        .max_forwards()
        .map(|mf| mf.saturating_sub(1))
        .unwrap_or(profile.max_forwards);
    request.set_header("Max-Forwards", max_forwards.to_string());

    let destination = request_target(request, None, profile.outbound_proxy.as_ref(), profile.transport)?;

    let branch = if profile.loop_detection {
        branch_with_loop_tag(&tag)
    } else {
        generate_branch()
    };
    let via = ViaHeader::new(destination.protocol, &profile.host, profile.port, &branch);
    request.push_front_header("Via", via.to_string());

    debug!("Forwarding {} to {}", request.uri_string(), destination);
    Ok(destination)
}

/// Remove exactly the top Via of a response being relayed
pub fn strip_top_via(response: &mut SipResponse) -> Option<String> {
    response.pop_first_entry("Via")
}

/// Prepare a response for stateless forwarding and return where it goes
pub fn update_proxying_response(response: &mut SipResponse) -> Result<SipTarget, SipError> {
    strip_top_via(response);
    if response.top_via().is_none() {
        return Err(SipError::InvalidMessage("response has no Via left".to_string()));
    }
    response_target(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::location::repository::MockLocationStore;

    fn profile() -> ServerProfile {
        ServerProfile {
            host: "10.0.0.10".to_string(),
            port: 5060,
            domains: vec!["example.com".to_string()],
            record_route: true,
            ..ServerProfile::default()
        }
    }

    fn request(uri: &str, extra: &str) -> SipRequest {
        let data = format!(
            "INVITE {} SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKa1\r\n\
             From: <sip:alice@example.com>;tag=a1\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: route-1\r\n\
             CSeq: 1 INVITE\r\n\
             {}\
             Content-Length: 0\r\n\r\n",
            uri, extra
        );
        SipRequest::parse(data.as_bytes()).unwrap()
    }

    #[test]
    fn test_max_forwards_zero_rejected() {
        let req = request("sip:bob@example.com", "Max-Forwards: 0\r\n");
        assert_eq!(validate_request(&req, &profile()), Err(483));
        let req = request("sip:bob@example.com", "Max-Forwards: 1\r\n");
        assert_eq!(validate_request(&req, &profile()), Ok(()));
    }

    #[test]
    fn test_forwarded_request_coming_back_is_a_loop() {
        let mut req = request("sip:bob@example.com", "Max-Forwards: 70\r\n");
        let original = req.clone();
        update_proxying_request(&mut req, &profile(), None).unwrap();
        assert_eq!(validate_request(&req, &profile()), Err(482));

        // Same request with another request-URI is a spiral, not a loop
        let mut spiral = original;
        update_proxying_request(&mut spiral, &profile(), Some("sip:bob@10.0.0.20")).unwrap();
        assert_eq!(validate_request(&spiral, &profile()), Ok(()));
    }

    #[test]
    fn test_update_proxying_request() {
        let mut req = request(
            "sip:bob@example.com",
            "Max-Forwards: 70\r\nRoute: <sip:10.0.0.10:5060;lr>, <sip:edge.example.net;lr>\r\n",
        );
        let target = update_proxying_request(&mut req, &profile(), None).unwrap();

        assert_eq!(req.max_forwards(), Some(69));
        assert_eq!(req.routes(), vec!["<sip:edge.example.net;lr>".to_string()]);
        assert_eq!(target.host, "edge.example.net");
        assert_eq!(req.vias().len(), 2);
        assert!(req.vias()[0].is_from("10.0.0.10", 5060));
        assert_eq!(req.header("Record-Route"), Some("<sip:10.0.0.10:5060;lr>".to_string()));
    }

    #[test]
    fn test_missing_max_forwards_gets_default() {
        let mut req = request("sip:bob@example.com", "");
        update_proxying_request(&mut req, &profile(), Some("sip:bob@10.0.0.20:5062")).unwrap();
        assert_eq!(req.max_forwards(), Some(70));
        assert_eq!(req.uri_string(), "sip:bob@10.0.0.20:5062");
    }

    #[test]
    fn test_strict_route_rewrite() {
        let mut req = request(
            "sip:10.0.0.10:5060",
            "Route: <sip:p2.example.net>, <sip:bob@10.0.0.20>\r\n",
        );
        rewrite_strict_route(&mut req, &profile()).unwrap();
        assert_eq!(req.uri_string(), "sip:bob@10.0.0.20");
        assert_eq!(req.routes(), vec!["<sip:p2.example.net>".to_string()]);
    }

    #[tokio::test]
    async fn test_classify() {
        let mut store = MockLocationStore::new();
        store
            .expect_has_user()
            .returning(|user| Ok(user == "bob"));

        let p = profile();
        let req = request("sip:example.com", "");
        assert_eq!(classify(&req, &p, &store).await.unwrap(), Destination::LocalServer);
        let req = request("sip:bob@example.com", "");
        assert_eq!(
            classify(&req, &p, &store).await.unwrap(),
            Destination::LocalUser("bob".to_string())
        );
        let req = request("sip:carol@example.com", "");
        assert_eq!(
            classify(&req, &p, &store).await.unwrap(),
            Destination::UnknownLocalUser("carol".to_string())
        );
        let req = request("sip:dave@elsewhere.org", "");
        assert_eq!(classify(&req, &p, &store).await.unwrap(), Destination::RemoteUa);
    }

    #[test]
    fn test_response_loses_exactly_one_via() {
        let mut req = request("sip:bob@example.com", "Max-Forwards: 70\r\n");
        update_proxying_request(&mut req, &profile(), None).unwrap();
        let mut response = crate::infrastructure::protocols::sip::builder::ResponseBuilder::new(180)
            .to_tag("b1")
            .build_for_request(&req)
            .unwrap();
        assert_eq!(response.vias().len(), 2);

        let target = update_proxying_response(&mut response).unwrap();
        assert_eq!(response.vias().len(), 1);
        assert_eq!(target.host, "10.0.0.1");
        assert!(update_proxying_response(&mut response).is_err());
    }
}
