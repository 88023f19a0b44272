//! SIP message handlers for requests addressed to the server itself

use super::builder::ResponseBuilder;
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use async_trait::async_trait;
use tracing::debug;

/// Trait for handling SIP requests
#[async_trait]
pub trait SipHandler: Send + Sync {
    /// Handle a SIP request
    async fn handle_request(&self, request: SipRequest) -> Result<SipResponse, SipError>;

    /// Check if this handler can handle the given method
    fn can_handle(&self, method: SipMethod) -> bool;
}

/// Methods the server accepts when addressed directly
pub const SERVER_ALLOW: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, REGISTER";

/// OPTIONS handler - capability query
pub struct OptionsHandler;

#[async_trait]
impl SipHandler for OptionsHandler {
    async fn handle_request(&self, request: SipRequest) -> Result<SipResponse, SipError> {
        debug!("Handling OPTIONS request");
        ResponseBuilder::ok()
            .with("Allow", SERVER_ALLOW)
            .with("Accept", "application/sdp")
            .build_for_request(&request)
    }

    fn can_handle(&self, method: SipMethod) -> bool {
        matches!(method, SipMethod::Options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipHeaders;

    #[tokio::test]
    async fn test_options_lists_allowed_methods() {
        let data = b"OPTIONS sip:example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKopt\r\n\
                     From: <sip:alice@example.com>;tag=o1\r\n\
                     To: <sip:example.com>\r\n\
                     Call-ID: opt-1\r\n\
                     CSeq: 1 OPTIONS\r\n\
                     Content-Length: 0\r\n\r\n";
        let request = SipRequest::parse(data).unwrap();
        let handler = OptionsHandler;
        assert!(handler.can_handle(SipMethod::Options));
        assert!(!handler.can_handle(SipMethod::Register));

        let response = tokio_test::assert_ok!(handler.handle_request(request).await);
        assert_eq!(response.status_code(), 200);
        assert!(response.has_option_tag("Allow", "REGISTER"));
    }
}
