//! INVITE dialogs (RFC 3261 Section 12-14)
//!
//! A [`Dialog`] is driven by the transactions it owns and by the in-dialog
//! messages the [`DialogLayer`] routes to it. Everything it wants the
//! application to know is sent on its [`DialogEvent`] channel.

pub mod invite_dialog;
pub mod registry;
pub mod reliable;
pub mod session_timer;

pub use invite_dialog::Dialog;
pub use registry::{DialogLayer, Delivery};
pub use session_timer::{NegotiatedSession, Refresher, SessionExpires};

use std::fmt;

use super::message::{SipHeaders, SipMethod, SipRequest, SipResponse};
use super::transport::TransportProtocol;

/// Dialog State
///
/// Declaration order is significant: `early` and `confirmed` are derived
/// from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DialogState {
    /// Created, nothing sent or received
    Init,
    /// UAS waiting for its INVITE
    Waiting,
    /// INVITE sent
    Inviting,
    /// INVITE received
    Invited,
    /// Final failure sent or received for the initial INVITE
    Refused,
    /// 2xx sent or received, ACK pending
    Accepted,
    /// Session established
    Call,
    /// re-INVITE sent
    ReInviting,
    /// re-INVITE received
    ReInvited,
    /// re-INVITE failed, back to the call
    ReRefused,
    /// 2xx to a re-INVITE, ACK pending
    ReAccepted,
    /// BYE sent
    Byeing,
    /// BYE received
    Byed,
    Close,
}

impl DialogState {
    pub fn is_early(&self) -> bool {
        *self < DialogState::Accepted
    }

    pub fn is_confirmed(&self) -> bool {
        *self >= DialogState::Accepted && *self < DialogState::Close
    }

    pub fn is_closed(&self) -> bool {
        *self == DialogState::Close
    }

    pub fn name(&self) -> &'static str {
        match self {
            DialogState::Init => "Init",
            DialogState::Waiting => "Waiting",
            DialogState::Inviting => "Inviting",
            DialogState::Invited => "Invited",
            DialogState::Refused => "Refused",
            DialogState::Accepted => "Accepted",
            DialogState::Call => "Call",
            DialogState::ReInviting => "ReInviting",
            DialogState::ReInvited => "ReInvited",
            DialogState::ReRefused => "ReRefused",
            DialogState::ReAccepted => "ReAccepted",
            DialogState::Byeing => "Byeing",
            DialogState::Byed => "Byed",
            DialogState::Close => "Close",
        }
    }
}

/// Which side created the dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogRole {
    Uac,
    Uas,
}

/// Dialog identifier. The remote tag is unknown until the first
/// response (UAC) and the key is swapped once it is learned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
}

impl DialogId {
    pub fn new(call_id: impl Into<String>, local_tag: impl Into<String>, remote_tag: Option<String>) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag,
        }
    }

    pub fn is_stable(&self) -> bool {
        self.remote_tag.is_some()
    }

    /// Provisional form of this id, as registered before the remote tag
    pub fn provisional(&self) -> Self {
        Self {
            remote_tag: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.call_id,
            self.local_tag,
            self.remote_tag.as_deref().unwrap_or("-")
        )
    }
}

/// Message body with its content type, typically SDP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Body {
    pub fn new(content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn sdp(data: impl Into<Vec<u8>>) -> Self {
        Self::new("application/sdp", data)
    }

    pub(crate) fn of_request(request: &SipRequest) -> Option<Self> {
        if request.body().is_empty() {
            return None;
        }
        let content_type = request
            .header("Content-Type")
            .unwrap_or_else(|| "application/sdp".to_string());
        Some(Self::new(content_type, request.body().to_vec()))
    }
}

/// Where the offer travels for an INVITE exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfferMode {
    /// Offer in the INVITE, answer in the 2xx
    #[default]
    OfferInInvite,
    /// Offer in the 2xx, answer in the ACK
    OfferIn2xx,
}

/// Why a dialog closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `terminate()` called
    Terminated,
    /// BYE sent and answered (or timed out)
    LocalBye,
    /// BYE received
    RemoteBye,
    /// Initial INVITE refused with this status
    Refused(u16),
    /// Initial INVITE cancelled (either side)
    Cancelled,
    /// A client transaction timed out
    Timeout,
    TransportError(String),
    /// No ACK for our 2xx
    AckTimeout,
    /// No PRACK for a reliable provisional response
    PrackTimeout,
    /// Session timer ran out without refresh
    SessionExpired,
}

/// Events reported by a dialog
#[derive(Debug, Clone)]
pub enum DialogEvent {
    /// Initial INVITE received; answer with `respond_to_invite`
    Invited(SipRequest),
    /// Provisional response to our INVITE (duplicates of reliable ones
    /// are filtered)
    Provisional(SipResponse),
    /// 2xx to our INVITE. In offer-in-2xx mode the application must call
    /// `ack_with_answer`.
    Accepted(SipResponse),
    /// Initial INVITE refused
    Refused(SipResponse),
    /// Dialog entered CALL
    Established,
    /// re-INVITE received; answer with `respond_to_invite`
    ReInvited(SipRequest),
    ReInviteAccepted(SipResponse),
    ReInviteRefused(SipResponse),
    /// UPDATE received and answered
    Updated(SipRequest),
    /// INFO received and answered
    Info(SipRequest),
    /// Final response to an UPDATE, INFO or extended request we sent
    Response(SipMethod, SipResponse),
    /// In-dialog request handled by the application through `reply`
    ExtendedRequest(SipRequest),
    /// Session timer negotiated or refreshed, interval in seconds
    SessionRefreshed(u32),
    /// Initial INVITE cancelled by the peer
    Cancelled,
    Closed(CloseReason),
}

/// Credentials used to answer a 401/407 once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Optional behaviours selected when a dialog is created
#[derive(Debug, Clone, Default)]
pub struct DialogCapabilities {
    /// Surface REFER, NOTIFY, MESSAGE, OPTIONS, SUBSCRIBE as
    /// [`DialogEvent::ExtendedRequest`] instead of answering 501
    pub extended_methods: bool,
    /// Retry a challenged request once with these credentials
    pub reauth: Option<Credentials>,
}

/// Local endpoint and negotiation settings shared by every dialog
#[derive(Debug, Clone)]
pub struct DialogConfig {
    pub via_host: String,
    pub via_port: u16,
    pub transport: TransportProtocol,
    pub session_timer: bool,
    /// Preferred session interval in seconds
    pub session_interval: u32,
    /// Smallest session interval accepted
    pub min_se: u32,
    pub support_100rel: bool,
    pub require_100rel: bool,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            via_host: "127.0.0.1".to_string(),
            via_port: 5060,
            transport: TransportProtocol::Udp,
            session_timer: true,
            session_interval: 1800,
            min_se: 90,
            support_100rel: true,
            require_100rel: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(DialogState::Init.is_early());
        assert!(DialogState::Invited.is_early());
        assert!(DialogState::Refused.is_early());
        assert!(!DialogState::Accepted.is_early());
        assert!(DialogState::Accepted.is_confirmed());
        assert!(DialogState::ReInvited.is_confirmed());
        assert!(DialogState::Byed.is_confirmed());
        assert!(!DialogState::Close.is_confirmed());
        assert!(!DialogState::Inviting.is_confirmed());
    }

    #[test]
    fn test_dialog_id_provisional() {
        let id = DialogId::new("c1", "l1", Some("r1".to_string()));
        assert!(id.is_stable());
        assert_eq!(id.provisional(), DialogId::new("c1", "l1", None));
        assert_eq!(id.to_string(), "c1/l1/r1");
    }
}
