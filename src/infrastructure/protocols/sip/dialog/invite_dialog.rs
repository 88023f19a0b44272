//! INVITE dialog state machine
//!
//! All state lives behind one lock per dialog. Transaction events arrive
//! through a watcher task per owned transaction, timers through the dialog
//! layer's timer task, and in-dialog requests through
//! [`DialogLayer::handle_incoming`].

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::DialogLayer;
use super::reliable::{self, reliable_rseq, RAck, ReliableReceiver, ReliableSender, RACK};
use super::session_timer::{self, NegotiatedSession, Refresher, SessionExpires, MIN_SE, SESSION_EXPIRES};
use super::{
    Body, CloseReason, DialogCapabilities, DialogConfig, DialogEvent, DialogId, DialogRole, DialogState,
    OfferMode,
};
use crate::infrastructure::protocols::sip::auth::{AuthChallenge, AuthRole};
use crate::infrastructure::protocols::sip::builder::{build_cancel, RequestBuilder, ResponseBuilder};
use crate::infrastructure::protocols::sip::message::{
    header_param, header_uri, SipError, SipHeaders, SipMethod, SipRequest, SipResponse,
};
use crate::infrastructure::protocols::sip::timer::{TimerArena, TimerId};
use crate::infrastructure::protocols::sip::transaction::{TransactionEvent, TransactionKey, TransactionRole};
use crate::infrastructure::protocols::sip::transaction_layer::{TransactionHandle, TransactionLayer};
use crate::infrastructure::protocols::sip::transport::{request_target, IncomingMessage, OutgoingMessage, SipTarget};
use crate::infrastructure::protocols::sip::via::{generate_branch, generate_tag, ViaHeader};

const ALLOW: &str = "INVITE, ACK, CANCEL, BYE, UPDATE, INFO, PRACK";
const ALLOW_EXTENDED: &str =
    "INVITE, ACK, CANCEL, BYE, UPDATE, INFO, PRACK, REFER, NOTIFY, MESSAGE, OPTIONS, SUBSCRIBE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DialogTimerKind {
    ReliableRetransmit,
    ReliableTimeout,
    SessionRefresh,
    SessionExpiry,
}

/// Timer payload stored in the dialog layer's arena
pub(crate) struct DialogTimer {
    pub(crate) dialog: Weak<DialogShared>,
    pub(crate) kind: DialogTimerKind,
}

#[derive(Default)]
struct DialogTimers {
    reliable_retransmit: Option<TimerId>,
    reliable_timeout: Option<TimerId>,
    session: Option<TimerId>,
}

struct DialogInner {
    id: DialogId,
    role: DialogRole,
    state: DialogState,
    /// Our From (UAC) or To (UAS) header value, with our tag
    local_party: String,
    /// The peer's header value, with its tag once known
    remote_party: String,
    local_contact: String,
    remote_target: Option<String>,
    route_set: Vec<String>,
    secure: bool,
    local_cseq: u32,
    remote_cseq: Option<u32>,
    offer_mode: OfferMode,
    /// INVITE of the current exchange, sent or received
    invite: Option<SipRequest>,
    invite_key: Option<TransactionKey>,
    invite_source: Option<SipTarget>,
    invite_proceeding: bool,
    cancelling: bool,
    refreshing: bool,
    /// 2xx received in offer-in-2xx mode, ACK waits for the answer
    ack_pending: bool,
    local_body: Option<Body>,
    last_ack: Option<(SipRequest, SipTarget)>,
    ack_wait: Option<TransactionKey>,
    owned: HashSet<TransactionKey>,
    session: Option<NegotiatedSession>,
    peer_allows_update: bool,
    reliable_required: bool,
    reliable_out: ReliableSender,
    reliable_in: ReliableReceiver,
    timers: DialogTimers,
}

impl DialogInner {
    fn set_state(&mut self, state: DialogState) {
        if self.state != state {
            debug!("Dialog {}: {} -> {}", self.id, self.state.name(), state.name());
            self.state = state;
        }
    }

    /// Request-URI and Route set of the next in-dialog request
    /// (RFC 3261 Section 12.2.1.1)
    fn next_hop(&self) -> Result<(String, Vec<String>), SipError> {
        let remote_target = self
            .remote_target
            .clone()
            .ok_or_else(|| SipError::InvalidState(format!("dialog {} has no remote target", self.id)))?;

        match self.route_set.first() {
            None => Ok((remote_target, Vec::new())),
            Some(first) if header_uri(first).contains(";lr") => Ok((remote_target, self.route_set.clone())),
            Some(first) => {
                let mut routes: Vec<String> = self.route_set[1..].to_vec();
                routes.push(format!("<{}>", remote_target));
                Ok((header_uri(first), routes))
            }
        }
    }

    fn invite_cseq(&self) -> Option<u32> {
        self.invite.as_ref().and_then(|i| i.cseq())
    }
}

pub(crate) struct DialogShared {
    inner: Mutex<DialogInner>,
    transactions: Arc<TransactionLayer>,
    registry: Weak<DialogLayer>,
    timers: Arc<TimerArena<DialogTimer>>,
    events: mpsc::UnboundedSender<DialogEvent>,
    config: DialogConfig,
    capabilities: DialogCapabilities,
}

/// INVITE dialog handle. Clones share the same dialog.
#[derive(Clone)]
pub struct Dialog {
    shared: Arc<DialogShared>,
}

fn name_addr(value: &str) -> String {
    if value.contains('<') {
        value.to_string()
    } else {
        format!("<{}>", value)
    }
}

fn offer_mode_of(request: &SipRequest) -> OfferMode {
    if request.body().is_empty() {
        OfferMode::OfferIn2xx
    } else {
        OfferMode::OfferInInvite
    }
}

fn invalid_state(operation: &str, state: DialogState) -> SipError {
    SipError::InvalidState(format!("{} not allowed in state {}", operation, state.name()))
}

impl Dialog {
    pub(crate) fn new(
        registry: &Arc<DialogLayer>,
        role: DialogRole,
        capabilities: DialogCapabilities,
    ) -> (Self, mpsc::UnboundedReceiver<DialogEvent>) {
        let config = registry.config().clone();
        let (events, rx) = mpsc::unbounded_channel();
        let call_id = format!("{}@{}", Uuid::new_v4().simple(), config.via_host);

        let inner = DialogInner {
            id: DialogId::new(call_id, generate_tag(), None),
            role,
            state: DialogState::Init,
            local_party: String::new(),
            remote_party: String::new(),
            local_contact: format!("sip:{}:{}", config.via_host, config.via_port),
            remote_target: None,
            route_set: Vec::new(),
            secure: false,
            local_cseq: 0,
            remote_cseq: None,
            offer_mode: OfferMode::default(),
            invite: None,
            invite_key: None,
            invite_source: None,
            invite_proceeding: false,
            cancelling: false,
            refreshing: false,
            ack_pending: false,
            local_body: None,
            last_ack: None,
            ack_wait: None,
            owned: HashSet::new(),
            session: None,
            peer_allows_update: false,
            reliable_required: false,
            reliable_out: ReliableSender::new(),
            reliable_in: ReliableReceiver::default(),
            timers: DialogTimers::default(),
        };

        let dialog = Self {
            shared: Arc::new(DialogShared {
                inner: Mutex::new(inner),
                transactions: registry.transactions(),
                registry: Arc::downgrade(registry),
                timers: registry.timers(),
                events,
                config,
                capabilities,
            }),
        };
        (dialog, rx)
    }

    pub(crate) fn from_shared(shared: Arc<DialogShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn same(&self, other: &Dialog) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub async fn id(&self) -> DialogId {
        self.shared.inner.lock().await.id.clone()
    }

    pub async fn state(&self) -> DialogState {
        self.shared.inner.lock().await.state
    }

    pub async fn role(&self) -> DialogRole {
        self.shared.inner.lock().await.role
    }

    pub async fn local_cseq(&self) -> u32 {
        self.shared.inner.lock().await.local_cseq
    }

    pub async fn remote_cseq(&self) -> Option<u32> {
        self.shared.inner.lock().await.remote_cseq
    }

    pub async fn route_set(&self) -> Vec<String> {
        self.shared.inner.lock().await.route_set.clone()
    }

    pub async fn remote_target(&self) -> Option<String> {
        self.shared.inner.lock().await.remote_target.clone()
    }

    pub async fn is_secure(&self) -> bool {
        self.shared.inner.lock().await.secure
    }

    pub async fn session(&self) -> Option<NegotiatedSession> {
        self.shared.inner.lock().await.session
    }

    pub async fn offer_mode(&self) -> OfferMode {
        self.shared.inner.lock().await.offer_mode
    }

    // ----- outgoing INVITE -------------------------------------------------

    /// Send the initial INVITE. Without an offer the exchange runs in
    /// offer-in-2xx mode.
    pub async fn invite(&self, target: &str, from: &str, contact: &str, offer: Option<Body>) -> Result<(), SipError> {
        let request = {
            let inner = self.shared.inner.lock().await;
            if inner.state != DialogState::Init {
                return Err(invalid_state("INVITE", inner.state));
            }
            let config = &self.shared.config;
            let from = if header_param(from, "tag").is_some() {
                from.to_string()
            } else {
                format!("{};tag={}", name_addr(from), inner.id.local_tag)
            };
            let via = ViaHeader::new(config.transport, &config.via_host, config.via_port, &generate_branch());

            let mut builder = RequestBuilder::new(SipMethod::Invite, target)
                .via(via.to_string())
                .from(from)
                .to(name_addr(target))
                .call_id(inner.id.call_id.clone())
                .cseq(1)
                .contact(name_addr(contact))
                .with("Allow", self.allow());
            for (name, value) in self.extension_headers() {
                builder = builder.with(name, value);
            }
            // Supported already lists "timer"
            for (name, value) in session_timer::request_headers(config, None) {
                if name != "Supported" {
                    builder = builder.with(name, value);
                }
            }
            if let Some(offer) = offer {
                builder = builder.body(offer.data, &offer.content_type);
            }
            builder.build()?
        };
        self.invite_request(request).await
    }

    /// Send a fully built INVITE; the dialog adopts its identity
    pub async fn invite_request(&self, request: SipRequest) -> Result<(), SipError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != DialogState::Init {
            return Err(invalid_state("INVITE", inner.state));
        }
        if request.method() != Some(SipMethod::Invite) {
            return Err(SipError::InvalidMessage("not an INVITE".to_string()));
        }
        let call_id = request
            .call_id()
            .ok_or_else(|| SipError::InvalidMessage("INVITE without Call-ID".to_string()))?;
        let local_tag = request
            .from_tag()
            .ok_or_else(|| SipError::InvalidMessage("INVITE without From tag".to_string()))?;

        inner.id = DialogId::new(call_id, local_tag, None);
        inner.local_party = request.header("From").unwrap_or_default();
        inner.remote_party = request.header("To").unwrap_or_default();
        if let Some(contact) = request.contact_uri() {
            inner.local_contact = contact;
        }
        inner.local_cseq = request.cseq().unwrap_or(1);
        inner.remote_target = Some(request.uri_string());
        inner.route_set = request.routes();
        inner.secure = request.uri_string().starts_with("sips:");
        inner.offer_mode = offer_mode_of(&request);
        inner.local_body = Body::of_request(&request);

        if let Some(registry) = self.shared.registry.upgrade() {
            registry.register(inner.id.clone(), self.clone()).await;
        }
        inner.set_state(DialogState::Inviting);
        info!("Dialog {} inviting {}", inner.id, request.uri_string());
        self.send_invite(&mut inner, request).await
    }

    /// 2xx received in offer-in-2xx mode: send the ACK carrying the answer
    pub async fn ack_with_answer(&self, answer: Body) -> Result<(), SipError> {
        let mut inner = self.shared.inner.lock().await;
        if !inner.ack_pending {
            return Err(invalid_state("ACK with answer", inner.state));
        }
        self.send_ack(&mut inner, Some(&answer)).await?;
        inner.ack_pending = false;
        inner.local_body = Some(answer);
        self.enter_call(&mut inner);
        Ok(())
    }

    /// Cancel the initial INVITE. Without a provisional response the
    /// transaction is only aborted locally.
    pub async fn cancel(&self) -> Result<(), SipError> {
        let mut inner = self.shared.inner.lock().await;
        self.cancel_locked(&mut inner).await
    }

    async fn cancel_locked(&self, inner: &mut DialogInner) -> Result<(), SipError> {
        if inner.state != DialogState::Inviting {
            return Err(invalid_state("CANCEL", inner.state));
        }
        if inner.cancelling {
            return Ok(());
        }
        let invite = inner
            .invite
            .clone()
            .ok_or_else(|| SipError::InvalidState("no INVITE to cancel".to_string()))?;

        if inner.invite_proceeding {
            let cancel = build_cancel(&invite)?;
            inner.cancelling = true;
            info!("Dialog {} cancelling INVITE", inner.id);
            self.send_request(inner, cancel).await?;
        } else {
            if let Some(key) = inner.invite_key.take() {
                self.shared.transactions.terminate(&key).await;
                inner.owned.remove(&key);
            }
            info!("Dialog {} aborting INVITE before any provisional response", inner.id);
            self.close(inner, CloseReason::Cancelled).await;
        }
        Ok(())
    }

    // ----- incoming INVITE -------------------------------------------------

    /// Take an initial INVITE (UAS). Called by the dialog layer.
    pub(crate) async fn accept(&self, incoming: IncomingMessage) -> Result<(), SipError> {
        let request = incoming
            .message
            .as_request()
            .cloned()
            .ok_or_else(|| SipError::InvalidMessage("not a request".to_string()))?;
        let source = incoming.reply_target();

        let mut inner = self.shared.inner.lock().await;
        if inner.state != DialogState::Init {
            return Err(invalid_state("accept", inner.state));
        }
        inner.set_state(DialogState::Waiting);

        let handle = self
            .shared
            .transactions
            .start_server_transaction(request.clone(), source.clone())
            .await?
            .ok_or_else(|| SipError::TransactionError("INVITE already being handled".to_string()))?;
        inner.invite_key = Some(handle.key.clone());
        inner.owned.insert(handle.key.clone());
        self.watch(request.clone(), handle);

        let call_id = request
            .call_id()
            .ok_or_else(|| SipError::InvalidMessage("INVITE without Call-ID".to_string()))?;
        let local_tag = inner.id.local_tag.clone();
        inner.id = DialogId::new(call_id, local_tag.clone(), request.from_tag());
        inner.local_party = format!("{};tag={}", request.header("To").unwrap_or_default(), local_tag);
        inner.remote_party = request.header("From").unwrap_or_default();
        inner.remote_target = request.contact_uri();
        inner.route_set = request.header_entries("Record-Route");
        inner.remote_cseq = request.cseq();
        inner.secure = request.uri_string().starts_with("sips:");
        inner.offer_mode = offer_mode_of(&request);
        inner.peer_allows_update = request.has_option_tag("Allow", "UPDATE");
        inner.invite = Some(request.clone());
        inner.invite_source = Some(source);

        if request.from_tag().is_none() {
            return self.reject_invite(&mut inner, ResponseBuilder::new(400)).await;
        }
        let unsupported = self.unsupported_extensions(&request);
        if !unsupported.is_empty() {
            warn!("Dialog {} rejecting INVITE requiring {}", inner.id, unsupported.join(", "));
            let builder = ResponseBuilder::new(420).with("Unsupported", unsupported.join(", "));
            return self.reject_invite(&mut inner, builder).await;
        }
        if let Some(interval) = session_timer::interval_too_small(&request, &self.shared.config) {
            warn!("Dialog {} rejecting session interval {}", inner.id, interval);
            let builder = ResponseBuilder::new(422).with(MIN_SE, self.shared.config.min_se.to_string());
            return self.reject_invite(&mut inner, builder).await;
        }

        let config = &self.shared.config;
        inner.reliable_required = config.support_100rel
            && (request.has_option_tag("Require", reliable::OPTION_TAG)
                || (config.require_100rel && request.has_option_tag("Supported", reliable::OPTION_TAG)));

        if let Some(registry) = self.shared.registry.upgrade() {
            registry.register(inner.id.clone(), self.clone()).await;
        }
        inner.set_state(DialogState::Invited);
        info!("Dialog {} invited from {}", inner.id, inner.remote_party);
        self.emit(DialogEvent::Invited(request));
        Ok(())
    }

    /// Answer the pending INVITE or re-INVITE
    pub async fn respond_to_invite(&self, code: u16, contact: Option<&str>, body: Option<Body>) -> Result<(), SipError> {
        let mut inner = self.shared.inner.lock().await;
        if !matches!(inner.state, DialogState::Invited | DialogState::ReInvited) {
            return Err(invalid_state("INVITE response", inner.state));
        }
        if let Some(contact) = contact {
            inner.local_contact = header_uri(contact);
        }
        self.respond_invite_locked(&mut inner, code, body).await
    }

    async fn respond_invite_locked(&self, inner: &mut DialogInner, code: u16, body: Option<Body>) -> Result<(), SipError> {
        let invite = inner
            .invite
            .clone()
            .ok_or_else(|| SipError::InvalidState("no INVITE to answer".to_string()))?;
        let key = inner
            .invite_key
            .clone()
            .ok_or_else(|| SipError::InvalidState("INVITE already answered".to_string()))?;

        let mut builder = ResponseBuilder::new(code).to_tag(inner.id.local_tag.clone());
        if (101..300).contains(&code) {
            builder = builder.with("Contact", name_addr(&inner.local_contact));
        }
        if let Some(body) = &body {
            builder = builder.body(body.data.clone(), &body.content_type);
        }

        match code {
            100..=199 => {
                let response = builder.build_for_request(&invite)?;
                if code > 100 && inner.reliable_required {
                    let t1 = self.shared.transactions.sip_timers().t1;
                    if let Some(first) = inner.reliable_out.submit(response, t1) {
                        self.shared.transactions.respond(&key, first).await?;
                        self.arm_reliable(inner);
                    } else {
                        debug!("Dialog {} queued reliable {}", inner.id, code);
                    }
                    return Ok(());
                }
                self.shared.transactions.respond(&key, response).await
            }
            200..=299 => {
                builder = builder.with("Allow", self.allow());
                for (name, value) in self.extension_headers() {
                    if name == "Supported" {
                        builder = builder.with(name, value);
                    }
                }
                let negotiated = session_timer::answer(&invite, &self.shared.config);
                if let Some((_, headers)) = &negotiated {
                    for (name, value) in headers {
                        builder = builder.with(name, value.clone());
                    }
                }
                let response = builder.build_for_request(&invite)?;

                self.stop_reliable(inner);
                self.shared.transactions.respond(&key, response.clone()).await?;
                inner.owned.remove(&key);
                inner.invite_key = None;

                let source = inner
                    .invite_source
                    .clone()
                    .ok_or_else(|| SipError::InvalidState("INVITE source unknown".to_string()))?;
                let handle = self
                    .shared
                    .transactions
                    .start_ack_wait(invite.clone(), response, source)
                    .await?;
                inner.ack_wait = Some(handle.key.clone());
                inner.owned.insert(handle.key.clone());
                self.watch(invite, handle);

                if let Some(body) = body {
                    inner.local_body = Some(body);
                }
                if let Some((session, _)) = negotiated {
                    inner.session = Some(session);
                }
                let next = if inner.state == DialogState::Invited {
                    DialogState::Accepted
                } else {
                    DialogState::ReAccepted
                };
                inner.set_state(next);
                Ok(())
            }
            _ => self.reject_invite(inner, builder).await,
        }
    }

    /// Final failure on the pending INVITE. The server transaction keeps
    /// retransmitting it until the ACK.
    async fn reject_invite(&self, inner: &mut DialogInner, builder: ResponseBuilder) -> Result<(), SipError> {
        let invite = inner
            .invite
            .clone()
            .ok_or_else(|| SipError::InvalidState("no INVITE to answer".to_string()))?;
        let key = inner
            .invite_key
            .take()
            .ok_or_else(|| SipError::InvalidState("INVITE already answered".to_string()))?;

        let response = builder.to_tag(inner.id.local_tag.clone()).build_for_request(&invite)?;
        let code = response.status_code();
        self.stop_reliable(inner);
        self.shared.transactions.respond(&key, response).await?;

        if inner.state == DialogState::ReInvited {
            inner.set_state(DialogState::ReRefused);
            inner.set_state(DialogState::Call);
        } else {
            inner.set_state(DialogState::Refused);
            self.close(inner, CloseReason::Refused(code)).await;
        }
        Ok(())
    }

    // ----- in-dialog requests we send ---------------------------------------

    /// Hang up: BYE when confirmed, CANCEL while our INVITE is pending,
    /// 603 while the peer's INVITE is pending
    pub async fn bye(&self) -> Result<(), SipError> {
        let mut inner = self.shared.inner.lock().await;
        match inner.state {
            DialogState::Inviting => self.cancel_locked(&mut inner).await,
            DialogState::Invited => self.respond_invite_locked(&mut inner, 603, None).await,
            DialogState::Accepted
            | DialogState::Call
            | DialogState::ReInviting
            | DialogState::ReInvited
            | DialogState::ReRefused
            | DialogState::ReAccepted => {
                if inner.ack_pending {
                    self.send_ack(&mut inner, None).await?;
                    inner.ack_pending = false;
                }
                self.send_bye(&mut inner).await
            }
            state => Err(invalid_state("BYE", state)),
        }
    }

    pub async fn re_invite(&self, offer: Option<Body>) -> Result<(), SipError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != DialogState::Call {
            return Err(invalid_state("re-INVITE", inner.state));
        }
        let mut request = self.in_dialog_request(&mut inner, SipMethod::Invite, offer.as_ref())?;
        request.push_header("Allow", self.allow());
        for (name, value) in session_timer::request_headers(&self.shared.config, None) {
            request.push_header(name, value);
        }
        inner.offer_mode = if offer.is_some() {
            OfferMode::OfferInInvite
        } else {
            OfferMode::OfferIn2xx
        };
        if let Some(offer) = offer {
            inner.local_body = Some(offer);
        }
        inner.set_state(DialogState::ReInviting);
        self.send_invite(&mut inner, request).await
    }

    pub async fn update(&self, body: Option<Body>) -> Result<(), SipError> {
        let mut inner = self.shared.inner.lock().await;
        let allowed = inner.id.is_stable()
            && !matches!(
                inner.state,
                DialogState::Init | DialogState::Waiting | DialogState::Byeing | DialogState::Byed | DialogState::Close
            );
        if !allowed {
            return Err(invalid_state("UPDATE", inner.state));
        }
        let request = self.in_dialog_request(&mut inner, SipMethod::Update, body.as_ref())?;
        if let Some(body) = body {
            inner.local_body = Some(body);
        }
        self.send_request(&mut inner, request).await.map(|_| ())
    }

    pub async fn info(&self, body: Body) -> Result<(), SipError> {
        self.request(SipMethod::Info, Some(body)).await
    }

    /// Any other in-dialog request (INFO, REFER, NOTIFY, MESSAGE...)
    pub async fn request(&self, method: SipMethod, body: Option<Body>) -> Result<(), SipError> {
        if matches!(
            method,
            SipMethod::Invite | SipMethod::Ack | SipMethod::Cancel | SipMethod::Bye | SipMethod::Prack | SipMethod::Update
        ) {
            return Err(SipError::InvalidMessage(format!("{} has its own operation", method)));
        }
        let mut inner = self.shared.inner.lock().await;
        if !inner.state.is_confirmed() {
            return Err(invalid_state(method.as_str(), inner.state));
        }
        let request = self.in_dialog_request(&mut inner, method, body.as_ref())?;
        self.send_request(&mut inner, request).await.map(|_| ())
    }

    /// Answer an in-dialog request surfaced as an event
    pub async fn reply(&self, request: &SipRequest, code: u16, body: Option<Body>) -> Result<(), SipError> {
        let key = TransactionKey::from_request(request, TransactionRole::Server)?;
        let mut builder = ResponseBuilder::new(code);
        if let Some(body) = body {
            builder = builder.body(body.data, &body.content_type);
        }
        let response = builder.build_for_request(request)?;
        self.shared.transactions.respond(&key, response).await
    }

    /// Close now. Every owned transaction is aborted without wire
    /// traffic. Calling it again has no effect.
    pub async fn terminate(&self) {
        let mut inner = self.shared.inner.lock().await;
        if inner.state.is_closed() {
            return;
        }
        let owned: Vec<TransactionKey> = inner.owned.drain().collect();
        for key in &owned {
            self.shared.transactions.terminate(key).await;
        }
        inner.invite_key = None;
        inner.ack_wait = None;
        self.close(&mut inner, CloseReason::Terminated).await;
    }

    // ----- messages routed by the dialog layer ------------------------------

    pub(crate) async fn on_request(&self, incoming: IncomingMessage) {
        let Some(request) = incoming.message.as_request().cloned() else {
            return;
        };
        let Some(method) = request.method() else {
            return;
        };
        let source = incoming.reply_target();

        let mut inner = self.shared.inner.lock().await;
        if inner.state.is_closed() {
            debug!("Dialog {} closed, dropping {}", inner.id, method);
            return;
        }
        let result = match method {
            SipMethod::Ack => self.on_ack(&mut inner, &request).await,
            SipMethod::Cancel => Ok(()),
            _ => self.on_in_dialog_request(&mut inner, method, request, source).await,
        };
        if let Err(e) = result {
            warn!("Dialog {} failed to handle {}: {}", inner.id, method, e);
        }
    }

    /// Response no transaction claimed: a retransmitted 2xx gets our ACK again
    pub(crate) async fn on_response(&self, response: &SipResponse) {
        let inner = self.shared.inner.lock().await;
        if !response.is_success() || response.cseq_method() != Some(SipMethod::Invite) {
            return;
        }
        if let Some((ack, target)) = &inner.last_ack {
            if ack.cseq() == response.cseq() {
                debug!("Dialog {} re-sending ACK", inner.id);
                let outgoing = OutgoingMessage {
                    message: ack.clone().into(),
                    target: target.clone(),
                };
                if let Err(e) = self.shared.transactions.transport().send(outgoing).await {
                    warn!("Dialog {} could not re-send ACK: {}", inner.id, e);
                }
            }
        }
    }

    async fn on_in_dialog_request(
        &self,
        inner: &mut DialogInner,
        method: SipMethod,
        request: SipRequest,
        source: SipTarget,
    ) -> Result<(), SipError> {
        let cseq = request
            .cseq()
            .ok_or_else(|| SipError::InvalidMessage("request without CSeq".to_string()))?;
        let Some(handle) = self
            .shared
            .transactions
            .start_server_transaction(request.clone(), source.clone())
            .await?
        else {
            return Ok(());
        };

        if let Some(last) = inner.remote_cseq {
            if cseq <= last {
                warn!(
                    "Dialog {} rejecting {} with CSeq {} (last seen {})",
                    inner.id, method, cseq, last
                );
                return self.answer(&handle.key, &request, ResponseBuilder::new(500)).await;
            }
        }
        inner.remote_cseq = Some(cseq);

        match method {
            SipMethod::Invite => self.on_reinvite(inner, request, source, handle).await,
            SipMethod::Bye => self.on_bye(inner, &request, &handle.key).await,
            SipMethod::Update => self.on_update(inner, &request, &handle.key).await,
            SipMethod::Prack => self.on_prack(inner, &request, &handle.key).await,
            SipMethod::Info => {
                self.answer(&handle.key, &request, ResponseBuilder::ok()).await?;
                self.emit(DialogEvent::Info(request));
                Ok(())
            }
            _ if self.shared.capabilities.extended_methods => {
                self.emit(DialogEvent::ExtendedRequest(request));
                Ok(())
            }
            _ => self.answer(&handle.key, &request, ResponseBuilder::new(501)).await,
        }
    }

    async fn on_ack(&self, inner: &mut DialogInner, ack: &SipRequest) -> Result<(), SipError> {
        if !matches!(inner.state, DialogState::Accepted | DialogState::ReAccepted) || inner.ack_wait.is_none() {
            debug!("Dialog {} ignoring ACK in state {}", inner.id, inner.state.name());
            return Ok(());
        }
        if ack.cseq() != inner.invite_cseq() {
            debug!("Dialog {} ignoring ACK for another INVITE", inner.id);
            return Ok(());
        }
        if let Some(key) = inner.ack_wait.take() {
            self.shared.transactions.terminate(&key).await;
            inner.owned.remove(&key);
        }
        if inner.offer_mode == OfferMode::OfferIn2xx && !ack.body().is_empty() {
            debug!("Dialog {} received answer in ACK", inner.id);
        }
        self.enter_call(inner);
        Ok(())
    }

    async fn on_reinvite(
        &self,
        inner: &mut DialogInner,
        request: SipRequest,
        source: SipTarget,
        handle: TransactionHandle,
    ) -> Result<(), SipError> {
        match inner.state {
            DialogState::Call => {}
            DialogState::ReInviting | DialogState::ReInvited => {
                return self.answer(&handle.key, &request, ResponseBuilder::new(491)).await;
            }
            _ => return self.answer(&handle.key, &request, ResponseBuilder::new(500)).await,
        }
        if session_timer::interval_too_small(&request, &self.shared.config).is_some() {
            let builder = ResponseBuilder::new(422).with(MIN_SE, self.shared.config.min_se.to_string());
            return self.answer(&handle.key, &request, builder).await;
        }

        if let Some(contact) = request.contact_uri() {
            inner.remote_target = Some(contact);
        }
        inner.invite_key = Some(handle.key.clone());
        inner.owned.insert(handle.key.clone());
        self.watch(request.clone(), handle);
        inner.invite = Some(request.clone());
        inner.invite_source = Some(source);
        inner.offer_mode = offer_mode_of(&request);
        inner.set_state(DialogState::ReInvited);
        self.emit(DialogEvent::ReInvited(request));
        Ok(())
    }

    async fn on_bye(&self, inner: &mut DialogInner, request: &SipRequest, key: &TransactionKey) -> Result<(), SipError> {
        if inner.state.is_confirmed() {
            self.answer(key, request, ResponseBuilder::ok()).await?;
            inner.set_state(DialogState::Byed);
            info!("Dialog {} ended by peer", inner.id);
            self.close(inner, CloseReason::RemoteBye).await;
        } else if inner.state == DialogState::Invited {
            self.answer(key, request, ResponseBuilder::ok()).await?;
            self.reject_invite(inner, ResponseBuilder::new(487)).await?;
            // reject_invite already closed the dialog
        } else {
            self.answer(key, request, ResponseBuilder::new(481)).await?;
        }
        Ok(())
    }

    async fn on_update(&self, inner: &mut DialogInner, request: &SipRequest, key: &TransactionKey) -> Result<(), SipError> {
        if session_timer::interval_too_small(request, &self.shared.config).is_some() {
            let builder = ResponseBuilder::new(422).with(MIN_SE, self.shared.config.min_se.to_string());
            return self.answer(key, request, builder).await;
        }
        if let Some(contact) = request.contact_uri() {
            inner.remote_target = Some(contact);
        }

        let mut builder = ResponseBuilder::ok().with("Contact", name_addr(&inner.local_contact));
        if !request.body().is_empty() {
            if let Some(body) = &inner.local_body {
                builder = builder.body(body.data.clone(), &body.content_type);
            }
        }
        let negotiated = if request.has_header(SESSION_EXPIRES) {
            session_timer::answer(request, &self.shared.config)
        } else {
            None
        };
        if let Some((_, headers)) = &negotiated {
            for (name, value) in headers {
                builder = builder.with(name, value.clone());
            }
        }
        self.answer(key, request, builder).await?;

        if let Some((session, _)) = negotiated {
            inner.session = Some(session);
            if inner.state == DialogState::Call {
                self.arm_session(inner, session);
            }
            self.emit(DialogEvent::SessionRefreshed(session.interval));
        }
        self.emit(DialogEvent::Updated(request.clone()));
        Ok(())
    }

    async fn on_prack(&self, inner: &mut DialogInner, request: &SipRequest, key: &TransactionKey) -> Result<(), SipError> {
        let rack = request.header(RACK).and_then(|v| RAck::parse(&v));
        let acknowledged = match (rack, inner.invite_cseq()) {
            (Some(rack), Some(cseq)) => inner.reliable_out.acknowledge(&rack, cseq),
            _ => false,
        };
        if !acknowledged {
            return self.answer(key, request, ResponseBuilder::new(481)).await;
        }

        self.answer(key, request, ResponseBuilder::ok()).await?;
        self.cancel_timer_slot(&mut inner.timers.reliable_retransmit);
        self.cancel_timer_slot(&mut inner.timers.reliable_timeout);

        let t1 = self.shared.transactions.sip_timers().t1;
        if let (Some(next), Some(invite_key)) = (inner.reliable_out.next(t1), inner.invite_key.clone()) {
            self.shared.transactions.respond(&invite_key, next).await?;
            self.arm_reliable(inner);
        }
        Ok(())
    }

    async fn answer(&self, key: &TransactionKey, request: &SipRequest, builder: ResponseBuilder) -> Result<(), SipError> {
        let response = builder.build_for_request(request)?;
        self.shared.transactions.respond(key, response).await
    }

    // ----- transaction events -----------------------------------------------

    fn watch(&self, request: SipRequest, mut handle: TransactionHandle) {
        let dialog = self.clone();
        tokio::spawn(async move {
            while let Some(event) = handle.events.recv().await {
                dialog
                    .on_transaction_event(handle.key.clone(), request.clone(), event)
                    .await;
            }
            dialog.shared.inner.lock().await.owned.remove(&handle.key);
        });
    }

    fn on_transaction_event(
        &self,
        key: TransactionKey,
        request: SipRequest,
        event: TransactionEvent,
    ) -> BoxFuture<'_, ()> {
        async move {
            let mut inner = self.shared.inner.lock().await;
            if inner.state.is_closed() {
                debug!("Dialog {} closed, ignoring event from {}", inner.id, key);
                return;
            }
            let result = match (key.role, key.method) {
                (TransactionRole::Client, SipMethod::Invite) => {
                    self.on_invite_event(&mut inner, &key, &request, event).await
                }
                (TransactionRole::Client, SipMethod::Bye) => self.on_bye_event(&mut inner, &request, event).await,
                (TransactionRole::Client, SipMethod::Cancel) | (TransactionRole::Client, SipMethod::Prack) => Ok(()),
                (TransactionRole::Client, method) => {
                    self.on_request_event(&mut inner, method, &request, event).await
                }
                (TransactionRole::Server, SipMethod::Invite) => {
                    self.on_invite_server_event(&mut inner, &key, event).await
                }
                (TransactionRole::Server, SipMethod::Ack) => self.on_ack_wait_event(&mut inner, event).await,
                (TransactionRole::Server, _) => Ok(()),
            };
            if let Err(e) = result {
                warn!("Dialog {} failed on event from {}: {}", inner.id, key, e);
            }
        }
        .boxed()
    }

    async fn on_invite_event(
        &self,
        inner: &mut DialogInner,
        key: &TransactionKey,
        request: &SipRequest,
        event: TransactionEvent,
    ) -> Result<(), SipError> {
        if inner.invite_key.as_ref() != Some(key) {
            debug!("Dialog {} ignoring event from stale INVITE {}", inner.id, key);
            return Ok(());
        }
        let initial = match inner.state {
            DialogState::Inviting => true,
            DialogState::ReInviting => false,
            _ => return Ok(()),
        };

        match event {
            TransactionEvent::Provisional(response) => {
                inner.invite_proceeding = true;
                if response.status_code() == 100 {
                    return Ok(());
                }
                if initial {
                    self.learn_remote(inner, &response).await;
                }
                if let Some(rseq) = reliable_rseq(&response) {
                    if !inner.reliable_in.accept(rseq) {
                        debug!("Dialog {} ignoring duplicate reliable provisional {}", inner.id, rseq);
                        return Ok(());
                    }
                    self.send_prack(inner, rseq, request).await?;
                }
                self.emit(DialogEvent::Provisional(response));
            }
            TransactionEvent::Success(response) => {
                inner.invite_key = None;
                if initial {
                    self.learn_remote(inner, &response).await;
                } else if let Some(contact) = response.contact_uri() {
                    inner.remote_target = Some(contact);
                }
                inner.peer_allows_update = response.has_option_tag("Allow", "UPDATE");

                if inner.cancelling {
                    info!("Dialog {} answered despite CANCEL, hanging up", inner.id);
                    self.send_ack(inner, None).await?;
                    return self.send_bye(inner).await;
                }

                if let Some(session) = session_timer::from_response(&response, &self.shared.config) {
                    inner.session = Some(session);
                }
                if initial {
                    inner.set_state(DialogState::Accepted);
                    self.emit(DialogEvent::Accepted(response.clone()));
                } else {
                    inner.set_state(DialogState::ReAccepted);
                    if !inner.refreshing {
                        self.emit(DialogEvent::ReInviteAccepted(response.clone()));
                    }
                }

                if inner.offer_mode == OfferMode::OfferInInvite || inner.refreshing {
                    self.send_ack(inner, None).await?;
                    self.enter_call(inner);
                } else {
                    inner.ack_pending = true;
                }
            }
            TransactionEvent::Failure(response) => {
                inner.invite_key = None;
                if !inner.cancelling {
                    if self.retry_challenged(inner, request, &response).await? {
                        return Ok(());
                    }
                    if self.retry_too_small(inner, request, &response).await? {
                        return Ok(());
                    }
                }
                let code = response.status_code();
                if initial {
                    inner.set_state(DialogState::Refused);
                    self.emit(DialogEvent::Refused(response));
                    let reason = if inner.cancelling {
                        CloseReason::Cancelled
                    } else {
                        CloseReason::Refused(code)
                    };
                    self.close(inner, reason).await;
                } else if inner.refreshing {
                    warn!("Dialog {} session refresh refused with {}", inner.id, code);
                    inner.refreshing = false;
                    inner.set_state(DialogState::ReRefused);
                    self.send_bye(inner).await?;
                    self.close(inner, CloseReason::SessionExpired).await;
                } else if code == 481 || code == 408 {
                    inner.set_state(DialogState::ReRefused);
                    self.close(inner, CloseReason::Refused(code)).await;
                } else {
                    inner.set_state(DialogState::ReRefused);
                    inner.set_state(DialogState::Call);
                    self.emit(DialogEvent::ReInviteRefused(response));
                }
            }
            TransactionEvent::Timeout => {
                inner.invite_key = None;
                let reason = if inner.cancelling {
                    CloseReason::Cancelled
                } else {
                    CloseReason::Timeout
                };
                self.close(inner, reason).await;
            }
            TransactionEvent::TransportError(e) => {
                inner.invite_key = None;
                self.close(inner, CloseReason::TransportError(e)).await;
            }
            TransactionEvent::AckReceived(_) | TransactionEvent::Cancelled(_) => {}
        }
        Ok(())
    }

    async fn on_bye_event(&self, inner: &mut DialogInner, request: &SipRequest, event: TransactionEvent) -> Result<(), SipError> {
        match event {
            TransactionEvent::Provisional(_) => Ok(()),
            TransactionEvent::Failure(response) if self.retry_challenged(inner, request, &response).await? => Ok(()),
            _ => {
                self.close(inner, CloseReason::LocalBye).await;
                Ok(())
            }
        }
    }

    async fn on_request_event(
        &self,
        inner: &mut DialogInner,
        method: SipMethod,
        request: &SipRequest,
        event: TransactionEvent,
    ) -> Result<(), SipError> {
        match event {
            TransactionEvent::Success(response) => {
                if method == SipMethod::Update {
                    if let Some(contact) = response.contact_uri() {
                        inner.remote_target = Some(contact);
                    }
                    if request.has_header(SESSION_EXPIRES) {
                        if let Some(session) = session_timer::from_response(&response, &self.shared.config) {
                            inner.session = Some(session);
                            self.arm_session(inner, session);
                            self.emit(DialogEvent::SessionRefreshed(session.interval));
                        }
                    }
                    inner.refreshing = false;
                }
                self.emit(DialogEvent::Response(method, response));
            }
            TransactionEvent::Failure(response) => {
                if self.retry_challenged(inner, request, &response).await? {
                    return Ok(());
                }
                if method == SipMethod::Update && self.retry_too_small(inner, request, &response).await? {
                    return Ok(());
                }
                let code = response.status_code();
                self.emit(DialogEvent::Response(method, response));
                if method == SipMethod::Update && inner.refreshing {
                    warn!("Dialog {} session refresh refused with {}", inner.id, code);
                    inner.refreshing = false;
                    self.send_bye(inner).await?;
                    self.close(inner, CloseReason::SessionExpired).await;
                } else if code == 481 || code == 408 {
                    self.close(inner, CloseReason::Refused(code)).await;
                }
            }
            TransactionEvent::Timeout => self.close(inner, CloseReason::Timeout).await,
            TransactionEvent::TransportError(e) => self.close(inner, CloseReason::TransportError(e)).await,
            _ => {}
        }
        Ok(())
    }

    async fn on_invite_server_event(
        &self,
        inner: &mut DialogInner,
        key: &TransactionKey,
        event: TransactionEvent,
    ) -> Result<(), SipError> {
        if inner.invite_key.as_ref() != Some(key) {
            return Ok(());
        }
        match event {
            TransactionEvent::Cancelled(_) if inner.state == DialogState::Invited => {
                info!("Dialog {} cancelled by peer", inner.id);
                self.emit(DialogEvent::Cancelled);
                let invite = inner
                    .invite
                    .clone()
                    .ok_or_else(|| SipError::InvalidState("no INVITE to cancel".to_string()))?;
                let response = ResponseBuilder::new(487)
                    .to_tag(inner.id.local_tag.clone())
                    .build_for_request(&invite)?;
                inner.invite_key = None;
                self.stop_reliable(inner);
                self.shared.transactions.respond(key, response).await?;
                inner.set_state(DialogState::Refused);
                self.close(inner, CloseReason::Cancelled).await;
            }
            TransactionEvent::Cancelled(_) if inner.state == DialogState::ReInvited => {
                self.reject_invite(inner, ResponseBuilder::new(487)).await?;
            }
            TransactionEvent::Timeout => debug!("Dialog {}: no ACK for final response", inner.id),
            _ => {}
        }
        Ok(())
    }

    async fn on_ack_wait_event(&self, inner: &mut DialogInner, event: TransactionEvent) -> Result<(), SipError> {
        if let TransactionEvent::Timeout = event {
            inner.ack_wait = None;
            if matches!(inner.state, DialogState::Accepted | DialogState::ReAccepted) {
                warn!("Dialog {}: no ACK for 2xx, hanging up", inner.id);
                self.send_bye(inner).await?;
                self.close(inner, CloseReason::AckTimeout).await;
            }
        }
        Ok(())
    }

    // ----- timers -----------------------------------------------------------

    pub(crate) async fn on_timer(&self, id: TimerId, kind: DialogTimerKind) {
        let mut inner = self.shared.inner.lock().await;
        if inner.state.is_closed() {
            return;
        }
        let slot = match kind {
            DialogTimerKind::ReliableRetransmit => &mut inner.timers.reliable_retransmit,
            DialogTimerKind::ReliableTimeout => &mut inner.timers.reliable_timeout,
            DialogTimerKind::SessionRefresh | DialogTimerKind::SessionExpiry => &mut inner.timers.session,
        };
        if *slot != Some(id) {
            return;
        }
        *slot = None;
        debug!("Dialog {} timer {:?} fired", inner.id, kind);

        let result = match kind {
            DialogTimerKind::ReliableRetransmit => self.retransmit_reliable(&mut inner).await,
            DialogTimerKind::ReliableTimeout => self.reliable_timed_out(&mut inner).await,
            DialogTimerKind::SessionRefresh => self.refresh_session(&mut inner).await,
            DialogTimerKind::SessionExpiry => {
                warn!("Dialog {} session expired", inner.id);
                let result = self.send_bye(&mut inner).await;
                self.close(&mut inner, CloseReason::SessionExpired).await;
                result
            }
        };
        if let Err(e) = result {
            warn!("Dialog {} timer {:?} failed: {}", inner.id, kind, e);
        }
    }

    fn schedule(&self, delay: std::time::Duration, kind: DialogTimerKind) -> TimerId {
        self.shared.timers.schedule(
            delay,
            DialogTimer {
                dialog: Arc::downgrade(&self.shared),
                kind,
            },
        )
    }

    fn cancel_timer_slot(&self, slot: &mut Option<TimerId>) {
        if let Some(id) = slot.take() {
            self.shared.timers.cancel(id);
        }
    }

    fn arm_reliable(&self, inner: &mut DialogInner) {
        self.cancel_timer_slot(&mut inner.timers.reliable_retransmit);
        self.cancel_timer_slot(&mut inner.timers.reliable_timeout);
        let t1 = self.shared.transactions.sip_timers().t1;
        inner.timers.reliable_retransmit = Some(self.schedule(t1, DialogTimerKind::ReliableRetransmit));
        inner.timers.reliable_timeout = Some(self.schedule(t1 * 64, DialogTimerKind::ReliableTimeout));
    }

    fn stop_reliable(&self, inner: &mut DialogInner) {
        inner.reliable_out.clear();
        self.cancel_timer_slot(&mut inner.timers.reliable_retransmit);
        self.cancel_timer_slot(&mut inner.timers.reliable_timeout);
    }

    fn arm_session(&self, inner: &mut DialogInner, session: NegotiatedSession) {
        self.cancel_timer_slot(&mut inner.timers.session);
        let (delay, kind) = if session.local_refresher {
            (session.refresh_after(), DialogTimerKind::SessionRefresh)
        } else {
            (session.expire_after(), DialogTimerKind::SessionExpiry)
        };
        inner.timers.session = Some(self.schedule(delay, kind));
    }

    async fn retransmit_reliable(&self, inner: &mut DialogInner) -> Result<(), SipError> {
        let Some(key) = inner.invite_key.clone() else {
            return Ok(());
        };
        if let Some((response, next)) = inner.reliable_out.retransmit() {
            inner.timers.reliable_retransmit = Some(self.schedule(next, DialogTimerKind::ReliableRetransmit));
            self.shared.transactions.respond(&key, response).await?;
        }
        Ok(())
    }

    async fn reliable_timed_out(&self, inner: &mut DialogInner) -> Result<(), SipError> {
        if !matches!(inner.state, DialogState::Invited | DialogState::ReInvited) {
            return Ok(());
        }
        warn!("Dialog {}: reliable provisional never acknowledged", inner.id);
        if inner.state == DialogState::ReInvited {
            return self.reject_invite(inner, ResponseBuilder::new(500)).await;
        }
        let invite = inner
            .invite
            .clone()
            .ok_or_else(|| SipError::InvalidState("no INVITE to answer".to_string()))?;
        if let Some(key) = inner.invite_key.take() {
            let response = ResponseBuilder::new(500)
                .to_tag(inner.id.local_tag.clone())
                .build_for_request(&invite)?;
            self.stop_reliable(inner);
            self.shared.transactions.respond(&key, response).await?;
        }
        inner.set_state(DialogState::Refused);
        self.close(inner, CloseReason::PrackTimeout).await;
        Ok(())
    }

    async fn refresh_session(&self, inner: &mut DialogInner) -> Result<(), SipError> {
        let Some(session) = inner.session else {
            return Ok(());
        };
        if inner.state != DialogState::Call {
            // Busy with another exchange, try again later
            self.arm_session(inner, session);
            return Ok(());
        }
        info!("Dialog {} refreshing session ({}s)", inner.id, session.interval);
        inner.refreshing = true;
        let headers = session_timer::request_headers(&self.shared.config, Some(Refresher::Uac));

        if inner.peer_allows_update {
            let mut request = self.in_dialog_request(inner, SipMethod::Update, None)?;
            for (name, value) in headers {
                request.push_header(name, value);
            }
            self.send_request(inner, request).await.map(|_| ())
        } else {
            let body = inner.local_body.clone();
            let mut request = self.in_dialog_request(inner, SipMethod::Invite, body.as_ref())?;
            for (name, value) in headers {
                request.push_header(name, value);
            }
            inner.offer_mode = OfferMode::OfferInInvite;
            inner.set_state(DialogState::ReInviting);
            self.send_invite(inner, request).await
        }
    }

    // ----- helpers ----------------------------------------------------------

    fn emit(&self, event: DialogEvent) {
        // The application may have dropped its receiver
        let _ = self.shared.events.send(event);
    }

    fn allow(&self) -> &'static str {
        if self.shared.capabilities.extended_methods {
            ALLOW_EXTENDED
        } else {
            ALLOW
        }
    }

    /// Supported / Require option tags we advertise
    fn extension_headers(&self) -> Vec<(&'static str, String)> {
        let config = &self.shared.config;
        let mut supported = Vec::new();
        if config.support_100rel {
            supported.push(reliable::OPTION_TAG);
        }
        if config.session_timer {
            supported.push(session_timer::TIMER_OPTION_TAG);
        }
        let mut headers = Vec::new();
        if !supported.is_empty() {
            headers.push(("Supported", supported.join(", ")));
        }
        if config.support_100rel && config.require_100rel {
            headers.push(("Require", reliable::OPTION_TAG.to_string()));
        }
        headers
    }

    fn unsupported_extensions(&self, request: &SipRequest) -> Vec<String> {
        let config = &self.shared.config;
        request
            .header_entries("Require")
            .into_iter()
            .filter(|tag| {
                let known = (config.support_100rel && tag.eq_ignore_ascii_case(reliable::OPTION_TAG))
                    || (config.session_timer && tag.eq_ignore_ascii_case(session_timer::TIMER_OPTION_TAG));
                !known
            })
            .collect()
    }

    async fn learn_remote(&self, inner: &mut DialogInner, response: &SipResponse) {
        if let Some(tag) = response.to_tag() {
            if inner.id.remote_tag.as_deref() != Some(tag.as_str()) {
                let old = inner.id.clone();
                inner.id.remote_tag = Some(tag);
                if let Some(registry) = self.shared.registry.upgrade() {
                    registry.rekey(&old, inner.id.clone(), self.clone()).await;
                }
                debug!("Dialog {} learned remote tag", inner.id);
            }
            inner.remote_party = response.header("To").unwrap_or_default();
        }
        if let Some(contact) = response.contact_uri() {
            inner.remote_target = Some(contact);
        }
        let mut route_set = response.header_entries("Record-Route");
        route_set.reverse();
        inner.route_set = route_set;
    }

    fn in_dialog_request(
        &self,
        inner: &mut DialogInner,
        method: SipMethod,
        body: Option<&Body>,
    ) -> Result<SipRequest, SipError> {
        let (uri, routes) = inner.next_hop()?;
        inner.local_cseq += 1;
        let config = &self.shared.config;
        let via = ViaHeader::new(config.transport, &config.via_host, config.via_port, &generate_branch());

        let mut builder = RequestBuilder::new(method, uri)
            .via(via.to_string())
            .from(inner.local_party.clone())
            .to(inner.remote_party.clone())
            .call_id(inner.id.call_id.clone())
            .cseq(inner.local_cseq)
            .routes(&routes);
        if matches!(method, SipMethod::Invite | SipMethod::Update) {
            builder = builder.contact(name_addr(&inner.local_contact));
        }
        if let Some(body) = body {
            builder = builder.body(body.data.clone(), &body.content_type);
        }
        builder.build()
    }

    async fn send_request(&self, inner: &mut DialogInner, request: SipRequest) -> Result<TransactionKey, SipError> {
        let target = request_target(&request, None, None, self.shared.config.transport)?;
        let handle = self
            .shared
            .transactions
            .start_client_transaction(request.clone(), target)
            .await?;
        let key = handle.key.clone();
        inner.owned.insert(key.clone());
        self.watch(request, handle);
        Ok(key)
    }

    async fn send_invite(&self, inner: &mut DialogInner, request: SipRequest) -> Result<(), SipError> {
        inner.invite_proceeding = false;
        inner.invite = Some(request.clone());
        let key = self.send_request(inner, request).await?;
        inner.invite_key = Some(key);
        Ok(())
    }

    async fn send_prack(&self, inner: &mut DialogInner, rseq: u32, invite: &SipRequest) -> Result<(), SipError> {
        let rack = RAck {
            rseq,
            cseq: invite.cseq().unwrap_or_default(),
            method: SipMethod::Invite,
        };
        let mut prack = self.in_dialog_request(inner, SipMethod::Prack, None)?;
        prack.push_header(RACK, rack.to_string());
        debug!("Dialog {} sending PRACK {}", inner.id, rack);
        self.send_request(inner, prack).await.map(|_| ())
    }

    /// ACK for a 2xx: its own transaction-less request (RFC 3261 Section 13.2.2.4)
    async fn send_ack(&self, inner: &mut DialogInner, body: Option<&Body>) -> Result<(), SipError> {
        let cseq = inner
            .invite_cseq()
            .ok_or_else(|| SipError::InvalidState("no INVITE to acknowledge".to_string()))?;
        let (uri, routes) = inner.next_hop()?;
        let config = &self.shared.config;
        let via = ViaHeader::new(config.transport, &config.via_host, config.via_port, &generate_branch());

        let mut builder = RequestBuilder::new(SipMethod::Ack, uri)
            .via(via.to_string())
            .from(inner.local_party.clone())
            .to(inner.remote_party.clone())
            .call_id(inner.id.call_id.clone())
            .cseq(cseq)
            .routes(&routes);
        if let Some(body) = body {
            builder = builder.body(body.data.clone(), &body.content_type);
        }
        let ack = builder.build()?;
        let target = request_target(&ack, None, None, config.transport)?;

        self.shared
            .transactions
            .transport()
            .send(OutgoingMessage {
                message: ack.clone().into(),
                target: target.clone(),
            })
            .await?;
        inner.last_ack = Some((ack, target));
        Ok(())
    }

    async fn send_bye(&self, inner: &mut DialogInner) -> Result<(), SipError> {
        self.cancel_timer_slot(&mut inner.timers.session);
        let bye = self.in_dialog_request(inner, SipMethod::Bye, None)?;
        inner.set_state(DialogState::Byeing);
        info!("Dialog {} sending BYE", inner.id);
        self.send_request(inner, bye).await.map(|_| ())
    }

    /// Resend a request with a new CSeq and branch plus extra headers
    async fn retry_request(
        &self,
        inner: &mut DialogInner,
        request: &SipRequest,
        headers: Vec<(&'static str, String)>,
    ) -> Result<(), SipError> {
        let method = request
            .method()
            .ok_or_else(|| SipError::InvalidMessage("unsupported method".to_string()))?;
        let mut retry = request.clone();
        inner.local_cseq += 1;
        retry.set_header("CSeq", format!("{} {}", inner.local_cseq, method));
        let config = &self.shared.config;
        let via = ViaHeader::new(config.transport, &config.via_host, config.via_port, &generate_branch());
        retry.set_header("Via", via.to_string());
        for (name, value) in headers {
            retry.set_header(name, value);
        }

        if method == SipMethod::Invite {
            self.send_invite(inner, retry).await
        } else {
            self.send_request(inner, retry).await.map(|_| ())
        }
    }

    /// One retry with stored credentials on 401/407
    async fn retry_challenged(
        &self,
        inner: &mut DialogInner,
        request: &SipRequest,
        response: &SipResponse,
    ) -> Result<bool, SipError> {
        let role = match response.status_code() {
            401 => AuthRole::Registrar,
            407 => AuthRole::Proxy,
            _ => return Ok(false),
        };
        let Some(credentials) = &self.shared.capabilities.reauth else {
            return Ok(false);
        };
        if request.has_header(role.credentials_header()) {
            return Ok(false);
        }
        let Some(challenge) = response
            .header(role.challenge_header())
            .and_then(|v| AuthChallenge::parse(&v).ok())
        else {
            return Ok(false);
        };
        let method = request
            .method()
            .ok_or_else(|| SipError::InvalidMessage("unsupported method".to_string()))?;
        let credentials = challenge.answer(
            &credentials.username,
            &credentials.password,
            method.as_str(),
            &request.uri_string(),
        );

        info!("Dialog {} answering {} challenge", inner.id, response.status_code());
        self.retry_request(inner, request, vec![(role.credentials_header(), credentials)])
            .await?;
        Ok(true)
    }

    /// 422: retry once with the peer's Min-SE
    async fn retry_too_small(
        &self,
        inner: &mut DialogInner,
        request: &SipRequest,
        response: &SipResponse,
    ) -> Result<bool, SipError> {
        if response.status_code() != 422 {
            return Ok(false);
        }
        let Some(current) = SessionExpires::from_message(request) else {
            return Ok(false);
        };
        let Some(min_se) = response
            .header(MIN_SE)
            .and_then(|v| v.split(';').next().and_then(|n| n.trim().parse::<u32>().ok()))
        else {
            return Ok(false);
        };
        if min_se <= current.interval {
            return Ok(false);
        }

        info!("Dialog {} raising session interval to {}", inner.id, min_se);
        let proposal = SessionExpires {
            interval: min_se,
            refresher: current.refresher,
        };
        self.retry_request(
            inner,
            request,
            vec![(SESSION_EXPIRES, proposal.to_string()), (MIN_SE, min_se.to_string())],
        )
        .await?;
        Ok(true)
    }

    fn enter_call(&self, inner: &mut DialogInner) {
        let established = inner.state == DialogState::Accepted;
        let refreshed = inner.refreshing;
        inner.refreshing = false;
        inner.set_state(DialogState::Call);
        if established {
            info!("Dialog {} established", inner.id);
            self.emit(DialogEvent::Established);
        }
        if let Some(session) = inner.session {
            self.arm_session(inner, session);
            if established || refreshed {
                self.emit(DialogEvent::SessionRefreshed(session.interval));
            }
        }
    }

    async fn close(&self, inner: &mut DialogInner, reason: CloseReason) {
        if inner.state.is_closed() {
            return;
        }
        self.stop_reliable(inner);
        self.cancel_timer_slot(&mut inner.timers.session);
        if let Some(key) = inner.ack_wait.take() {
            self.shared.transactions.terminate(&key).await;
            inner.owned.remove(&key);
        }
        inner.set_state(DialogState::Close);
        if let Some(registry) = self.shared.registry.upgrade() {
            registry.unregister(&inner.id, self).await;
        }
        info!("Dialog {} closed: {:?}", inner.id, reason);
        self.emit(DialogEvent::Closed(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner_with_routes(routes: &[&str]) -> DialogInner {
        DialogInner {
            id: DialogId::new("c", "l", Some("r".to_string())),
            role: DialogRole::Uac,
            state: DialogState::Call,
            local_party: "<sip:alice@example.com>;tag=l".to_string(),
            remote_party: "<sip:bob@example.com>;tag=r".to_string(),
            local_contact: "sip:alice@10.0.0.1".to_string(),
            remote_target: Some("sip:bob@10.0.0.2".to_string()),
            route_set: routes.iter().map(|r| r.to_string()).collect(),
            secure: false,
            local_cseq: 1,
            remote_cseq: None,
            offer_mode: OfferMode::default(),
            invite: None,
            invite_key: None,
            invite_source: None,
            invite_proceeding: false,
            cancelling: false,
            refreshing: false,
            ack_pending: false,
            local_body: None,
            last_ack: None,
            ack_wait: None,
            owned: HashSet::new(),
            session: None,
            peer_allows_update: false,
            reliable_required: false,
            reliable_out: ReliableSender::new(),
            reliable_in: ReliableReceiver::default(),
            timers: DialogTimers::default(),
        }
    }

    #[test]
    fn test_next_hop_without_routes() {
        let inner = inner_with_routes(&[]);
        let (uri, routes) = inner.next_hop().unwrap();
        assert_eq!(uri, "sip:bob@10.0.0.2");
        assert!(routes.is_empty());
    }

    #[test]
    fn test_next_hop_loose_routing() {
        let inner = inner_with_routes(&["<sip:p1.example.com;lr>", "<sip:p2.example.com;lr>"]);
        let (uri, routes) = inner.next_hop().unwrap();
        assert_eq!(uri, "sip:bob@10.0.0.2");
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0], "<sip:p1.example.com;lr>");
    }

    #[test]
    fn test_next_hop_strict_routing() {
        let inner = inner_with_routes(&["<sip:p1.example.com>", "<sip:p2.example.com;lr>"]);
        let (uri, routes) = inner.next_hop().unwrap();
        assert_eq!(uri, "sip:p1.example.com");
        assert_eq!(routes, vec!["<sip:p2.example.com;lr>".to_string(), "<sip:bob@10.0.0.2>".to_string()]);
    }

    #[test]
    fn test_name_addr() {
        assert_eq!(name_addr("sip:bob@example.com"), "<sip:bob@example.com>");
        assert_eq!(name_addr("Bob <sip:bob@example.com>"), "Bob <sip:bob@example.com>");
    }
}
