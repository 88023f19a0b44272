//! SIP Transaction state machines (RFC 3261 Section 17)
//!
//! A [`Transaction`] is a pure state machine: it is fed responses, requests
//! and fired timers, schedules its own timers on the shared arena and
//! returns what must be transmitted and reported. The
//! [`TransactionLayer`](super::transaction_layer::TransactionLayer) owns the
//! transactions and performs the I/O.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::builder::build_non_2xx_ack;
use super::message::{SipError, SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
use super::timer::{TimerArena, TimerId};
use super::transport::SipTarget;
use super::via::MAGIC_COOKIE;

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    pub t4: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Default proxy INVITE timeout (RFC 3261 Section 16.6, step 11)
pub const DEFAULT_TIMER_C: Duration = Duration::from_secs(180);

/// Timer types for SIP transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerType {
    /// Timer A: INVITE request retransmit interval (default: T1)
    TimerA,
    /// Timer B: INVITE transaction timeout (default: 64*T1)
    TimerB,
    /// Timer C: proxy INVITE transaction timeout, re-armed on provisionals
    TimerC,
    /// Timer D: Wait time for response retransmits (default: >32s for UDP, 0s for TCP)
    TimerD,
    /// Timer E: Non-INVITE request retransmit (default: T1)
    TimerE,
    /// Timer F: Non-INVITE transaction timeout (default: 64*T1)
    TimerF,
    /// Timer G: INVITE response retransmit (default: T1)
    TimerG,
    /// Timer H: Wait time for ACK receipt (default: 64*T1)
    TimerH,
    /// Timer I: Wait time for ACK retransmits (default: T4 for UDP, 0s for TCP)
    TimerI,
    /// Timer J: Wait time for retransmits of non-INVITE requests (default: 64*T1 for UDP, 0s for TCP)
    TimerJ,
    /// Timer K: Wait time for response retransmits (default: T4 for UDP, 0s for TCP)
    TimerK,
}

impl TimerType {
    /// Get default duration for this timer
    pub fn default_duration(&self, timers: &SipTimers, is_reliable: bool) -> Duration {
        match self {
            TimerType::TimerA | TimerType::TimerE | TimerType::TimerG => timers.t1,
            TimerType::TimerB | TimerType::TimerF | TimerType::TimerH => timers.t1 * 64,
            TimerType::TimerC => DEFAULT_TIMER_C,
            TimerType::TimerD => {
                if is_reliable {
                    Duration::ZERO
                } else {
                    Duration::from_secs(32)
                }
            }
            TimerType::TimerI | TimerType::TimerK => {
                if is_reliable {
                    Duration::ZERO
                } else {
                    timers.t4
                }
            }
            TimerType::TimerJ => {
                if is_reliable {
                    Duration::ZERO
                } else {
                    timers.t1 * 64
                }
            }
        }
    }
}

/// INVITE Client Transaction States (RFC 3261 Section 17.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteClientState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// INVITE Server Transaction States (RFC 3261 Section 17.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteServerState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Non-INVITE Client Transaction States (RFC 3261 Section 17.1.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteClientState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Non-INVITE Server Transaction States (RFC 3261 Section 17.2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteServerState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// UAS retransmitting a 2xx until the ACK shows up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckWaitState {
    Waiting,
    Terminated,
}

/// Transaction type and state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    InviteClient(InviteClientState),
    InviteServer(InviteServerState),
    NonInviteClient(NonInviteClientState),
    NonInviteServer(NonInviteServerState),
    AckWait(AckWaitState),
}

impl TransactionState {
    /// Check if transaction is terminated
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TransactionState::InviteClient(InviteClientState::Terminated)
                | TransactionState::InviteServer(InviteServerState::Terminated)
                | TransactionState::NonInviteClient(NonInviteClientState::Terminated)
                | TransactionState::NonInviteServer(NonInviteServerState::Terminated)
                | TransactionState::AckWait(AckWaitState::Terminated)
        )
    }

    /// The terminated state of the same machine
    pub fn terminated(&self) -> Self {
        match self {
            TransactionState::InviteClient(_) => {
                TransactionState::InviteClient(InviteClientState::Terminated)
            }
            TransactionState::InviteServer(_) => {
                TransactionState::InviteServer(InviteServerState::Terminated)
            }
            TransactionState::NonInviteClient(_) => {
                TransactionState::NonInviteClient(NonInviteClientState::Terminated)
            }
            TransactionState::NonInviteServer(_) => {
                TransactionState::NonInviteServer(NonInviteServerState::Terminated)
            }
            TransactionState::AckWait(_) => TransactionState::AckWait(AckWaitState::Terminated),
        }
    }

    /// Client INVITE that has seen a provisional response
    pub fn is_proceeding(&self) -> bool {
        matches!(
            self,
            TransactionState::InviteClient(InviteClientState::Proceeding)
                | TransactionState::NonInviteClient(NonInviteClientState::Proceeding)
        )
    }

    /// Get state name for debugging
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::InviteClient(InviteClientState::Calling) => "ICT-Calling",
            TransactionState::InviteClient(InviteClientState::Proceeding) => "ICT-Proceeding",
            TransactionState::InviteClient(InviteClientState::Completed) => "ICT-Completed",
            TransactionState::InviteClient(InviteClientState::Terminated) => "ICT-Terminated",
            TransactionState::InviteServer(InviteServerState::Proceeding) => "IST-Proceeding",
            TransactionState::InviteServer(InviteServerState::Completed) => "IST-Completed",
            TransactionState::InviteServer(InviteServerState::Confirmed) => "IST-Confirmed",
            TransactionState::InviteServer(InviteServerState::Terminated) => "IST-Terminated",
            TransactionState::NonInviteClient(NonInviteClientState::Trying) => "NICT-Trying",
            TransactionState::NonInviteClient(NonInviteClientState::Proceeding) => {
                "NICT-Proceeding"
            }
            TransactionState::NonInviteClient(NonInviteClientState::Completed) => "NICT-Completed",
            TransactionState::NonInviteClient(NonInviteClientState::Terminated) => {
                "NICT-Terminated"
            }
            TransactionState::NonInviteServer(NonInviteServerState::Trying) => "NIST-Trying",
            TransactionState::NonInviteServer(NonInviteServerState::Proceeding) => {
                "NIST-Proceeding"
            }
            TransactionState::NonInviteServer(NonInviteServerState::Completed) => "NIST-Completed",
            TransactionState::NonInviteServer(NonInviteServerState::Terminated) => {
                "NIST-Terminated"
            }
            TransactionState::AckWait(AckWaitState::Waiting) => "ACK-Waiting",
            TransactionState::AckWait(AckWaitState::Terminated) => "ACK-Terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Transaction identity (RFC 3261 Section 17.1.3 / 17.2.3)
///
/// Requests whose top Via branch lacks the magic cookie are keyed on the
/// Via sent-by and From tag instead. ACK is folded onto INVITE so that it
/// finds the INVITE server transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub call_id: String,
    pub cseq: u32,
    pub method: SipMethod,
    pub role: TransactionRole,
}

impl TransactionKey {
    pub fn from_request(request: &SipRequest, role: TransactionRole) -> Result<Self, SipError> {
        let method = request
            .method()
            .ok_or_else(|| SipError::InvalidMessage("unsupported method".to_string()))?;
        Self::build(request, method, role)
    }

    pub fn from_response(response: &SipResponse, role: TransactionRole) -> Result<Self, SipError> {
        let method = response
            .cseq_method()
            .ok_or_else(|| SipError::InvalidMessage("response without CSeq method".to_string()))?;
        Self::build(response, method, role)
    }

    fn build<M: SipHeaders>(message: &M, method: SipMethod, role: TransactionRole) -> Result<Self, SipError> {
        let via = message
            .top_via()
            .ok_or_else(|| SipError::InvalidMessage("missing Via".to_string()))?;
        let branch = match via.branch() {
            Some(branch) if branch.starts_with(MAGIC_COOKIE) => branch.to_string(),
            _ => format!(
                "{}|{}",
                via.sent_by(),
                message.from_tag().unwrap_or_default()
            ),
        };
        let call_id = message
            .call_id()
            .ok_or_else(|| SipError::InvalidMessage("missing Call-ID".to_string()))?;
        let cseq = message
            .cseq()
            .ok_or_else(|| SipError::InvalidMessage("missing CSeq".to_string()))?;
        let method = if method == SipMethod::Ack {
            SipMethod::Invite
        } else {
            method
        };
        Ok(Self {
            branch,
            call_id,
            cseq,
            method,
            role,
        })
    }

    /// Same branch, different method: CANCEL to INVITE and back
    pub fn with_method(&self, method: SipMethod) -> Self {
        Self {
            method,
            ..self.clone()
        }
    }

    /// Key of the 2xx retransmission helper for this INVITE server transaction
    pub fn ack_wait(&self) -> Self {
        self.with_method(SipMethod::Ack)
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            TransactionRole::Client => "c",
            TransactionRole::Server => "s",
        };
        write!(f, "{}/{}/{}/{} {}", role, self.branch, self.call_id, self.cseq, self.method)
    }
}

/// What a transaction reports to its owner
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    Provisional(SipResponse),
    Success(SipResponse),
    Failure(SipResponse),
    Timeout,
    TransportError(String),
    AckReceived(SipRequest),
    Cancelled(SipRequest),
}

impl TransactionEvent {
    /// Terminal events are reported at most once per transaction
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionEvent::Success(_)
                | TransactionEvent::Failure(_)
                | TransactionEvent::Timeout
                | TransactionEvent::TransportError(_)
        )
    }
}

/// Timer payload stored in the arena
#[derive(Debug, Clone)]
pub struct TransactionTimer {
    pub key: TransactionKey,
    pub timer: TimerType,
}

/// Side effects requested by a transaction
#[derive(Debug, Clone)]
pub enum TransactionOutput {
    Transmit(SipMessage),
    Event(TransactionEvent),
}

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    id: TimerId,
    interval: Duration,
}

/// SIP Transaction
pub struct Transaction {
    pub key: TransactionKey,
    pub state: TransactionState,
    /// Original request
    pub request: SipRequest,
    /// Destination for client transactions, reply address for server ones
    pub target: SipTarget,
    pub is_reliable: bool,
    /// Last response (for retransmission)
    pub last_response: Option<SipResponse>,
    pub created_at: Instant,
    pub sip_timers: SipTimers,
    ack: Option<SipRequest>,
    timer_c: Option<Duration>,
    timers: HashMap<TimerType, ArmedTimer>,
    terminal_reported: bool,
}

impl Transaction {
    pub fn new_client(
        key: TransactionKey,
        request: SipRequest,
        target: SipTarget,
        sip_timers: SipTimers,
        timer_c: Option<Duration>,
    ) -> Self {
        let state = if key.method == SipMethod::Invite {
            TransactionState::InviteClient(InviteClientState::Calling)
        } else {
            TransactionState::NonInviteClient(NonInviteClientState::Trying)
        };
        Self::with_state(key, state, request, target, sip_timers, timer_c)
    }

    pub fn new_server(
        key: TransactionKey,
        request: SipRequest,
        source: SipTarget,
        sip_timers: SipTimers,
    ) -> Self {
        let state = if key.method == SipMethod::Invite {
            TransactionState::InviteServer(InviteServerState::Proceeding)
        } else {
            TransactionState::NonInviteServer(NonInviteServerState::Trying)
        };
        Self::with_state(key, state, request, source, sip_timers, None)
    }

    pub fn new_ack_wait(
        key: TransactionKey,
        invite: SipRequest,
        response: SipResponse,
        target: SipTarget,
        sip_timers: SipTimers,
    ) -> Self {
        let mut txn = Self::with_state(
            key,
            TransactionState::AckWait(AckWaitState::Waiting),
            invite,
            target,
            sip_timers,
            None,
        );
        txn.last_response = Some(response);
        txn
    }

    fn with_state(
        key: TransactionKey,
        state: TransactionState,
        request: SipRequest,
        target: SipTarget,
        sip_timers: SipTimers,
        timer_c: Option<Duration>,
    ) -> Self {
        let is_reliable = target.is_reliable();
        Self {
            key,
            state,
            request,
            target,
            is_reliable,
            last_response: None,
            created_at: Instant::now(),
            sip_timers,
            ack: None,
            timer_c,
            timers: HashMap::new(),
            terminal_reported: false,
        }
    }

    pub fn is_client(&self) -> bool {
        self.key.role == TransactionRole::Client
    }

    /// Initial transmission and timers
    pub fn start(&mut self, arena: &TimerArena<TransactionTimer>) -> Vec<TransactionOutput> {
        match self.state {
            TransactionState::InviteClient(_) => {
                if !self.is_reliable {
                    self.start_timer(arena, TimerType::TimerA);
                }
                self.start_timer(arena, TimerType::TimerB);
                if let Some(timer_c) = self.timer_c {
                    self.arm(arena, TimerType::TimerC, timer_c);
                }
                vec![TransactionOutput::Transmit(self.request.clone().into())]
            }
            TransactionState::NonInviteClient(_) => {
                if !self.is_reliable {
                    self.start_timer(arena, TimerType::TimerE);
                }
                self.start_timer(arena, TimerType::TimerF);
                vec![TransactionOutput::Transmit(self.request.clone().into())]
            }
            // The 2xx itself went out through the INVITE server
            // transaction; Timer G only retransmits it
            TransactionState::AckWait(_) => {
                if !self.is_reliable {
                    self.start_timer(arena, TimerType::TimerG);
                }
                self.start_timer(arena, TimerType::TimerH);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Process received response (for client transactions)
    pub fn on_response(
        &mut self,
        response: &SipResponse,
        arena: &TimerArena<TransactionTimer>,
    ) -> Vec<TransactionOutput> {
        let status = response.status_code();
        let mut out = Vec::new();

        match self.state {
            TransactionState::InviteClient(InviteClientState::Calling)
            | TransactionState::InviteClient(InviteClientState::Proceeding) => {
                if status < 200 {
                    self.state = TransactionState::InviteClient(InviteClientState::Proceeding);
                    self.stop_timer(arena, TimerType::TimerA);
                    self.stop_timer(arena, TimerType::TimerB);
                    if status > 100 {
                        if let Some(timer_c) = self.timer_c {
                            self.arm(arena, TimerType::TimerC, timer_c);
                        }
                    }
                    out.push(TransactionOutput::Event(TransactionEvent::Provisional(
                        response.clone(),
                    )));
                } else if status < 300 {
                    self.enter_terminated(arena);
                    out.extend(self.terminal(TransactionEvent::Success(response.clone())));
                } else {
                    self.state = TransactionState::InviteClient(InviteClientState::Completed);
                    self.stop_timer(arena, TimerType::TimerA);
                    self.stop_timer(arena, TimerType::TimerB);
                    self.stop_timer(arena, TimerType::TimerC);
                    self.last_response = Some(response.clone());
                    match build_non_2xx_ack(&self.request, response) {
                        Ok(ack) => {
                            out.push(TransactionOutput::Transmit(ack.clone().into()));
                            self.ack = Some(ack);
                        }
                        Err(e) => debug!("Cannot build ACK for {}: {}", self.key, e),
                    }
                    self.wait_then_terminate(arena, TimerType::TimerD);
                    out.extend(self.terminal(TransactionEvent::Failure(response.clone())));
                }
            }
            TransactionState::InviteClient(InviteClientState::Completed) => {
                // Retransmitted final response: repeat the ACK
                if status >= 300 {
                    if let Some(ack) = &self.ack {
                        out.push(TransactionOutput::Transmit(ack.clone().into()));
                    }
                }
            }
            TransactionState::NonInviteClient(NonInviteClientState::Trying)
            | TransactionState::NonInviteClient(NonInviteClientState::Proceeding) => {
                if status < 200 {
                    self.state = TransactionState::NonInviteClient(NonInviteClientState::Proceeding);
                    out.push(TransactionOutput::Event(TransactionEvent::Provisional(
                        response.clone(),
                    )));
                } else {
                    self.state = TransactionState::NonInviteClient(NonInviteClientState::Completed);
                    self.stop_timer(arena, TimerType::TimerE);
                    self.stop_timer(arena, TimerType::TimerF);
                    self.last_response = Some(response.clone());
                    self.wait_then_terminate(arena, TimerType::TimerK);
                    let event = if status < 300 {
                        TransactionEvent::Success(response.clone())
                    } else {
                        TransactionEvent::Failure(response.clone())
                    };
                    out.extend(self.terminal(event));
                }
            }
            _ => debug!(
                "Transaction {} absorbed {} in state {}",
                self.key,
                status,
                self.state.name()
            ),
        }
        out
    }

    /// Retransmitted request: resend the last response, if any
    pub fn on_retransmission(&mut self) -> Vec<TransactionOutput> {
        match self.state {
            TransactionState::InviteServer(InviteServerState::Proceeding)
            | TransactionState::InviteServer(InviteServerState::Completed)
            | TransactionState::NonInviteServer(NonInviteServerState::Proceeding)
            | TransactionState::NonInviteServer(NonInviteServerState::Completed) => self
                .last_response
                .clone()
                .map(|r| vec![TransactionOutput::Transmit(r.into())])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Process received ACK (for INVITE server transactions)
    pub fn on_ack(
        &mut self,
        ack: &SipRequest,
        arena: &TimerArena<TransactionTimer>,
    ) -> Vec<TransactionOutput> {
        match self.state {
            TransactionState::InviteServer(InviteServerState::Completed) => {
                self.state = TransactionState::InviteServer(InviteServerState::Confirmed);
                self.stop_timer(arena, TimerType::TimerG);
                self.stop_timer(arena, TimerType::TimerH);
                self.wait_then_terminate(arena, TimerType::TimerI);
                vec![TransactionOutput::Event(TransactionEvent::AckReceived(ack.clone()))]
            }
            TransactionState::AckWait(AckWaitState::Waiting) => {
                self.enter_terminated(arena);
                vec![TransactionOutput::Event(TransactionEvent::AckReceived(ack.clone()))]
            }
            _ => Vec::new(),
        }
    }

    /// Upstream CANCEL matched this INVITE server transaction
    pub fn on_cancel(&mut self, cancel: &SipRequest) -> Vec<TransactionOutput> {
        match self.state {
            TransactionState::InviteServer(InviteServerState::Proceeding) => {
                vec![TransactionOutput::Event(TransactionEvent::Cancelled(cancel.clone()))]
            }
            _ => Vec::new(),
        }
    }

    /// Send response (for server transactions)
    pub fn send_response(
        &mut self,
        response: SipResponse,
        arena: &TimerArena<TransactionTimer>,
    ) -> Result<Vec<TransactionOutput>, SipError> {
        let status = response.status_code();

        match self.state {
            TransactionState::InviteServer(InviteServerState::Proceeding) => {
                if (200..300).contains(&status) {
                    self.enter_terminated(arena);
                } else if status >= 300 {
                    self.state = TransactionState::InviteServer(InviteServerState::Completed);
                    if !self.is_reliable {
                        self.start_timer(arena, TimerType::TimerG);
                    }
                    self.start_timer(arena, TimerType::TimerH);
                }
            }
            TransactionState::NonInviteServer(NonInviteServerState::Trying)
            | TransactionState::NonInviteServer(NonInviteServerState::Proceeding) => {
                if status < 200 {
                    self.state = TransactionState::NonInviteServer(NonInviteServerState::Proceeding);
                } else {
                    self.state = TransactionState::NonInviteServer(NonInviteServerState::Completed);
                    self.wait_then_terminate(arena, TimerType::TimerJ);
                }
            }
            state => {
                return Err(SipError::InvalidState(format!(
                    "cannot send {} in {}",
                    status,
                    state.name()
                )))
            }
        }

        self.last_response = Some(response.clone());
        Ok(vec![TransactionOutput::Transmit(response.into())])
    }

    /// Handle timer expiration. Stale timers (cancelled or re-armed since
    /// they were polled) are ignored.
    pub fn on_timer(
        &mut self,
        id: TimerId,
        timer_type: TimerType,
        arena: &TimerArena<TransactionTimer>,
    ) -> Vec<TransactionOutput> {
        let armed = match self.timers.get(&timer_type) {
            Some(armed) if armed.id == id => *armed,
            _ => return Vec::new(),
        };
        self.timers.remove(&timer_type);

        debug!(
            "Timer {:?} fired for transaction {} in state {}",
            timer_type,
            self.key,
            self.state.name()
        );

        let t2 = self.sip_timers.t2;
        match (timer_type, self.state) {
            (TimerType::TimerA, TransactionState::InviteClient(InviteClientState::Calling))
            | (TimerType::TimerE, TransactionState::NonInviteClient(NonInviteClientState::Trying)) => {
                self.arm(arena, timer_type, std::cmp::min(armed.interval * 2, t2));
                vec![TransactionOutput::Transmit(self.request.clone().into())]
            }
            (TimerType::TimerE, TransactionState::NonInviteClient(NonInviteClientState::Proceeding)) => {
                self.arm(arena, timer_type, t2);
                vec![TransactionOutput::Transmit(self.request.clone().into())]
            }
            (TimerType::TimerG, TransactionState::InviteServer(InviteServerState::Completed))
            | (TimerType::TimerG, TransactionState::AckWait(AckWaitState::Waiting)) => {
                self.arm(arena, timer_type, std::cmp::min(armed.interval * 2, t2));
                self.last_response
                    .clone()
                    .map(|r| vec![TransactionOutput::Transmit(r.into())])
                    .unwrap_or_default()
            }
            (TimerType::TimerB, TransactionState::InviteClient(InviteClientState::Calling))
            | (TimerType::TimerC, TransactionState::InviteClient(InviteClientState::Calling))
            | (TimerType::TimerC, TransactionState::InviteClient(InviteClientState::Proceeding))
            | (TimerType::TimerF, TransactionState::NonInviteClient(NonInviteClientState::Trying))
            | (TimerType::TimerF, TransactionState::NonInviteClient(NonInviteClientState::Proceeding))
            | (TimerType::TimerH, TransactionState::InviteServer(InviteServerState::Completed))
            | (TimerType::TimerH, TransactionState::AckWait(AckWaitState::Waiting)) => {
                self.enter_terminated(arena);
                self.terminal(TransactionEvent::Timeout).into_iter().collect()
            }
            (TimerType::TimerD, TransactionState::InviteClient(InviteClientState::Completed))
            | (TimerType::TimerI, TransactionState::InviteServer(InviteServerState::Confirmed))
            | (TimerType::TimerJ, TransactionState::NonInviteServer(NonInviteServerState::Completed))
            | (TimerType::TimerK, TransactionState::NonInviteClient(NonInviteClientState::Completed)) => {
                self.enter_terminated(arena);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Transport failure while sending: client transactions report it
    pub fn on_transport_error(
        &mut self,
        reason: String,
        arena: &TimerArena<TransactionTimer>,
    ) -> Vec<TransactionOutput> {
        self.enter_terminated(arena);
        if self.is_client() {
            self.terminal(TransactionEvent::TransportError(reason))
                .into_iter()
                .collect()
        } else {
            Vec::new()
        }
    }

    /// Local abort: no wire activity, no event
    pub fn terminate(&mut self, arena: &TimerArena<TransactionTimer>) {
        self.enter_terminated(arena);
        self.terminal_reported = true;
    }

    /// Stop the proxy-level timeout; protocol timers keep running
    pub fn detach(&mut self, arena: &TimerArena<TransactionTimer>) {
        self.timer_c = None;
        self.stop_timer(arena, TimerType::TimerC);
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    fn terminal(&mut self, event: TransactionEvent) -> Option<TransactionOutput> {
        if self.terminal_reported {
            return None;
        }
        self.terminal_reported = true;
        Some(TransactionOutput::Event(event))
    }

    fn start_timer(&mut self, arena: &TimerArena<TransactionTimer>, timer_type: TimerType) {
        let duration = timer_type.default_duration(&self.sip_timers, self.is_reliable);
        if !duration.is_zero() {
            self.arm(arena, timer_type, duration);
        }
    }

    /// Completed states linger for the wait timer, or end at once on
    /// reliable transports where the wait is zero
    fn wait_then_terminate(&mut self, arena: &TimerArena<TransactionTimer>, timer_type: TimerType) {
        let duration = timer_type.default_duration(&self.sip_timers, self.is_reliable);
        if duration.is_zero() {
            self.enter_terminated(arena);
        } else {
            self.arm(arena, timer_type, duration);
        }
    }

    fn arm(&mut self, arena: &TimerArena<TransactionTimer>, timer_type: TimerType, interval: Duration) {
        self.stop_timer(arena, timer_type);
        let id = arena.schedule(
            interval,
            TransactionTimer {
                key: self.key.clone(),
                timer: timer_type,
            },
        );
        self.timers.insert(timer_type, ArmedTimer { id, interval });
        debug!(
            "Started {:?} for transaction {} (expires in {:?})",
            timer_type, self.key, interval
        );
    }

    fn stop_timer(&mut self, arena: &TimerArena<TransactionTimer>, timer_type: TimerType) {
        if let Some(armed) = self.timers.remove(&timer_type) {
            arena.cancel(armed.id);
        }
    }

    fn enter_terminated(&mut self, arena: &TimerArena<TransactionTimer>) {
        for (_, armed) in self.timers.drain() {
            arena.cancel(armed.id);
        }
        self.state = self.state.terminated();
    }
}
