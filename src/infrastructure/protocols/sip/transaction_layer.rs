//! Transaction layer
//!
//! Owns every live transaction. The map lock is only held to look an entry
//! up or to insert/remove it; all processing happens under the entry's own
//! lock so that unrelated transactions never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::builder::ResponseBuilder;
use super::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::timer::{TimerArena, TimerId};
use super::transaction::{
    SipTimers, Transaction, TransactionEvent, TransactionKey, TransactionOutput, TransactionRole,
    TransactionState, TransactionTimer,
};
use super::transport::{IncomingMessage, OutgoingMessage, SipTarget, TransportFacade};

struct TransactionEntry {
    txn: Transaction,
    events: Option<mpsc::UnboundedSender<TransactionEvent>>,
}

type SharedEntry = Arc<Mutex<TransactionEntry>>;

/// Owner's view of a transaction: its key and the events it reports.
/// The channel closes once the transaction is gone.
#[derive(Debug)]
pub struct TransactionHandle {
    pub key: TransactionKey,
    pub events: mpsc::UnboundedReceiver<TransactionEvent>,
}

pub struct TransactionLayer {
    transactions: RwLock<HashMap<TransactionKey, SharedEntry>>,
    timers: Arc<TimerArena<TransactionTimer>>,
    transport: Arc<dyn TransportFacade>,
    sip_timers: SipTimers,
    timer_c: Option<Duration>,
}

impl TransactionLayer {
    pub fn new(transport: Arc<dyn TransportFacade>, sip_timers: SipTimers) -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            timers: Arc::new(TimerArena::new()),
            transport,
            sip_timers,
            timer_c: None,
        }
    }

    /// Arm Timer C on every INVITE client transaction (proxy behaviour)
    pub fn with_timer_c(mut self, timer_c: Option<Duration>) -> Self {
        self.timer_c = timer_c;
        self
    }

    pub fn sip_timers(&self) -> SipTimers {
        self.sip_timers
    }

    pub fn transport(&self) -> Arc<dyn TransportFacade> {
        self.transport.clone()
    }

    /// Start the timer task. It stops on its own once the layer is dropped.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let layer: Weak<Self> = Arc::downgrade(self);
        let timers = self.timers.clone();

        tokio::spawn(async move {
            info!("Transaction layer timer task started");
            loop {
                let due = timers.next_due().await;
                let Some(layer) = layer.upgrade() else {
                    break;
                };
                for (id, timer) in due {
                    layer.on_timer(id, timer).await;
                }
            }
            info!("Transaction layer timer task stopped");
        })
    }

    pub async fn start_client_transaction(
        &self,
        request: SipRequest,
        target: SipTarget,
    ) -> Result<TransactionHandle, SipError> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        if request.method() == Some(SipMethod::Ack) {
            return Err(SipError::TransactionError(
                "ACK is sent outside transactions".to_string(),
            ));
        }
        let timer_c = if key.method == SipMethod::Invite {
            self.timer_c
        } else {
            None
        };

        info!("Created client transaction {} to {}", key, target);
        let txn = Transaction::new_client(key.clone(), request, target, self.sip_timers, timer_c);
        let (events, entry) = self.insert(txn, true).await?;
        self.drive(&entry, |txn, arena| Ok(txn.start(arena))).await?;
        Ok(TransactionHandle { key, events })
    }

    /// New server transaction for an incoming request. `Ok(None)` means a
    /// transaction already exists for it (a retransmission).
    pub async fn start_server_transaction(
        &self,
        request: SipRequest,
        source: SipTarget,
    ) -> Result<Option<TransactionHandle>, SipError> {
        let key = TransactionKey::from_request(&request, TransactionRole::Server)?;
        let txn = Transaction::new_server(key.clone(), request, source, self.sip_timers);
        match self.insert(txn, false).await {
            Ok((events, _)) => {
                debug!("Created server transaction {}", key);
                Ok(Some(TransactionHandle { key, events }))
            }
            Err(SipError::TransactionError(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Retransmit a 2xx until its ACK arrives (UAS side of RFC 3261 §13.3.1.4)
    pub async fn start_ack_wait(
        &self,
        invite: SipRequest,
        response: SipResponse,
        target: SipTarget,
    ) -> Result<TransactionHandle, SipError> {
        let key = TransactionKey::from_request(&invite, TransactionRole::Server)?.ack_wait();
        let txn = Transaction::new_ack_wait(key.clone(), invite, response, target, self.sip_timers);
        let (events, entry) = self.insert(txn, true).await?;
        self.drive(&entry, |txn, arena| Ok(txn.start(arena))).await?;
        Ok(TransactionHandle { key, events })
    }

    /// Send a response on a server transaction
    pub async fn respond(&self, key: &TransactionKey, response: SipResponse) -> Result<(), SipError> {
        let entry = self
            .lookup(key)
            .await
            .ok_or_else(|| SipError::NotFound(format!("transaction {}", key)))?;
        self.drive(&entry, |txn, arena| txn.send_response(response, arena))
            .await
    }

    /// Abort locally: timers cancelled, nothing sent, no event
    pub async fn terminate(&self, key: &TransactionKey) {
        if let Some(entry) = self.lookup(key).await {
            {
                let mut guard = entry.lock().await;
                guard.txn.terminate(&self.timers);
                guard.events = None;
            }
            self.remove(key, &entry).await;
            debug!("Terminated transaction {}", key);
        }
    }

    /// Stop reporting to the owner and drop Timer C. The transaction keeps
    /// absorbing retransmissions until its own timers end it.
    pub async fn detach(&self, key: &TransactionKey) {
        if let Some(entry) = self.lookup(key).await {
            let mut guard = entry.lock().await;
            guard.events = None;
            guard.txn.detach(&self.timers);
        }
    }

    pub async fn state(&self, key: &TransactionKey) -> Option<TransactionState> {
        let entry = self.lookup(key).await?;
        let guard = entry.lock().await;
        Some(guard.txn.state)
    }

    pub async fn request(&self, key: &TransactionKey) -> Option<SipRequest> {
        let entry = self.lookup(key).await?;
        let guard = entry.lock().await;
        Some(guard.txn.request.clone())
    }

    pub async fn transaction_count(&self) -> usize {
        self.transactions.read().await.len()
    }

    /// Feed a message from the transport. Messages that match no
    /// transaction are handed back to the caller.
    pub async fn handle_incoming(&self, incoming: IncomingMessage) -> Option<IncomingMessage> {
        let outcome = match &incoming.message {
            SipMessage::Response(response) => self.handle_response(response).await,
            SipMessage::Request(request) => match request.method() {
                Some(SipMethod::Ack) => self.handle_ack(request).await,
                Some(SipMethod::Cancel) => self.handle_cancel(request, &incoming).await,
                _ => self.handle_retransmission(request).await,
            },
        };

        match outcome {
            Ok(true) => None,
            Ok(false) => Some(incoming),
            Err(e) => {
                warn!("Dropping message from {}: {}", incoming.source, e);
                None
            }
        }
    }

    async fn handle_response(&self, response: &SipResponse) -> Result<bool, SipError> {
        let key = TransactionKey::from_response(response, TransactionRole::Client)?;
        let Some(entry) = self.lookup(&key).await else {
            return Ok(false);
        };
        self.drive(&entry, |txn, arena| Ok(txn.on_response(response, arena)))
            .await?;
        Ok(true)
    }

    async fn handle_ack(&self, ack: &SipRequest) -> Result<bool, SipError> {
        let key = TransactionKey::from_request(ack, TransactionRole::Server)?;
        if let Some(entry) = self.lookup(&key).await {
            self.drive(&entry, |txn, arena| Ok(txn.on_ack(ack, arena))).await?;
            return Ok(true);
        }
        // ACK for a 2xx carries its own branch; it reaches the dialog layer
        Ok(false)
    }

    async fn handle_retransmission(&self, request: &SipRequest) -> Result<bool, SipError> {
        let key = TransactionKey::from_request(request, TransactionRole::Server)?;
        let Some(entry) = self.lookup(&key).await else {
            return Ok(false);
        };
        debug!("Retransmission for {}", key);
        self.drive(&entry, |txn, _| Ok(txn.on_retransmission())).await?;
        Ok(true)
    }

    /// CANCEL matching a server INVITE: answered 200 here, owner told
    async fn handle_cancel(&self, cancel: &SipRequest, incoming: &IncomingMessage) -> Result<bool, SipError> {
        let key = TransactionKey::from_request(cancel, TransactionRole::Server)?;
        if let Some(entry) = self.lookup(&key).await {
            self.drive(&entry, |txn, _| Ok(txn.on_retransmission())).await?;
            return Ok(true);
        }

        let Some(invite_entry) = self.lookup(&key.with_method(SipMethod::Invite)).await else {
            return Ok(false);
        };

        let ok = ResponseBuilder::ok().build_for_request(cancel)?;
        if let Some(handle) = self
            .start_server_transaction(cancel.clone(), incoming.reply_target())
            .await?
        {
            self.respond(&handle.key, ok).await?;
        }

        info!("CANCEL matched {}", key.with_method(SipMethod::Invite));
        self.drive(&invite_entry, |txn, _| Ok(txn.on_cancel(cancel)))
            .await?;
        Ok(true)
    }

    async fn on_timer(&self, id: TimerId, timer: TransactionTimer) {
        let Some(entry) = self.lookup(&timer.key).await else {
            return;
        };
        if let Err(e) = self
            .drive(&entry, |txn, arena| Ok(txn.on_timer(id, timer.timer, arena)))
            .await
        {
            warn!("Timer {:?} on {} failed: {}", timer.timer, timer.key, e);
        }
    }

    async fn lookup(&self, key: &TransactionKey) -> Option<SharedEntry> {
        self.transactions.read().await.get(key).cloned()
    }

    async fn insert(
        &self,
        txn: Transaction,
        replace: bool,
    ) -> Result<(mpsc::UnboundedReceiver<TransactionEvent>, SharedEntry), SipError> {
        let key = txn.key.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = Arc::new(Mutex::new(TransactionEntry {
            txn,
            events: Some(tx),
        }));

        let mut map = self.transactions.write().await;
        if map.contains_key(&key) && !replace {
            return Err(SipError::TransactionError(format!("{} already exists", key)));
        }
        let previous = map.insert(key.clone(), entry.clone());
        drop(map);

        // The replaced transaction may be mid-step; wait for it so its
        // timers cannot outlive it
        if let Some(previous) = previous {
            warn!("Replacing live transaction {}", key);
            let mut guard = previous.lock().await;
            guard.txn.terminate(&self.timers);
            guard.events = None;
        }
        Ok((rx, entry))
    }

    async fn remove(&self, key: &TransactionKey, entry: &SharedEntry) {
        let mut map = self.transactions.write().await;
        if map.get(key).map(|e| Arc::ptr_eq(e, entry)).unwrap_or(false) {
            map.remove(key);
        }
    }

    /// Run one step of a transaction under its lock, then perform what it
    /// asked for: transmissions go to the transport, events to the owner.
    async fn drive<F>(&self, entry: &SharedEntry, step: F) -> Result<(), SipError>
    where
        F: FnOnce(&mut Transaction, &TimerArena<TransactionTimer>) -> Result<Vec<TransactionOutput>, SipError>,
    {
        let (key, terminated) = {
            let mut guard = entry.lock().await;
            let before = guard.txn.state;
            let mut outputs = step(&mut guard.txn, &self.timers)?;

            let mut i = 0;
            while i < outputs.len() {
                match outputs[i].clone() {
                    TransactionOutput::Transmit(message) => {
                        let outgoing = OutgoingMessage {
                            message,
                            target: guard.txn.target.clone(),
                        };
                        if let Err(e) = self.transport.send(outgoing).await {
                            warn!("Transport error on {}: {}", guard.txn.key, e);
                            let extra = guard.txn.on_transport_error(e.to_string(), &self.timers);
                            outputs.extend(extra);
                        }
                    }
                    TransactionOutput::Event(event) => {
                        if let Some(events) = &guard.events {
                            // Owner may already be gone
                            let _ = events.send(event);
                        }
                    }
                }
                i += 1;
            }

            if before != guard.txn.state {
                debug!(
                    "Transaction {}: {} -> {}",
                    guard.txn.key,
                    before.name(),
                    guard.txn.state.name()
                );
            }
            let terminated = guard.txn.state.is_terminated();
            if terminated {
                guard.events = None;
            }
            (guard.txn.key.clone(), terminated)
        };

        if terminated {
            self.remove(&key, entry).await;
        }
        Ok(())
    }
}
