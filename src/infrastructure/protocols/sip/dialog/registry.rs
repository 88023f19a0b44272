//! Dialog layer: dialog lookup and the dialog timer task

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::invite_dialog::{Dialog, DialogTimer};
use super::{DialogCapabilities, DialogConfig, DialogEvent, DialogId, DialogRole};
use crate::infrastructure::protocols::sip::builder::ResponseBuilder;
use crate::infrastructure::protocols::sip::message::{SipError, SipHeaders, SipMethod, SipRequest};
use crate::infrastructure::protocols::sip::timer::TimerArena;
use crate::infrastructure::protocols::sip::transaction_layer::TransactionLayer;
use crate::infrastructure::protocols::sip::transport::{response_target, IncomingMessage, OutgoingMessage};

/// What the dialog layer did with an incoming message
#[derive(Debug)]
pub enum Delivery {
    /// Handed to a dialog, or answered here
    Delivered,
    /// INVITE without To tag: a new dialog for [`DialogLayer::accept_invite`]
    NewInvite(IncomingMessage),
    /// Not dialog traffic
    Unhandled(IncomingMessage),
}

pub struct DialogLayer {
    transactions: Arc<TransactionLayer>,
    dialogs: RwLock<HashMap<DialogId, Dialog>>,
    timers: Arc<TimerArena<DialogTimer>>,
    config: DialogConfig,
}

impl DialogLayer {
    pub fn new(transactions: Arc<TransactionLayer>, config: DialogConfig) -> Arc<Self> {
        Arc::new(Self {
            transactions,
            dialogs: RwLock::new(HashMap::new()),
            timers: Arc::new(TimerArena::new()),
            config,
        })
    }

    pub(crate) fn config(&self) -> &DialogConfig {
        &self.config
    }

    pub(crate) fn timers(&self) -> Arc<TimerArena<DialogTimer>> {
        Arc::clone(&self.timers)
    }

    pub(crate) fn transactions(&self) -> Arc<TransactionLayer> {
        Arc::clone(&self.transactions)
    }

    /// Spawn the task firing dialog timers. It stops once the layer is dropped.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let layer = Arc::downgrade(self);
        let timers = Arc::clone(&self.timers);
        tokio::spawn(async move {
            info!("Dialog layer timer task started");
            loop {
                let due = timers.next_due().await;
                if layer.upgrade().is_none() {
                    break;
                }
                for (id, timer) in due {
                    if let Some(shared) = timer.dialog.upgrade() {
                        Dialog::from_shared(shared).on_timer(id, timer.kind).await;
                    }
                }
            }
            info!("Dialog layer timer task stopped");
        })
    }

    /// New UAC dialog. Send its INVITE with [`Dialog::invite`].
    pub fn create_uac(
        self: &Arc<Self>,
        capabilities: DialogCapabilities,
    ) -> (Dialog, mpsc::UnboundedReceiver<DialogEvent>) {
        Dialog::new(self, DialogRole::Uac, capabilities)
    }

    /// New UAS dialog for an initial INVITE returned as [`Delivery::NewInvite`]
    pub async fn accept_invite(
        self: &Arc<Self>,
        incoming: IncomingMessage,
        capabilities: DialogCapabilities,
    ) -> Result<(Dialog, mpsc::UnboundedReceiver<DialogEvent>), SipError> {
        let (dialog, events) = Dialog::new(self, DialogRole::Uas, capabilities);
        dialog.accept(incoming).await?;
        Ok((dialog, events))
    }

    /// Route a message the transaction layer handed back
    pub async fn handle_incoming(&self, incoming: IncomingMessage) -> Delivery {
        if let Some(request) = incoming.message.as_request() {
            return self.handle_request(request.clone(), incoming).await;
        }
        let Some(response) = incoming.message.as_response() else {
            return Delivery::Unhandled(incoming);
        };

        let (Some(call_id), Some(local_tag)) = (response.call_id(), response.from_tag()) else {
            return Delivery::Unhandled(incoming);
        };
        let id = DialogId::new(call_id, local_tag, response.to_tag());
        match self.lookup(&id).await {
            Some(dialog) => {
                dialog.on_response(response).await;
                Delivery::Delivered
            }
            None => Delivery::Unhandled(incoming),
        }
    }

    async fn handle_request(&self, request: SipRequest, incoming: IncomingMessage) -> Delivery {
        let method = request.method();
        let to_tag = request.to_tag();

        if method == Some(SipMethod::Invite) && to_tag.is_none() {
            return Delivery::NewInvite(incoming);
        }
        let (Some(call_id), Some(local_tag)) = (request.call_id(), to_tag) else {
            if method == Some(SipMethod::Cancel) {
                self.reject(&request, &incoming, 481).await;
                return Delivery::Delivered;
            }
            return Delivery::Unhandled(incoming);
        };

        let id = DialogId::new(call_id, local_tag, request.from_tag());
        if let Some(dialog) = self.lookup(&id).await {
            dialog.on_request(incoming).await;
            return Delivery::Delivered;
        }

        if method == Some(SipMethod::Ack) {
            debug!("Dropping ACK for unknown dialog {}", id);
            return Delivery::Delivered;
        }
        debug!("No dialog {} for {:?}", id, method);
        self.reject(&request, &incoming, 481).await;
        Delivery::Delivered
    }

    /// Stateless rejection of a request no dialog owns
    async fn reject(&self, request: &SipRequest, incoming: &IncomingMessage, code: u16) {
        let result = async {
            let response = ResponseBuilder::new(code).build_for_request(request)?;
            match self
                .transactions
                .start_server_transaction(request.clone(), incoming.reply_target())
                .await?
            {
                Some(handle) => self.transactions.respond(&handle.key, response).await,
                None => {
                    let target = response_target(&response)?;
                    self.transactions
                        .transport()
                        .send(OutgoingMessage {
                            message: response.into(),
                            target,
                        })
                        .await
                }
            }
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to reject request from {}: {}", incoming.source, e);
        }
    }

    async fn lookup(&self, id: &DialogId) -> Option<Dialog> {
        let dialogs = self.dialogs.read().await;
        dialogs
            .get(id)
            .or_else(|| dialogs.get(&id.provisional()))
            .cloned()
    }

    pub async fn find(&self, id: &DialogId) -> Option<Dialog> {
        self.lookup(id).await
    }

    pub async fn dialog_count(&self) -> usize {
        self.dialogs.read().await.len()
    }

    pub(crate) async fn register(&self, id: DialogId, dialog: Dialog) {
        debug!("Registered dialog {}", id);
        self.dialogs.write().await.insert(id, dialog);
    }

    /// Swap the key once the remote tag is known (or changes with forking)
    pub(crate) async fn rekey(&self, old: &DialogId, new: DialogId, dialog: Dialog) {
        let mut dialogs = self.dialogs.write().await;
        if dialogs.get(old).map(|d| d.same(&dialog)).unwrap_or(false) {
            dialogs.remove(old);
        }
        debug!("Dialog {} now known as {}", old, new);
        dialogs.insert(new, dialog);
    }

    pub(crate) async fn unregister(&self, id: &DialogId, dialog: &Dialog) {
        let mut dialogs = self.dialogs.write().await;
        for key in [id.clone(), id.provisional()] {
            if dialogs.get(&key).map(|d| d.same(dialog)).unwrap_or(false) {
                dialogs.remove(&key);
            }
        }
    }
}
