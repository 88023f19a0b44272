//! Stateful forking proxy (RFC 3261 Section 16)
//!
//! One context per forked server transaction. Branch outcomes are reduced
//! into exactly one final response:
//! - provisional responses above 100 are relayed as they come
//! - the first 2xx is relayed and the other branches are cancelled
//! - failures and timeouts replace the held candidate; the candidate is
//!   relayed once no branch is left

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::builder::{build_cancel, ResponseBuilder};
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use super::routing::strip_top_via;
use super::transaction::{TransactionEvent, TransactionKey};
use super::transaction_layer::{TransactionHandle, TransactionLayer};
use super::transport::SipTarget;

struct Branch {
    request: SipRequest,
    target: SipTarget,
    /// A provisional response was seen, so a CANCEL can reach the peer
    proceeding: bool,
}

struct ProxyContext {
    server_key: TransactionKey,
    request: SipRequest,
    branches: HashMap<TransactionKey, Branch>,
    /// Final response relayed when the last branch is gone
    candidate: SipResponse,
    /// Upstream CANCEL seen; the candidate stays 487
    cancelled: bool,
    closed: bool,
}

pub struct StatefulProxy {
    transactions: Arc<TransactionLayer>,
    contexts: RwLock<HashMap<TransactionKey, Arc<Mutex<ProxyContext>>>>,
}

impl StatefulProxy {
    pub fn new(transactions: Arc<TransactionLayer>) -> Arc<Self> {
        Arc::new(Self {
            transactions,
            contexts: RwLock::new(HashMap::new()),
        })
    }

    /// Forward `request` (received on `server`) to every prepared branch.
    /// Each branch request already carries its own Via and request-URI.
    pub async fn fork(
        self: &Arc<Self>,
        server: TransactionHandle,
        request: SipRequest,
        branches: Vec<(SipRequest, SipTarget)>,
    ) -> Result<(), SipError> {
        let server_key = server.key.clone();
        let candidate = ResponseBuilder::new(408).build_for_request(&request)?;
        let context = Arc::new(Mutex::new(ProxyContext {
            server_key: server_key.clone(),
            request,
            branches: HashMap::new(),
            candidate,
            cancelled: false,
            closed: false,
        }));
        self.contexts
            .write()
            .await
            .insert(server_key.clone(), Arc::clone(&context));
        self.watch_server(server);

        {
            let mut ctx = context.lock().await;
            for (branch_request, target) in branches {
                match self
                    .transactions
                    .start_client_transaction(branch_request.clone(), target.clone())
                    .await
                {
                    Ok(handle) => {
                        debug!("Proxy {}: branch {} started", server_key, handle.key);
                        ctx.branches.insert(
                            handle.key.clone(),
                            Branch {
                                request: branch_request,
                                target,
                                proceeding: false,
                            },
                        );
                        self.watch_branch(server_key.clone(), handle);
                    }
                    Err(e) => warn!("Proxy {}: could not start branch: {}", server_key, e),
                }
            }
            info!("Proxy {} forked to {} branches", server_key, ctx.branches.len());
            if ctx.branches.is_empty() {
                self.finish(&mut ctx).await;
            }
        }
        Ok(())
    }

    fn watch_branch(self: &Arc<Self>, server_key: TransactionKey, mut handle: TransactionHandle) {
        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = handle.events.recv().await {
                proxy.on_branch_event(&server_key, &handle.key, event).await;
            }
        });
    }

    fn watch_server(self: &Arc<Self>, mut handle: TransactionHandle) {
        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = handle.events.recv().await {
                match event {
                    TransactionEvent::Cancelled(_) => proxy.cancel(&handle.key).await,
                    TransactionEvent::TransportError(e) => {
                        warn!("Proxy {}: upstream transport error: {}", handle.key, e);
                        proxy.abandon(&handle.key).await;
                    }
                    _ => {}
                }
            }
            // Server transaction over: whatever is left goes silently
            proxy.abandon(&handle.key).await;
        });
    }

    async fn context(&self, server_key: &TransactionKey) -> Option<Arc<Mutex<ProxyContext>>> {
        self.contexts.read().await.get(server_key).cloned()
    }

    pub async fn context_count(&self) -> usize {
        self.contexts.read().await.len()
    }

    async fn on_branch_event(&self, server_key: &TransactionKey, branch_key: &TransactionKey, event: TransactionEvent) {
        let Some(context) = self.context(server_key).await else {
            debug!("Proxy {} gone, ignoring branch {}", server_key, branch_key);
            return;
        };
        let mut ctx = context.lock().await;
        if ctx.closed || !ctx.branches.contains_key(branch_key) {
            return;
        }

        let timed_out = matches!(event, TransactionEvent::Timeout);
        match event {
            TransactionEvent::Provisional(mut response) => {
                if let Some(branch) = ctx.branches.get_mut(branch_key) {
                    branch.proceeding = true;
                }
                if response.status_code() > 100 {
                    strip_top_via(&mut response);
                    self.relay(&ctx, response).await;
                }
            }
            TransactionEvent::Success(mut response) => {
                info!("Proxy {}: branch {} answered {}", server_key, branch_key, response.status_code());
                ctx.branches.remove(branch_key);
                strip_top_via(&mut response);
                self.relay(&ctx, response).await;
                self.cancel_branches(&mut ctx).await;
                self.close(&mut ctx).await;
            }
            TransactionEvent::Failure(mut response) => {
                debug!("Proxy {}: branch {} failed {}", server_key, branch_key, response.status_code());
                ctx.branches.remove(branch_key);
                if !ctx.cancelled {
                    strip_top_via(&mut response);
                    ctx.candidate = response;
                }
                if ctx.branches.is_empty() {
                    self.finish(&mut ctx).await;
                }
            }
            TransactionEvent::Timeout | TransactionEvent::TransportError(_) => {
                debug!("Proxy {}: branch {} timed out", server_key, branch_key);
                let branch = ctx.branches.remove(branch_key);
                // Timer C on a ringing INVITE branch: the callee still
                // has to be told to stop
                if let Some(branch) = branch.filter(|b| timed_out && b.proceeding) {
                    if ctx.request.method() == Some(SipMethod::Invite) {
                        self.send_cancel(&branch).await;
                    }
                }
                if !ctx.cancelled {
                    match ResponseBuilder::new(408).build_for_request(&ctx.request) {
                        Ok(timeout) => ctx.candidate = timeout,
                        Err(e) => warn!("Proxy {}: {}", server_key, e),
                    }
                }
                if ctx.branches.is_empty() {
                    self.finish(&mut ctx).await;
                }
            }
            TransactionEvent::AckReceived(_) | TransactionEvent::Cancelled(_) => {}
        }
    }

    /// Upstream CANCEL, or local cancellation of the whole fork. Calling it
    /// again has no effect.
    pub async fn cancel(&self, server_key: &TransactionKey) {
        let Some(context) = self.context(server_key).await else {
            return;
        };
        let mut ctx = context.lock().await;
        if ctx.closed || ctx.cancelled {
            return;
        }
        info!("Proxy {} cancelled", server_key);
        ctx.cancelled = true;
        match ResponseBuilder::new(487).build_for_request(&ctx.request) {
            Ok(terminated) => ctx.candidate = terminated,
            Err(e) => warn!("Proxy {}: {}", server_key, e),
        }
        // Proceeding branches stay until their 487 arrives
        self.cancel_branches(&mut ctx).await;
        if ctx.branches.is_empty() {
            self.finish(&mut ctx).await;
        }
    }

    /// CANCEL proceeding INVITE branches, abort the others locally
    async fn cancel_branches(&self, ctx: &mut ProxyContext) {
        let invite = ctx.request.method() == Some(SipMethod::Invite);
        let keys: Vec<TransactionKey> = ctx.branches.keys().cloned().collect();
        for key in keys {
            let proceeding = ctx.branches.get(&key).map(|b| b.proceeding).unwrap_or(false);
            if invite && proceeding {
                if let Some(branch) = ctx.branches.get(&key) {
                    self.send_cancel(branch).await;
                }
            } else {
                debug!("Proxy {}: dropping branch {}", ctx.server_key, key);
                self.transactions.terminate(&key).await;
                ctx.branches.remove(&key);
            }
        }
    }

    async fn send_cancel(&self, branch: &Branch) {
        let result = async {
            let cancel = build_cancel(&branch.request)?;
            debug!("Sending CANCEL to {}", branch.target);
            // Nobody waits for the CANCEL outcome
            self.transactions
                .start_client_transaction(cancel, branch.target.clone())
                .await
                .map(|_| ())
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to send CANCEL: {}", e);
        }
    }

    /// Server transaction ended without a final response from us
    async fn abandon(&self, server_key: &TransactionKey) {
        let Some(context) = self.context(server_key).await else {
            return;
        };
        let mut ctx = context.lock().await;
        if ctx.closed {
            return;
        }
        debug!("Proxy {} abandoned", server_key);
        let keys: Vec<TransactionKey> = ctx.branches.drain().map(|(k, _)| k).collect();
        for key in keys {
            self.transactions.terminate(&key).await;
        }
        self.close(&mut ctx).await;
    }

    /// Relay the candidate and close
    async fn finish(&self, ctx: &mut ProxyContext) {
        let candidate = ctx.candidate.clone();
        info!("Proxy {}: relaying final {}", ctx.server_key, candidate.status_code());
        self.relay(ctx, candidate).await;
        self.close(ctx).await;
    }

    async fn relay(&self, ctx: &ProxyContext, response: SipResponse) {
        if let Err(e) = self.transactions.respond(&ctx.server_key, response).await {
            debug!("Proxy {}: upstream no longer reachable: {}", ctx.server_key, e);
        }
    }

    async fn close(&self, ctx: &mut ProxyContext) {
        if ctx.closed {
            return;
        }
        ctx.closed = true;
        // Remaining branches (waiting for 487 after CANCEL) run on their own
        for key in ctx.branches.keys() {
            self.transactions.detach(key).await;
        }
        ctx.branches.clear();
        self.contexts.write().await.remove(&ctx.server_key);
        debug!("Proxy {} closed", ctx.server_key);
    }
}
