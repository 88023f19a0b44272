//! SIP server: dispatch of everything the transaction layer hands back
//!
//! Requests are validated, then either handled by a local handler
//! (registrar, OPTIONS) or forked through the stateful proxy. ACKs for 2xx
//! and stray responses are forwarded statelessly.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::auth::{AuthOutcome, AuthRole, Authenticator};
use super::builder::ResponseBuilder;
use super::handler::SipHandler;
use super::message::{SipError, SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
use super::proxy::StatefulProxy;
use super::routing::{
    classify, rewrite_strict_route, stamp_source, update_proxying_request, update_proxying_response,
    validate_request, Destination, ServerProfile,
};
use super::transaction::TransactionKey;
use super::transaction_layer::{TransactionHandle, TransactionLayer};
use super::transport::{IncomingMessage, OutgoingMessage, SipTarget};
use crate::domain::location::LocationStore;
use crate::domain::routing::RoutingTable;
use crate::domain::shared::SipUri;

/// Proxy and registrar front end
pub struct SipServer {
    profile: ServerProfile,
    transactions: Arc<TransactionLayer>,
    proxy: Arc<StatefulProxy>,
    location: Arc<dyn LocationStore>,
    routing: RoutingTable,
    proxy_auth: Option<Arc<dyn Authenticator>>,
    /// Forward requests for foreign domains that match no rule
    open_proxy: bool,
    handlers: RwLock<HashMap<SipMethod, Arc<dyn SipHandler>>>,
}

/// Where a request goes after classification
enum Forwarding {
    /// One branch per request-URI
    Targets(Vec<String>),
    /// Keep the request-URI as is
    PassThrough,
    Reject(u16),
}

impl SipServer {
    pub fn new(profile: ServerProfile, transactions: Arc<TransactionLayer>, location: Arc<dyn LocationStore>) -> Self {
        let proxy = StatefulProxy::new(Arc::clone(&transactions));
        Self {
            profile,
            transactions,
            proxy,
            location,
            routing: RoutingTable::default(),
            proxy_auth: None,
            open_proxy: false,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_routing(mut self, routing: RoutingTable) -> Self {
        self.routing = routing;
        self
    }

    /// Require authentication before forwarding anything
    pub fn with_proxy_auth(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.proxy_auth = Some(auth);
        self
    }

    pub fn open_proxy(mut self, open: bool) -> Self {
        self.open_proxy = open;
        self
    }

    pub fn profile(&self) -> &ServerProfile {
        &self.profile
    }

    pub fn proxy(&self) -> Arc<StatefulProxy> {
        Arc::clone(&self.proxy)
    }

    pub async fn register_handler(&self, method: SipMethod, handler: Arc<dyn SipHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(method, handler);
        info!("Registered handler for SIP method: {}", method);
    }

    /// Entry point for every message received by the transport
    pub async fn handle_incoming(&self, mut incoming: IncomingMessage) -> Result<(), SipError> {
        stamp_source(&mut incoming);
        let Some(incoming) = self.transactions.handle_incoming(incoming).await else {
            return Ok(());
        };

        match &incoming.message {
            SipMessage::Request(request) => {
                debug!("Processing SIP request: {:?} from {}", request.method(), incoming.source);
                self.handle_request(request.clone(), &incoming).await
            }
            SipMessage::Response(response) => self.forward_response(response.clone()).await,
        }
    }

    async fn handle_request(&self, request: SipRequest, incoming: &IncomingMessage) -> Result<(), SipError> {
        match request.method() {
            Some(SipMethod::Ack) => return self.forward_ack(request).await,
            Some(SipMethod::Cancel) => {
                // The transaction layer answers CANCELs it can match
                debug!("CANCEL matches no transaction");
                return self.reply_stateless(&request, incoming, 481).await;
            }
            _ => {}
        }

        let Some(server) = self
            .transactions
            .start_server_transaction(request.clone(), incoming.reply_target())
            .await?
        else {
            debug!("Retransmission absorbed for {}", request.uri_string());
            return Ok(());
        };

        if let Err(code) = validate_request(&request, &self.profile) {
            return self.respond(&server.key, &request, code).await;
        }

        let mut request = request;
        rewrite_strict_route(&mut request, &self.profile)?;

        let destination = classify(&request, &self.profile, self.location.as_ref()).await?;
        debug!("{} classified as {:?}", request.uri_string(), destination);
        match destination {
            Destination::LocalServer => self.handle_locally(server, request).await,
            destination => self.proxy_request(server, request, destination).await,
        }
    }

    async fn handle_locally(&self, server: TransactionHandle, request: SipRequest) -> Result<(), SipError> {
        let handler = match request.method() {
            Some(method) => self.handlers.read().await.get(&method).cloned(),
            None => None,
        };
        let Some(handler) = handler else {
            warn!("No handler registered for method: {:?}", request.method());
            return self.respond(&server.key, &request, 501).await;
        };

        let response = match handler.handle_request(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                error!("Handler error: {}", e);
                ResponseBuilder::new(500).build_for_request(&request)?
            }
        };
        self.transactions.respond(&server.key, response).await
    }

    async fn proxy_request(
        &self,
        server: TransactionHandle,
        request: SipRequest,
        destination: Destination,
    ) -> Result<(), SipError> {
        let authenticated = match &self.proxy_auth {
            Some(auth) => match auth.authenticate(&request, AuthRole::Proxy).await? {
                AuthOutcome::Authenticated(user) => {
                    debug!("Request authenticated for {}", user);
                    true
                }
                AuthOutcome::Challenge(challenge) => {
                    info!("Challenging {} for {}", request.uri_string(), request.call_id().unwrap_or_default());
                    return self.transactions.respond(&server.key, challenge).await;
                }
            },
            None => false,
        };

        let targets = match self.forwarding(&request, destination, authenticated).await? {
            Forwarding::Reject(code) => {
                info!("Rejecting {} with {}", request.uri_string(), code);
                return self.respond(&server.key, &request, code).await;
            }
            Forwarding::PassThrough => vec![None],
            Forwarding::Targets(targets) => targets.into_iter().map(Some).collect(),
        };

        if request.method() == Some(SipMethod::Invite) {
            let trying = ResponseBuilder::trying().build_for_request(&request)?;
            self.transactions.respond(&server.key, trying).await?;
        }

        let mut branches: Vec<(SipRequest, SipTarget)> = Vec::with_capacity(targets.len());
        for target in targets {
            let mut branch = request.clone();
            match update_proxying_request(&mut branch, &self.profile, target.as_deref()) {
                Ok(destination) => branches.push((branch, destination)),
                Err(e) => warn!("Skipping target {:?}: {}", target, e),
            }
        }
        self.proxy.fork(server, request, branches).await
    }

    /// Targets for a request that is not for this server
    async fn forwarding(
        &self,
        request: &SipRequest,
        destination: Destination,
        authenticated: bool,
    ) -> Result<Forwarding, SipError> {
        if self.routed_through_us(request) {
            return Ok(Forwarding::PassThrough);
        }

        let uri = SipUri::parse(&request.uri_string())?;
        let rule = self
            .routing
            .next_hop(&uri, authenticated)
            .map(|hop| apply_next_hop(&uri, hop))
            .transpose()?;

        let forwarding = match destination {
            Destination::LocalUser(user) => {
                let contacts: Vec<String> = self
                    .location
                    .contacts_of(&user)
                    .await?
                    .into_iter()
                    .map(|binding| binding.uri)
                    .collect();
                if !contacts.is_empty() {
                    debug!("{} has {} contacts", user, contacts.len());
                    Forwarding::Targets(contacts)
                } else if let Some(hop) = rule {
                    Forwarding::Targets(vec![hop])
                } else {
                    Forwarding::Reject(480)
                }
            }
            Destination::UnknownLocalUser(_) => match rule {
                Some(hop) => Forwarding::Targets(vec![hop]),
                None => Forwarding::Reject(404),
            },
            Destination::RemoteUa | Destination::LocalServer => match rule {
                Some(hop) => Forwarding::Targets(vec![hop]),
                None if self.open_proxy => Forwarding::PassThrough,
                None => Forwarding::Reject(403),
            },
        };
        Ok(forwarding)
    }

    /// The top Route is this node: an in-dialog request on a route we
    /// recorded, or an explicitly routed one
    fn routed_through_us(&self, request: &SipRequest) -> bool {
        request
            .routes()
            .first()
            .and_then(|route| SipUri::parse(route).ok())
            .map(|uri| self.profile.is_self(&uri))
            .unwrap_or(false)
    }

    /// ACK for a 2xx: no transaction, forwarded as is
    async fn forward_ack(&self, mut request: SipRequest) -> Result<(), SipError> {
        if validate_request(&request, &self.profile).is_err() {
            debug!("Dropping ACK that failed validation");
            return Ok(());
        }
        rewrite_strict_route(&mut request, &self.profile)?;

        let uri = SipUri::parse(&request.uri_string())?;
        if self.profile.is_local(&uri) && !self.routed_through_us(&request) {
            debug!("Dropping ACK for this server");
            return Ok(());
        }

        let target = update_proxying_request(&mut request, &self.profile, None)?;
        debug!("Forwarding ACK statelessly to {}", target);
        self.transactions
            .transport()
            .send(OutgoingMessage {
                message: request.into(),
                target,
            })
            .await
    }

    /// Response no client transaction claimed (2xx retransmissions)
    async fn forward_response(&self, mut response: SipResponse) -> Result<(), SipError> {
        let ours = response
            .top_via()
            .map(|via| via.is_from(&self.profile.host, self.profile.port))
            .unwrap_or(false);
        if !ours {
            debug!("Dropping stray {} response not sent through us", response.status_code());
            return Ok(());
        }

        let target = update_proxying_response(&mut response)?;
        debug!("Forwarding {} response statelessly to {}", response.status_code(), target);
        self.transactions
            .transport()
            .send(OutgoingMessage {
                message: response.into(),
                target,
            })
            .await
    }

    async fn respond(&self, key: &TransactionKey, request: &SipRequest, code: u16) -> Result<(), SipError> {
        let response = ResponseBuilder::new(code).build_for_request(request)?;
        self.transactions.respond(key, response).await
    }

    /// Answer through a fresh server transaction so retransmissions are absorbed
    async fn reply_stateless(&self, request: &SipRequest, incoming: &IncomingMessage, code: u16) -> Result<(), SipError> {
        match self
            .transactions
            .start_server_transaction(request.clone(), incoming.reply_target())
            .await?
        {
            Some(server) => self.respond(&server.key, request, code).await,
            None => Ok(()),
        }
    }
}

/// Request-URI for a routing rule: the next hop's host and port, keeping the
/// original user part
fn apply_next_hop(uri: &SipUri, next_hop: &str) -> Result<String, SipError> {
    let hop = SipUri::parse(next_hop)?;
    Ok(uri.with_host_port(hop.host(), hop.port()).to_string())
}
