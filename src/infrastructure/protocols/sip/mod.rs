//! SIP protocol implementation
//!
//! This module implements a SIP (Session Initiation Protocol) engine based on RFC 3261.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Application Layer     │
//! │ (Server, Proxy, Dialog) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │  (Client/Server TXN)    │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Facade      │
//! │   (UDP, in-process)     │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod dialog;
pub mod handler;
pub mod message;
pub mod proxy;
pub mod registrar;
pub mod routing;
pub mod server;
pub mod timer;
pub mod transaction;
pub mod transaction_layer;
pub mod transport;
pub mod via;

pub use auth::{AuthChallenge, AuthOutcome, AuthRole, Authenticator, DigestAuth};
pub use dialog::{
    Body, CloseReason, Credentials, Delivery, Dialog, DialogCapabilities, DialogConfig, DialogEvent, DialogId,
    DialogLayer, DialogRole, DialogState, OfferMode,
};
pub use handler::{OptionsHandler, SipHandler};
pub use message::{SipError, SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
pub use proxy::StatefulProxy;
pub use registrar::{Registrar, RegistrarSettings};
pub use routing::{Destination, ServerProfile};
pub use server::SipServer;
pub use transaction::{SipTimers, TransactionEvent, TransactionKey, TransactionRole, TransactionState};
pub use transaction_layer::{TransactionHandle, TransactionLayer};
pub use transport::{
    ChannelTransport, IncomingMessage, OutgoingMessage, SipTarget, TransportFacade, TransportProtocol, UdpTransport,
};
