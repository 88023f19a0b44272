//! sipflow - SIP transactions, dialogs and a forking proxy built with Rust
//!
//! This is a layered implementation of an RFC 3261 engine: a domain layer
//! (URIs, contact bindings, routing rules) and an infrastructure layer
//! (transaction layer, dialogs, stateful proxy, registrar).

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
