//! Domain layer - Core business logic and rules
//!
//! This layer contains:
//! - Value Objects: SIP URIs
//! - Entities: contact bindings
//! - Repository Interfaces: the location store port
//! - Domain Services: next-hop routing rules

pub mod location;
pub mod routing;
pub mod shared;

// Re-export commonly used types
pub use shared::{DomainError, Result};
