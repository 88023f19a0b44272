//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Repository implementations (in-memory location store)
//! - Protocol implementations (SIP engine, proxy, registrar)

pub mod persistence;
pub mod protocols;
