//! Domain errors

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DomainError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Location store backend failure
    #[error("Storage error: {0}")]
    Storage(String),
}
