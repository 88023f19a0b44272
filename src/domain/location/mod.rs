//! Location context - user contact bindings

pub mod binding;
pub mod repository;

pub use binding::ContactBinding;
pub use repository::LocationStore;
