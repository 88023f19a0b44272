//! Persistence implementations

pub mod location_repository;

pub use location_repository::InMemoryLocationStore;
