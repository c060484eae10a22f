//! Graph storage collaborators
//!
//! The core consumes storage through the `GraphTransaction` trait; the
//! in-process `MemoryGraph` backs the server and the tests.

// Entity shape shared by nodes and relationships
pub mod entity;

// Transactional storage interface and in-memory implementation
pub mod store;

// Binary content storage providers
pub mod files;

pub use entity::{Entity, EntityKind};
pub use files::{LocalStorageProvider, StorageProvider, StorageProviders};
pub use store::{Direction, GraphError, GraphTransaction, MemoryGraph, MemoryTransaction};
