//! Object storage boundary.
//!
//! This crate provides:
//! - The [`ObjectStore`] trait used by workers for artifact I/O
//! - A local filesystem store
//! - An in-memory store for tests and single-process development

pub mod error;
pub mod local;
pub mod memory;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use local::LocalFsStore;
pub use memory::MemoryStore;
pub use store::{validate_key, ObjectStore};
