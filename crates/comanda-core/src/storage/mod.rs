//! Storage layer
//!
//! Handles the local, offline-first copy of every collection.
//!
//! ## Architecture
//!
//! - **Persistence**: atomic single-key blob storage (files or memory)
//! - **LocalCache**: per-collection in-memory state, written through to
//!   persistence as one JSON array per collection
//!
//! Persistence failures never surface to callers of the cache; they are
//! logged and the in-memory state stays authoritative for the session.

pub mod cache;
pub mod error;
pub mod persistence;

pub use cache::{LocalCache, StorageStats};
pub use error::{StorageError, StorageResult};
pub use persistence::{FilePersistence, MemoryPersistence, Persistence};
