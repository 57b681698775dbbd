//! Comanda Core Library
//!
//! This crate provides the data layer of Comanda, a restaurant ordering
//! application: an offline-first collection store that mirrors to a remote
//! real-time document database and fans changes out to subscribers.
//!
//! # Architecture
//!
//! - **Local cache**: every collection is kept in memory and persisted as a
//!   JSON blob, so the app keeps working offline and across restarts
//! - **Remote mirror**: writes are forwarded to the remote, and remote
//!   snapshots overwrite the local copy (last writer wins)
//!
//! # Quick Start
//!
//! ```text
//! let store = SyncStore::open(&Config::load()?).await;
//!
//! let orders = store.subscribe("orders", |orders| render(orders));
//! store.save("orders", "o1", patch).await;
//! let coupons = store.get_all("coupons", Vec::new()).await;
//! ```
//!
//! # Modules
//!
//! - `store`: Sync store (main entry point)
//! - `models`: Records, collections and well-known collection names
//! - `storage`: Local persistence and cache
//! - `remote`: Remote mirror contract, in-memory and WebSocket implementations
//! - `config`: Application configuration

pub mod config;
pub mod models;
pub mod remote;
pub mod storage;
pub mod store;

pub use config::Config;
pub use models::{collections, Collection, Fields, Record};
pub use remote::{MemoryRemote, RemoteError, RemoteStore, WsRemote};
pub use storage::{LocalCache, StorageError, StorageStats};
pub use store::{Subscription, SyncStore};
