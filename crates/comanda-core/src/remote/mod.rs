//! Remote document mirror
//!
//! The remote side is a real-time document database: each collection maps to
//! a remote collection, each record to a document keyed by `id`.
//!
//! - `merge` performs a field-level merge upsert
//! - `delete` removes one document
//! - `fetch_all` reads a collection once
//! - `listen` delivers the full collection on every change to any document
//!
//! ## Implementations
//!
//! - [`MemoryRemote`]: in-process database, for tests and ephemeral setups
//! - [`WsRemote`]: WebSocket client speaking the CBOR protocol in [`message`]

pub mod memory;
pub mod message;
pub mod ws;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{Collection, Fields};

pub use memory::MemoryRemote;
pub use ws::{ConnectionStatus, WsRemote, WsRemoteConfig};

/// Errors reported by a remote mirror
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The remote could not be reached or is misconfigured
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    /// The connection is down; the request was not sent
    #[error("Not connected to the remote")]
    Disconnected,

    /// The remote refused the operation
    #[error("Remote rejected the operation: {0}")]
    Rejected(String),

    /// The remote sent something we could not understand
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote client has shut down
    #[error("Remote client closed")]
    Closed,
}

/// Result type for remote operations
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Live feed of full collection snapshots
///
/// Dropping the stream releases the listener on the remote side.
pub struct SnapshotStream {
    rx: mpsc::UnboundedReceiver<RemoteResult<Collection>>,
    release: Option<ListenerRelease>,
}

/// Releases a remote listener when dropped
///
/// Split off a [`SnapshotStream`] with [`SnapshotStream::take_release`] when
/// the owner of the listener is not the one reading it.
#[must_use = "dropping a ListenerRelease releases the listener"]
pub struct ListenerRelease(Option<Box<dyn FnOnce() + Send + Sync>>);

impl Drop for ListenerRelease {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

impl SnapshotStream {
    /// Wrap a receiver of snapshot events
    pub fn new(rx: mpsc::UnboundedReceiver<RemoteResult<Collection>>) -> Self {
        Self { rx, release: None }
    }

    /// Run `release` when the stream is dropped
    pub fn on_drop(mut self, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.release = Some(ListenerRelease(Some(Box::new(release))));
        self
    }

    /// Move the release hook out of the stream
    ///
    /// The listener then stays attached until the returned guard is dropped,
    /// however long the stream itself lives.
    pub fn take_release(&mut self) -> Option<ListenerRelease> {
        self.release.take()
    }

    /// Wait for the next snapshot or listener error
    ///
    /// Returns `None` once the remote side has hung up for good.
    pub async fn next(&mut self) -> Option<RemoteResult<Collection>> {
        self.rx.recv().await
    }
}

/// A remote document store the sync layer can mirror collections to
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Merge `fields` into document `id`, creating it if needed
    async fn merge(&self, collection: &str, id: &str, fields: &Fields) -> RemoteResult<()>;

    /// Delete document `id`; deleting a missing document succeeds
    async fn delete(&self, collection: &str, id: &str) -> RemoteResult<()>;

    /// Read every document of a collection once
    async fn fetch_all(&self, collection: &str) -> RemoteResult<Collection>;

    /// Start a live listener on a collection
    async fn listen(&self, collection: &str) -> RemoteResult<SnapshotStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_snapshot_stream_release_on_drop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();

        let mut stream = SnapshotStream::new(rx).on_drop(move || flag.store(true, Ordering::SeqCst));
        tx.send(Ok(Collection::new())).unwrap();
        assert_eq!(stream.next().await, Some(Ok(Collection::new())));
        assert!(!released.load(Ordering::SeqCst));

        drop(stream);
        assert!(released.load(Ordering::SeqCst));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_taken_release_outlives_stream() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();

        let mut stream = SnapshotStream::new(rx).on_drop(move || flag.store(true, Ordering::SeqCst));
        let release = stream.take_release().unwrap();
        assert!(stream.take_release().is_none());

        drop(stream);
        assert!(!released.load(Ordering::SeqCst));

        drop(release);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_error_display() {
        assert!(RemoteError::Disconnected.to_string().contains("Not connected"));
        assert!(RemoteError::Rejected("permission".into())
            .to_string()
            .contains("permission"));
    }
}
