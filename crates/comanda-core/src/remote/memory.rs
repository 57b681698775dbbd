//! In-process remote document store
//!
//! Behaves like the real-time database the sync layer mirrors to: merge
//! upserts, deletes, one-shot reads and live snapshot listeners that fire
//! once on attach and again after every change.
//!
//! It can also play the misbehaving network: fail writes, refuse to listen,
//! hold writes pending until released, and apply writes from another device.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{RemoteError, RemoteResult, RemoteStore, SnapshotStream};
use crate::models::{Collection, Fields, Record};

type Listener = mpsc::UnboundedSender<RemoteResult<Collection>>;

enum Write {
    Merge {
        collection: String,
        id: String,
        fields: Fields,
    },
    Delete {
        collection: String,
        id: String,
    },
}

#[derive(Default)]
struct State {
    collections: HashMap<String, Collection>,
    listeners: HashMap<String, Vec<(u64, Listener)>>,
    next_listener: u64,
    held: Vec<(Write, oneshot::Sender<()>)>,
    hold_writes: bool,
    fail_writes: bool,
    unavailable: bool,
}

impl State {
    fn apply(&mut self, write: Write) -> String {
        match write {
            Write::Merge {
                collection,
                id,
                fields,
            } => {
                let records = self.collections.entry(collection.clone()).or_default();
                match records.iter_mut().find(|record| record.id() == id) {
                    Some(record) => record.merge(&fields),
                    None => records.push(Record::from_fields(id, fields)),
                }
                collection
            }
            Write::Delete { collection, id } => {
                if let Some(records) = self.collections.get_mut(&collection) {
                    records.retain(|record| record.id() != id);
                }
                collection
            }
        }
    }

    fn broadcast(&mut self, collection: &str) {
        let snapshot = self.collections.get(collection).cloned().unwrap_or_default();
        if let Some(listeners) = self.listeners.get_mut(collection) {
            listeners.retain(|(_, listener)| listener.send(Ok(snapshot.clone())).is_ok());
        }
    }
}

/// In-memory implementation of [`RemoteStore`]
#[derive(Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Put documents in place without notifying listeners
    pub fn seed(&self, collection: &str, records: Collection) {
        self.state()
            .collections
            .insert(collection.to_string(), records);
    }

    /// Current documents of a collection
    pub fn documents(&self, collection: &str) -> Collection {
        self.state()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace a collection and push the snapshot to its listeners
    pub fn emit_snapshot(&self, collection: &str, records: Collection) {
        let mut state = self.state();
        state.collections.insert(collection.to_string(), records);
        state.broadcast(collection);
    }

    /// Push a listener error to every listener of a collection
    pub fn emit_error(&self, collection: &str, error: RemoteError) {
        let mut state = self.state();
        if let Some(listeners) = state.listeners.get_mut(collection) {
            listeners.retain(|(_, listener)| listener.send(Err(error.clone())).is_ok());
        }
    }

    /// Apply a merge made by another client
    pub fn external_merge(&self, collection: &str, id: &str, fields: Fields) {
        let mut state = self.state();
        let collection = state.apply(Write::Merge {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        });
        state.broadcast(&collection);
    }

    /// Apply a delete made by another client
    pub fn external_delete(&self, collection: &str, id: &str) {
        let mut state = self.state();
        let collection = state.apply(Write::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        state.broadcast(&collection);
    }

    /// Make merges and deletes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Make reads and listeners fail as if the remote were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Keep subsequent writes pending until [`release_writes`](Self::release_writes)
    pub fn hold_writes(&self, hold: bool) {
        self.state().hold_writes = hold;
    }

    /// Apply every held write in arrival order and resolve their callers
    pub fn release_writes(&self) {
        let mut state = self.state();
        state.hold_writes = false;
        let held = std::mem::take(&mut state.held);
        for (write, done) in held {
            let collection = state.apply(write);
            state.broadcast(&collection);
            let _ = done.send(());
        }
    }

    /// Number of writes waiting to be released
    pub fn held_writes(&self) -> usize {
        self.state().held.len()
    }

    /// Number of live listeners on a collection
    pub fn listener_count(&self, collection: &str) -> usize {
        self.state()
            .listeners
            .get(collection)
            .map(|listeners| listeners.iter().filter(|(_, l)| !l.is_closed()).count())
            .unwrap_or(0)
    }

    async fn write(&self, write: Write) -> RemoteResult<()> {
        let pending = {
            let mut state = self.state();
            if state.fail_writes {
                return Err(RemoteError::Rejected("write refused".to_string()));
            }
            if state.hold_writes {
                let (done_tx, done_rx) = oneshot::channel();
                state.held.push((write, done_tx));
                Some(done_rx)
            } else {
                let collection = state.apply(write);
                state.broadcast(&collection);
                None
            }
        };

        if let Some(done) = pending {
            debug!("Remote write held");
            done.await.map_err(|_| RemoteError::Closed)?;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn merge(&self, collection: &str, id: &str, fields: &Fields) -> RemoteResult<()> {
        self.write(Write::Merge {
            collection: collection.to_string(),
            id: id.to_string(),
            fields: fields.clone(),
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> RemoteResult<()> {
        self.write(Write::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        })
        .await
    }

    async fn fetch_all(&self, collection: &str) -> RemoteResult<Collection> {
        let state = self.state();
        if state.unavailable {
            return Err(RemoteError::Unavailable("memory remote offline".to_string()));
        }
        Ok(state.collections.get(collection).cloned().unwrap_or_default())
    }

    async fn listen(&self, collection: &str) -> RemoteResult<SnapshotStream> {
        let mut state = self.state();
        if state.unavailable {
            return Err(RemoteError::Unavailable("memory remote offline".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = state.collections.get(collection).cloned().unwrap_or_default();
        let _ = tx.send(Ok(snapshot));
        state.next_listener += 1;
        let listener_id = state.next_listener;
        state
            .listeners
            .entry(collection.to_string())
            .or_default()
            .push((listener_id, tx));

        let shared = self.state.clone();
        let collection = collection.to_string();
        Ok(SnapshotStream::new(rx).on_drop(move || {
            if let Some(listeners) = lock(&shared).listeners.get_mut(&collection) {
                listeners.retain(|(id, _)| *id != listener_id);
            }
        }))
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
