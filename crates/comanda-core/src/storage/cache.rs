//! Local collection cache
//!
//! Keeps every touched collection in memory and mirrors it to a
//! [`Persistence`] backend as one JSON array per collection, stored under
//! `<prefix><collection>`. Collections are loaded lazily on first access.
//!
//! Persistence is best effort: a failed write is logged and the in-memory
//! state still changes, so the current session keeps working.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::error::StorageError;
use super::persistence::{MemoryPersistence, Persistence};
use crate::config::DEFAULT_CACHE_PREFIX;
use crate::models::{Collection, Fields, Record};

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Number of collections with a persisted blob
    pub collections: usize,
    /// Number of records across those collections
    pub records: usize,
    /// Bytes used by the persisted blobs
    pub stored_bytes: u64,
}

impl StorageStats {
    /// Get stored size as human-readable string
    pub fn stored_size_human(&self) -> String {
        format_bytes(self.stored_bytes)
    }
}

/// In-memory view of all collections, backed by a persistence layer
pub struct LocalCache {
    persistence: Arc<dyn Persistence>,
    prefix: String,
    collections: HashMap<String, Collection>,
    /// Collections changed this session, persisted or not
    written: HashSet<String>,
}

impl LocalCache {
    /// Create a cache over the given persistence backend
    pub fn new(persistence: Arc<dyn Persistence>, prefix: impl Into<String>) -> Self {
        Self {
            persistence,
            prefix: prefix.into(),
            collections: HashMap::new(),
            written: HashSet::new(),
        }
    }

    /// Create a cache that keeps nothing beyond the process
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPersistence::new()), DEFAULT_CACHE_PREFIX)
    }

    /// Key a collection's blob is stored under
    pub fn key_for(&self, collection: &str) -> String {
        format!("{}{}", self.prefix, collection)
    }

    /// Current contents of a collection
    pub fn get_all(&mut self, collection: &str) -> Collection {
        self.load(collection).clone()
    }

    /// A single record, if present
    pub fn get(&mut self, collection: &str, id: &str) -> Option<Record> {
        self.load(collection)
            .iter()
            .find(|record| record.id() == id)
            .cloned()
    }

    /// Merge `patch` into the record `id`, appending it if unknown
    ///
    /// Returns the collection contents after the merge.
    pub fn upsert_merge(&mut self, collection: &str, id: &str, patch: &Fields) -> Collection {
        let records = self.load(collection);
        match records.iter_mut().find(|record| record.id() == id) {
            Some(record) => record.merge(patch),
            None => records.push(Record::from_fields(id, patch.clone())),
        }

        let snapshot = records.clone();
        self.persist(collection, &snapshot);
        snapshot
    }

    /// Remove the record `id`
    ///
    /// Returns the new contents, or `None` when nothing was removed.
    pub fn remove(&mut self, collection: &str, id: &str) -> Option<Collection> {
        let records = self.load(collection);
        let before = records.len();
        records.retain(|record| record.id() != id);
        if records.len() == before {
            return None;
        }

        let snapshot = records.clone();
        self.persist(collection, &snapshot);
        Some(snapshot)
    }

    /// Overwrite a collection wholesale (remote snapshots)
    ///
    /// Duplicate ids keep the position of their first occurrence and the
    /// value of their last.
    pub fn replace(&mut self, collection: &str, records: Collection) -> Collection {
        let records = dedup_by_id(records);
        self.collections
            .insert(collection.to_string(), records.clone());
        self.persist(collection, &records);
        records
    }

    /// Names of every collection that was written or has a persisted blob
    ///
    /// Collections that were only read are not listed.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.written.iter().cloned().collect();
        match self.persistence.keys() {
            Ok(keys) => names.extend(
                keys.into_iter()
                    .filter_map(|key| key.strip_prefix(&self.prefix).map(str::to_string)),
            ),
            Err(e) => warn!(error = %e, "Failed to list cached collections"),
        }
        names.sort();
        names.dedup();
        names
    }

    /// Gather storage statistics
    pub fn stats(&mut self) -> StorageStats {
        let persisted: Vec<String> = match self.persistence.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|key| key.strip_prefix(&self.prefix).map(str::to_string))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list cached collections");
                Vec::new()
            }
        };

        let records = persisted
            .iter()
            .map(|name| self.load(name).len())
            .sum::<usize>();

        StorageStats {
            collections: persisted.len(),
            records,
            stored_bytes: self.persistence.stored_bytes(),
        }
    }

    fn load(&mut self, collection: &str) -> &mut Collection {
        let key = self.key_for(collection);
        let persistence = &self.persistence;
        self.collections
            .entry(collection.to_string())
            .or_insert_with(|| read_blob(persistence.as_ref(), &key))
    }

    fn persist(&mut self, collection: &str, records: &Collection) {
        self.written.insert(collection.to_string());
        let key = self.key_for(collection);
        let result = serde_json::to_vec(records)
            .map_err(StorageError::from)
            .and_then(|bytes| self.persistence.write(&key, &bytes));

        if let Err(e) = result {
            warn!(
                collection,
                error = %e,
                suggestion = e.recovery_suggestion().unwrap_or(""),
                "Failed to persist collection; keeping in-memory state"
            );
        }
    }
}

fn read_blob(persistence: &dyn Persistence, key: &str) -> Collection {
    let bytes = match persistence.read(key) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Collection::new(),
        Err(e) => {
            warn!(key, error = %e, "Failed to read cached collection");
            return Collection::new();
        }
    };

    match serde_json::from_slice::<Collection>(&bytes) {
        Ok(records) => {
            debug!(key, records = records.len(), "Loaded cached collection");
            dedup_by_id(records)
        }
        Err(e) => {
            let backup_path = persistence.quarantine(key).unwrap_or_else(|qe| {
                warn!(key, error = %qe, "Failed to move corrupted blob aside");
                None
            });
            let err = StorageError::CorruptBlob {
                key: key.to_string(),
                backup_path,
                details: e.to_string(),
            };
            warn!(error = %err, "Starting collection empty");
            Collection::new()
        }
    }
}

fn dedup_by_id(records: Collection) -> Collection {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut unique: Collection = Vec::with_capacity(records.len());
    for record in records {
        match index.get(record.id()) {
            Some(&position) => unique[position] = record,
            None => {
                index.insert(record.id().to_string(), unique.len());
                unique.push(record);
            }
        }
    }
    unique
}

/// Format bytes as human-readable string
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fields_from_value;
    use crate::storage::FilePersistence;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn patch(value: Value) -> Fields {
        fields_from_value(value).unwrap()
    }

    fn file_cache(temp_dir: &TempDir) -> LocalCache {
        LocalCache::new(
            Arc::new(FilePersistence::new(temp_dir.path())),
            DEFAULT_CACHE_PREFIX,
        )
    }

    #[test]
    fn test_unknown_collection_is_empty() {
        let mut cache = LocalCache::in_memory();
        assert!(cache.get_all("products").is_empty());
        assert!(cache.get("products", "p1").is_none());
    }

    #[test]
    fn test_upsert_merge_appends_then_merges() {
        let mut cache = LocalCache::in_memory();

        cache.upsert_merge("orders", "o1", &patch(json!({"status": "NOVO", "total": 30})));
        cache.upsert_merge("orders", "o2", &patch(json!({"status": "NOVO"})));
        let records = cache.upsert_merge("orders", "o1", &patch(json!({"status": "PRONTO"})));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id(), "o1");
        assert_eq!(records[0].get_str("status"), Some("PRONTO"));
        assert_eq!(records[0].get("total"), Some(&json!(30)));
        assert_eq!(records[1].id(), "o2");
    }

    #[test]
    fn test_remove_reports_change() {
        let mut cache = LocalCache::in_memory();
        cache.upsert_merge("coupons", "c1", &patch(json!({"code": "A"})));

        assert!(cache.remove("coupons", "missing").is_none());
        let remaining = cache.remove("coupons", "c1").unwrap();
        assert!(remaining.is_empty());
        assert!(cache.get_all("coupons").is_empty());
    }

    #[test]
    fn test_replace_dedups() {
        let mut cache = LocalCache::in_memory();
        let snapshot = vec![
            Record::from_fields("a", patch(json!({"v": 1}))),
            Record::from_fields("b", patch(json!({"v": 2}))),
            Record::from_fields("a", patch(json!({"v": 3}))),
        ];

        let stored = cache.replace("products", snapshot);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].id(), "a");
        assert_eq!(stored[0].get("v"), Some(&json!(3)));
        assert_eq!(stored[1].id(), "b");
    }

    #[test]
    fn test_blob_layout_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = file_cache(&temp_dir);

        cache.upsert_merge("settings", "store", &patch(json!({"open": true})));

        let path = temp_dir.path().join("comanda_settings.json");
        let blob: Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(blob, json!([{"id": "store", "open": true}]));
    }

    #[test]
    fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut cache = file_cache(&temp_dir);
            cache.upsert_merge("products", "p1", &patch(json!({"name": "Pizza"})));
            cache.upsert_merge("products", "p2", &patch(json!({"name": "Suco"})));
        }

        let mut cache = file_cache(&temp_dir);
        let records = cache.get_all("products");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get_str("name"), Some("Pizza"));
        assert_eq!(cache.collection_names(), vec!["products".to_string()]);
    }

    #[test]
    fn test_corrupt_blob_starts_empty_and_is_backed_up() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("comanda_orders.json"), b"[{\"id\":").unwrap();

        let mut cache = file_cache(&temp_dir);
        assert!(cache.get_all("orders").is_empty());
        assert!(temp_dir
            .path()
            .join("comanda_orders.json.corrupt.backup")
            .exists());

        // The collection is usable again afterwards
        cache.upsert_merge("orders", "o1", &patch(json!({"status": "NOVO"})));
        assert_eq!(cache.get_all("orders").len(), 1);
    }

    #[test]
    fn test_failed_persist_keeps_memory_state() {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence.set_fail_writes(true);
        let mut cache = LocalCache::new(persistence.clone(), "comanda_");

        cache.upsert_merge("customers", "u1", &patch(json!({"points": 10})));

        assert_eq!(cache.get("customers", "u1").unwrap().get("points"), Some(&json!(10)));
        assert!(persistence.read("comanda_customers").unwrap().is_none());
    }

    #[test]
    fn test_prefix_namespaces_keys() {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut loja1 = LocalCache::new(persistence.clone(), "loja1_");
        let mut loja2 = LocalCache::new(persistence.clone(), "loja2_");

        loja1.upsert_merge("products", "p1", &patch(json!({})));

        assert_eq!(loja1.key_for("products"), "loja1_products");
        assert!(loja2.get_all("products").is_empty());
        assert_eq!(loja2.collection_names(), Vec::<String>::new());
    }

    #[test]
    fn test_reads_do_not_list_collections() {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence.set_fail_writes(true);
        let mut cache = LocalCache::new(persistence, "comanda_");

        cache.get_all("categories");
        cache.get("orders", "o1");
        assert!(cache.remove("coupons", "missing").is_none());
        assert!(cache.collection_names().is_empty());

        // Written but never persisted still counts
        cache.upsert_merge("orders", "o1", &patch(json!({})));
        assert_eq!(cache.collection_names(), vec!["orders".to_string()]);
        assert_eq!(cache.stats().collections, 0);
    }

    #[test]
    fn test_stats() {
        let mut cache = LocalCache::in_memory();
        cache.upsert_merge("products", "p1", &patch(json!({"name": "A"})));
        cache.upsert_merge("products", "p2", &patch(json!({"name": "B"})));
        cache.upsert_merge("orders", "o1", &patch(json!({})));

        let stats = cache.stats();
        assert_eq!(stats.collections, 2);
        assert_eq!(stats.records, 3);
        assert!(stats.stored_bytes > 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576), "1.0 MB");
    }
}
