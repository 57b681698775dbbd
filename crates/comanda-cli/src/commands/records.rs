//! Record command handlers

use anyhow::{bail, Context, Result};

use comanda_core::models::fields_from_value;
use comanda_core::{Collection, Fields, Record, SyncStore};

use crate::output::Output;

/// Read a whole collection
pub async fn get(
    store: &SyncStore,
    collection: &str,
    default: Option<&str>,
    output: &Output,
) -> Result<()> {
    ensure_collection(collection)?;
    let default = match default {
        Some(json) => parse_default(json)?,
        None => Vec::new(),
    };

    let records = store.get_all(collection, default).await;
    output.print_records(collection, &records);
    Ok(())
}

/// Show a single record from the local cache
pub fn show(store: &SyncStore, collection: &str, id: &str, output: &Output) -> Result<()> {
    let record = store
        .get(collection, id)
        .ok_or_else(|| anyhow::anyhow!("Record not found: {}/{}", collection, id))?;

    output.print_record(&record);
    Ok(())
}

/// Merge fields into a record
pub async fn save(
    store: &SyncStore,
    collection: &str,
    id: Option<String>,
    fields: &str,
    output: &Output,
) -> Result<()> {
    ensure_collection(collection)?;
    let patch = parse_fields(fields)?;
    let id = match id {
        Some(id) if id.is_empty() => bail!("Record ID cannot be empty"),
        Some(id) => id,
        None => Record::generate_id(),
    };

    store.save(collection, &id, patch).await;

    output.success(&format!("Saved {}/{}", collection, id));
    if let Some(record) = store.get(collection, &id) {
        output.print_record(&record);
    }
    Ok(())
}

/// Remove a record
pub async fn remove(store: &SyncStore, collection: &str, id: &str, output: &Output) -> Result<()> {
    ensure_collection(collection)?;
    let existed = store.get(collection, id).is_some();

    store.remove(collection, id).await;

    if existed {
        output.success(&format!("Removed {}/{}", collection, id));
    } else {
        output.message(&format!("{}/{} was not in the local cache", collection, id));
    }
    Ok(())
}

fn ensure_collection(collection: &str) -> Result<()> {
    if collection.trim().is_empty() {
        bail!("Collection name cannot be empty");
    }
    Ok(())
}

/// Parse a JSON object of fields
fn parse_fields(json: &str) -> Result<Fields> {
    let value: serde_json::Value = serde_json::from_str(json).context("Fields are not valid JSON")?;
    fields_from_value(value).ok_or_else(|| anyhow::anyhow!("Fields must be a JSON object"))
}

/// Parse a JSON array of records
fn parse_default(json: &str) -> Result<Collection> {
    serde_json::from_str(json)
        .context("Default must be a JSON array of objects that each carry an \"id\"")
}
