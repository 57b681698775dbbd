//! Status command handler

use anyhow::Result;

use comanda_core::{Config, SyncStore};

use crate::output::{Output, OutputFormat};

/// Show status information
pub fn show(store: &SyncStore, config: &Config, output: &Output) -> Result<()> {
    let stats = store.storage_stats();
    let collections: Vec<(String, usize)> = store
        .collection_names()
        .into_iter()
        .map(|name| {
            let count = store.cached(&name).len();
            (name, count)
        })
        .collect();

    match output.format {
        OutputFormat::Json => {
            let counts: serde_json::Map<String, serde_json::Value> = collections
                .iter()
                .map(|(name, count)| (name.clone(), serde_json::json!(count)))
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "mirrored": store.is_mirrored(),
                    "remote_enabled": config.remote_enabled,
                    "remote_url": config.remote_url,
                    "data_dir": config.data_dir,
                    "cache_prefix": config.cache_prefix,
                    "storage": stats,
                    "collections": counts
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", if store.is_mirrored() { "mirrored" } else { "local" });
        }
        OutputFormat::Human => {
            println!("Comanda Status");
            println!("==============");
            println!();
            println!("Remote:");
            let mode = match (config.active_remote_url(), store.is_mirrored()) {
                (Some(_), true) => "connected",
                (Some(_), false) => "unreachable (running local-only)",
                (None, _) => "disabled",
            };
            println!("  Status: {}", mode);
            if let Some(ref url) = config.remote_url {
                println!("  Server: {}", url);
            }
            println!();
            println!("Storage:");
            println!("  Location:    {}", config.cache_dir().display());
            println!("  Prefix:      {}", config.cache_prefix);
            println!("  Size:        {}", stats.stored_size_human());
            println!("  Collections: {}", stats.collections);
            println!("  Records:     {}", stats.records);
            if !collections.is_empty() {
                println!();
                println!("Contents:");
                for (name, count) in &collections {
                    println!("  {:16} {}", name, count);
                }
            }
        }
    }

    Ok(())
}
