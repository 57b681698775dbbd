//! Watch command handler

use anyhow::{bail, Context, Result};
use chrono::Local;
use tokio::sync::mpsc;

use comanda_core::{Collection, SyncStore};

use crate::output::Output;

/// Print the collection on every change until Ctrl-C
pub async fn watch(store: &SyncStore, collection: &str, output: &Output) -> Result<()> {
    if collection.trim().is_empty() {
        bail!("Collection name cannot be empty");
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Collection>();
    let subscription = store.subscribe(collection, move |records| {
        let _ = tx.send(records.to_vec());
    });

    if !store.is_mirrored() {
        output.message("Remote mirroring is off; showing local changes only.");
    }

    let stop = tokio::signal::ctrl_c();
    tokio::pin!(stop);

    loop {
        tokio::select! {
            delivery = rx.recv() => match delivery {
                Some(records) => output.print_delivery(collection, Local::now(), &records),
                None => break,
            },
            result = &mut stop => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    subscription.cancel();
    Ok(())
}
