//! Queue command implementation.

use memora_storage::FileBackend;
use memora_sync_engine::SyncQueue;
use memora_sync_protocol::SyncOperation;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Queue contents.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueListing {
    /// Operations waiting to be sent, in send order.
    pub pending: Vec<SyncOperation>,
    /// Operations that need attention.
    pub parked: Vec<SyncOperation>,
}

/// Loads the user's queue.
pub fn list(data_dir: &Path, user_id: &str) -> Result<QueueListing, Box<dyn std::error::Error>> {
    let backend = super::open_existing(data_dir)?;
    let queue = SyncQueue::<Arc<FileBackend>>::load(backend, user_id)?;
    Ok(QueueListing {
        pending: queue.snapshot(),
        parked: queue.conflicted(),
    })
}

/// Runs the queue command.
pub fn run(data_dir: &Path, user_id: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listing = list(data_dir, user_id)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    println!("Pending: {}", listing.pending.len());
    for op in &listing.pending {
        print_operation(op);
    }
    println!("Parked: {}", listing.parked.len());
    for op in &listing.parked {
        print_operation(op);
    }
    Ok(())
}

fn print_operation(op: &SyncOperation) {
    print!(
        "  {} {:?}/{:?} {} priority={:?} retries={}",
        op.id, op.entity_type, op.op_type, op.entity_id, op.priority, op.retry_count
    );
    if let Some(at) = op.next_attempt_at {
        print!(" next={at}");
    }
    if let Some(error) = &op.last_error {
        print!(" error={error:?}");
    }
    println!();
}
