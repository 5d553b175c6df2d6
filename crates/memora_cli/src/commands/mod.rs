//! CLI command implementations.

pub mod cards;
pub mod preview;
pub mod queue;
pub mod review;
pub mod settings;

use memora_storage::FileBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File holding every local document inside the data directory.
pub const STORE_FILE: &str = "memora.json";

/// Returns the store file path for `data_dir`.
pub fn store_path(data_dir: &Path) -> PathBuf {
    data_dir.join(STORE_FILE)
}

/// Opens the data directory's store, creating it on first use.
pub fn open_store(data_dir: &Path) -> Result<Arc<FileBackend>, Box<dyn std::error::Error>> {
    Ok(Arc::new(FileBackend::open_with_create_dirs(&store_path(
        data_dir,
    ))?))
}

/// Opens an existing store without creating anything.
pub fn open_existing(data_dir: &Path) -> Result<Arc<FileBackend>, Box<dyn std::error::Error>> {
    let path = store_path(data_dir);
    if !path.exists() {
        return Err(format!("No Memora data found at {}", data_dir.display()).into());
    }
    Ok(Arc::new(FileBackend::open(&path)?))
}
