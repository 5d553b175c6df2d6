//! Review command implementation.

use memora_storage::{DeviceIdentity, FileBackend, ProgressStore};
use memora_sync_engine::{RecordedReview, ReviewRecorder, SyncQueue};
use std::path::Path;
use std::sync::Arc;

/// Grades a card in the data directory and queues the change.
pub fn apply(
    data_dir: &Path,
    user_id: &str,
    card_id: &str,
    grade: i64,
    seconds: i64,
    session_id: Option<String>,
    settings: Option<&Path>,
) -> Result<RecordedReview, Box<dyn std::error::Error>> {
    let settings = super::settings::load(settings)?;
    let backend = super::open_store(data_dir)?;
    let device = DeviceIdentity::load_or_create(backend.as_ref())?;
    tracing::debug!(device_id = %device.id, user_id, "recording review");

    let store = Arc::new(ProgressStore::new(Arc::clone(&backend)));
    let queue = Arc::new(SyncQueue::<Arc<FileBackend>>::load(backend, user_id)?);
    let recorder = ReviewRecorder::new(user_id, settings, store, queue);
    Ok(recorder.record_review(card_id, grade, seconds, session_id, chrono::Utc::now())?)
}

/// Runs the review command.
pub fn run(
    data_dir: &Path,
    user_id: &str,
    card_id: &str,
    grade: i64,
    seconds: i64,
    session_id: Option<String>,
    settings: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let recorded = apply(data_dir, user_id, card_id, grade, seconds, session_id, settings)?;
    let state = &recorded.record.state;

    println!("Card {card_id} graded {grade}");
    println!("  Status:      {:?} (was {:?})", state.status, recorded.result.previous.status);
    println!("  Interval:    {} days", state.interval);
    println!("  Ease:        {:.2}", state.ease_factor);
    match recorded.result.next_review {
        Some(due) => println!("  Next review: {due}"),
        None => println!("  Next review: never (suspended)"),
    }
    println!("  Version:     {}", recorded.record.meta.version);
    if recorded.result.graduated {
        println!("  Graduated to review");
    }
    if recorded.result.became_leech {
        println!("  Card is now a leech");
    }
    println!("  Queued:      {}", recorded.operation_id);
    Ok(())
}
