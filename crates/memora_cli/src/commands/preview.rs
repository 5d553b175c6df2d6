//! Preview command implementation.

use memora_scheduler::{Grade, Scheduler};
use memora_storage::ProgressStore;
use std::path::Path;

/// Runs the preview command.
pub fn run(
    data_dir: &Path,
    user_id: &str,
    card_id: &str,
    settings: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = Scheduler::new(super::settings::resolve(settings)?);
    let store = ProgressStore::new(super::open_store(data_dir)?);
    let current = store.get(user_id, card_id)?;
    let state = current.as_ref().map(|record| &record.state);

    let due = scheduler.preview(state, chrono::Utc::now())?;
    match state {
        Some(state) => println!("Card {card_id} ({:?})", state.status),
        None => println!("Card {card_id} (new)"),
    }
    for grade in Grade::ALL {
        let label = format!("{grade:?}").to_lowercase();
        match due[grade.code() as usize] {
            Some(at) => println!("  {label:<6} {at}"),
            None => println!("  {label:<6} never"),
        }
    }
    Ok(())
}
