//! Cards command implementation.

use chrono::{DateTime, Utc};
use memora_storage::ProgressStore;
use memora_sync_protocol::ProgressRecord;
use std::path::Path;

/// Returns the user's cards, soonest due first; unscheduled cards last.
pub fn list(
    data_dir: &Path,
    user_id: &str,
    due_only: bool,
    now: DateTime<Utc>,
) -> Result<Vec<ProgressRecord>, Box<dyn std::error::Error>> {
    let store = ProgressStore::new(super::open_existing(data_dir)?);
    let mut records: Vec<_> = store
        .scan(user_id)?
        .into_iter()
        .filter(|record| !due_only || record.state.is_due(now))
        .collect();
    records.sort_by(|a, b| match (a.state.next_review, b.state.next_review) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.card_id.cmp(&b.card_id),
    });
    Ok(records)
}

/// Runs the cards command.
pub fn run(
    data_dir: &Path,
    user_id: &str,
    due_only: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let records = list(data_dir, user_id, due_only, Utc::now())?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No cards");
        return Ok(());
    }
    println!(
        "{:<24} {:<10} {:>8} {:>6} {:>6} {:>4} {:<8} NEXT REVIEW",
        "CARD", "STATUS", "INTERVAL", "EASE", "LAPSES", "VER", "SYNC"
    );
    for record in &records {
        let state = &record.state;
        let next = state
            .next_review
            .map_or_else(|| "-".to_string(), |at| at.to_rfc3339());
        println!(
            "{:<24} {:<10} {:>8.2} {:>6.2} {:>6} {:>4} {:<8} {}",
            record.card_id,
            format!("{:?}", state.status).to_lowercase(),
            state.interval,
            state.ease_factor,
            state.lapses,
            record.meta.version,
            format!("{:?}", record.meta.sync_status).to_lowercase(),
            next
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_data_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list(&dir.path().join("nope"), "me", false, Utc::now()).is_err());
    }

    #[test]
    fn due_filter_and_order() {
        let dir = tempfile::tempdir().unwrap();
        super::super::review::apply(dir.path(), "me", "later", 3, 5, None, None).unwrap();
        super::super::review::apply(dir.path(), "me", "soon", 0, 5, None, None).unwrap();

        let now = Utc::now();
        let all = list(dir.path(), "me", false, now).unwrap();
        let ids: Vec<_> = all.iter().map(|record| record.card_id.as_str()).collect();
        assert_eq!(ids, vec!["soon", "later"]);

        let due = list(dir.path(), "me", true, now + chrono::Duration::minutes(5)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].card_id, "soon");
    }
}
