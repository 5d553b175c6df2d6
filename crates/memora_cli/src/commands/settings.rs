//! Settings command implementation.

use memora_scheduler::{AnkiSettings, PartialSettings};
use std::path::Path;

/// Reads partial settings from a JSON file, or the defaults when `path` is `None`.
pub fn load(path: Option<&Path>) -> Result<PartialSettings, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            Ok(serde_json::from_str(&text)?)
        }
        None => Ok(PartialSettings::default()),
    }
}

/// Loads and normalizes settings.
pub fn resolve(path: Option<&Path>) -> Result<AnkiSettings, Box<dyn std::error::Error>> {
    Ok(load(path)?.normalize())
}

/// Runs the settings command.
pub fn run(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = resolve(path)?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
