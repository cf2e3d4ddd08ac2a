//! Checkpoints command implementation.

use super::{open, CliResult};
use rowsync_protocol::CheckpointRecord;
use std::path::Path;

/// Runs the checkpoints command.
pub async fn run(path: &Path, format: &str) -> CliResult<()> {
    let store = open(path).await?;
    let records = store.checkpoints.list().await?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records);
        }
    }

    Ok(())
}

fn print_text_output(records: &[CheckpointRecord]) {
    if records.is_empty() {
        println!("No checkpoints.");
        return;
    }

    println!(
        "{:<20} {:<18} {:<26} {:<12} {:<26}",
        "TABLE", "FILTER", "LAST SYNCED", "LAST ID", "LAST DELETED"
    );
    for record in records {
        println!(
            "{:<20} {:<18} {:<26} {:<12} {:<26}",
            record.table_name,
            truncate(record.filter_key.as_str(), 16),
            record.last_synced_at,
            truncate(record.last_synced_at_pk.as_deref().unwrap_or("-"), 12),
            record.last_deleted_at
        );
        if record.filter_json != "[]" {
            println!("  filters: {}", record.filter_json);
        }
    }
    println!();
    println!("{} checkpoint(s)", records.len());
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let mut short: String = text.chars().take(width.saturating_sub(1)).collect();
        short.push('…');
        short
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_keys_are_truncated() {
        assert_eq!(truncate("all", 16), "all");
        assert_eq!(truncate("0123456789abcdef0123", 8).chars().count(), 8);
    }
}
