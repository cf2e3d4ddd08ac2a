//! Clear command implementation.

use super::{open, parse_filters, CliResult};
use std::path::Path;

/// Runs the clear command.
pub async fn run(path: &Path, table: &str, filters: Option<&str>) -> CliResult<()> {
    let filters = filters.map(|raw| parse_filters(Some(raw))).transpose()?;
    let store = open(path).await?;
    let removed = store.checkpoints.clear(table, filters.as_ref()).await?;
    println!("Removed {removed} checkpoint(s) of {table}");
    Ok(())
}
