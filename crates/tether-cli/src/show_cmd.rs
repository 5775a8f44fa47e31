//! `tether show` command: dump one run record.

use std::path::Path;

use anyhow::{Context, Result};

use crate::list_cmd::open_query;

/// Run the show command.
pub fn run_show(registry_path: &Path, run_id: &str) -> Result<()> {
    let run = open_query(registry_path)?
        .get(run_id)
        .with_context(|| format!("run {run_id} not found"))?;

    let json = serde_json::to_string_pretty(&run).context("failed to encode run")?;
    println!("{json}");
    println!();
    println!("Phase: {}", run.phase());
    if let Some(ended_at) = run.ended_at.and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis) {
        println!("Ended: {}", ended_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}
