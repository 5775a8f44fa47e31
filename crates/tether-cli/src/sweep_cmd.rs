//! `tether sweep` command: remove runs past their archive deadline.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use tether_core::{ArchiveSweeper, Clock, RunRegistry, SystemClock};

/// Run the sweep command.
pub fn run_sweep(registry_path: &Path) -> Result<()> {
    let (registry, _) = RunRegistry::open(registry_path);
    let removed = ArchiveSweeper::new(registry, Arc::new(SystemClock)).sweep_once(SystemClock.now_ms());

    if removed.is_empty() {
        println!("No runs due for archiving.");
        return Ok(());
    }
    println!("Archived {} run(s):", removed.len());
    for id in &removed {
        println!("  {id}");
    }
    Ok(())
}
