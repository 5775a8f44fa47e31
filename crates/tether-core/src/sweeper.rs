//! Retention for settled `keep` runs.
//!
//! Settled runs carry an `archiveAt` deadline when retention is configured;
//! the sweeper removes them once it passes. Runs with pending work never
//! carry a deadline and are never swept.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::models::TimestampMs;
use crate::registry::RunRegistry;

/// Removes runs whose archive deadline has passed.
#[derive(Clone)]
pub struct ArchiveSweeper {
    registry: RunRegistry,
    clock: Arc<dyn Clock>,
}

impl ArchiveSweeper {
    pub fn new(registry: RunRegistry, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }

    /// Remove every run with `archiveAt <= now`. Returns the removed ids in
    /// registry order.
    pub fn sweep_once(&self, now: TimestampMs) -> Vec<String> {
        let due: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|run| run.cleanup_handled && run.archive_at.is_some_and(|at| at <= now))
            .map(|run| run.run_id)
            .collect();

        let mut removed = Vec::with_capacity(due.len());
        for run_id in due {
            if self.registry.remove(&run_id).is_some() {
                tracing::info!(run_id = %run_id, "archived subagent run");
                removed.push(run_id);
            }
        }
        removed
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn spawn(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep_once(self.clock.now_ms());
                        if !removed.is_empty() {
                            tracing::debug!(count = removed.len(), "archive sweep removed runs");
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("archive sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for ArchiveSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSweeper")
            .field("registry", &self.registry)
            .finish()
    }
}
