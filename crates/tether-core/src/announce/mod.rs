//! Requester notification and cleanup-policy application.
//!
//! [`AnnounceFlow::process`] tells the requester its subagent finished, and
//! only after a successful delivery applies the run's cleanup policy. A
//! deferred delivery leaves the record exactly as it was so a later call
//! (or the next process start) can retry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::clock::Clock;
use crate::inflight::InFlightSet;
use crate::models::{
    CleanupPolicy, RequesterOrigin, RunOutcome, RunPatch, SubagentRun, TimestampMs,
};
use crate::registry::RunRegistry;

/// What the announcer receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePayload {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_display_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester_origin: Option<RequesterOrigin>,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<TimestampMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<TimestampMs>,
    /// Lets the delivery side remove the child session for `delete` runs.
    pub cleanup: CleanupPolicy,
}

impl From<&SubagentRun> for AnnouncePayload {
    fn from(run: &SubagentRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            child_session_key: run.child_session_key.clone(),
            requester_session_key: run.requester_session_key.clone(),
            requester_display_key: run.requester_display_key.clone(),
            requester_origin: run.requester_origin.clone(),
            task: run.task.clone(),
            label: run.label.clone(),
            outcome: run.outcome.clone(),
            started_at: run.started_at,
            ended_at: run.ended_at,
            cleanup: run.cleanup,
        }
    }
}

/// Delivers completion notices to requesters.
#[async_trait]
pub trait Announcer: Send + Sync {
    /// Returns `Ok(true)` when delivered, `Ok(false)` when delivery was
    /// deferred. Errors are treated as deferrals.
    async fn announce(&self, payload: &AnnouncePayload) -> Result<bool>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Announcer) {}
};

/// Result of one [`AnnounceFlow::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// Delivered; `delete` run removed from the registry.
    Deleted,
    /// Delivered; `keep` run marked handled.
    Kept,
    /// Announcer returned `false` or failed. Nothing changed.
    Deferred,
    /// The run carries a suppression reason.
    Suppressed,
    /// Cleanup already handled.
    AlreadyHandled,
    /// Another `process` call for the same run is running.
    InFlight,
    /// The run is not in the registry (already deleted or pruned).
    Missing,
}

impl AnnounceOutcome {
    pub fn delivered(self) -> bool {
        matches!(self, Self::Deleted | Self::Kept)
    }
}

/// Exactly-once, retry-on-failure announce + cleanup.
#[derive(Clone)]
pub struct AnnounceFlow {
    registry: RunRegistry,
    announcer: Arc<dyn Announcer>,
    clock: Arc<dyn Clock>,
    archive_after: Option<Duration>,
    in_flight: InFlightSet,
}

impl AnnounceFlow {
    pub fn new(registry: RunRegistry, announcer: Arc<dyn Announcer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            announcer,
            clock,
            archive_after: None,
            in_flight: InFlightSet::new(),
        }
    }

    /// Stamp `archiveAt` on settled `keep` runs this far in the future.
    pub fn with_archive_after(mut self, archive_after: Option<Duration>) -> Self {
        self.archive_after = archive_after;
        self
    }

    /// Announce `run`'s completion and apply its cleanup policy.
    ///
    /// The registry's current copy of the run is authoritative; `run` only
    /// names which record to process.
    pub async fn process(&self, run: &SubagentRun) -> AnnounceOutcome {
        let Some(_guard) = self.in_flight.try_acquire(&run.run_id) else {
            tracing::debug!(run_id = %run.run_id, "announce already in flight");
            return AnnounceOutcome::InFlight;
        };
        let Some(current) = self.registry.get(&run.run_id) else {
            return AnnounceOutcome::Missing;
        };
        if current.is_suppressed() {
            tracing::debug!(
                run_id = %current.run_id,
                reason = current.suppress_announce_reason.as_deref().unwrap_or_default(),
                "announce suppressed"
            );
            return AnnounceOutcome::Suppressed;
        }
        if current.cleanup_handled {
            return AnnounceOutcome::AlreadyHandled;
        }

        let payload = AnnouncePayload::from(&current);
        let delivered = match self.announcer.announce(&payload).await {
            Ok(delivered) => delivered,
            Err(e) => {
                tracing::warn!(run_id = %current.run_id, error = %e, "announce failed");
                false
            }
        };
        if !delivered {
            tracing::info!(run_id = %current.run_id, "announce deferred, will retry");
            return AnnounceOutcome::Deferred;
        }

        match current.cleanup {
            CleanupPolicy::Delete => {
                self.registry.remove(&current.run_id);
                tracing::info!(run_id = %current.run_id, "announced and deleted subagent run");
                AnnounceOutcome::Deleted
            }
            CleanupPolicy::Keep => {
                let now = self.clock.now_ms();
                let archive_at = self.archive_after.map(|d| {
                    now.saturating_add(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
                });
                let patch = RunPatch {
                    cleanup_handled: Some(true),
                    cleanup_completed_at: Some(now),
                    archive_at,
                    ..RunPatch::default()
                };
                if let Err(e) = self.registry.mutate(&current.run_id, &patch) {
                    // Delivery already happened; the record stays pending and
                    // the next pass re-announces.
                    tracing::warn!(
                        run_id = %current.run_id,
                        error = %e,
                        "failed to mark announce handled"
                    );
                    return AnnounceOutcome::Deferred;
                }
                tracing::info!(run_id = %current.run_id, "announced subagent run");
                AnnounceOutcome::Kept
            }
        }
    }
}

impl std::fmt::Debug for AnnounceFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnounceFlow")
            .field("archive_after", &self.archive_after)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
