//! Startup reconciliation.
//!
//! Every loaded run with pending work is checked against the session store.
//! Runs whose child session vanished are pruned; live runs get their missing
//! hook and announce steps re-driven. Runs are processed concurrently.

use futures::future::join_all;

use crate::announce::AnnounceOutcome;
use crate::models::SubagentRun;
use crate::pipeline::{CompletionPipeline, CompletionReport};

/// What reconciliation did with one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDisposition {
    /// No pending work, or the record disappeared mid-pass.
    Skipped,
    /// Child session missing; removed without hook or announce.
    Pruned,
    /// Ended run whose pending flows were re-driven.
    Completed(CompletionReport),
    /// Unfinished run that the monitor reported as finished.
    Resumed(CompletionReport),
    /// Unfinished run the monitor had nothing to say about.
    StillRunning,
}

/// Summary of one reconciliation pass. Ids are in registry order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub skipped: Vec<String>,
    pub pruned: Vec<String>,
    pub announced: Vec<String>,
    pub deferred: Vec<String>,
    pub suppressed: Vec<String>,
    pub resumed: Vec<String>,
    pub running: Vec<String>,
    pub hooks_fired: usize,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.skipped.len()
            + self.pruned.len()
            + self.announced.len()
            + self.deferred.len()
            + self.suppressed.len()
            + self.running.len()
    }

    fn record(&mut self, run_id: String, disposition: RunDisposition) {
        let report = match disposition {
            RunDisposition::Skipped => {
                self.skipped.push(run_id);
                return;
            }
            RunDisposition::Pruned => {
                self.pruned.push(run_id);
                return;
            }
            RunDisposition::StillRunning => {
                self.running.push(run_id);
                return;
            }
            RunDisposition::Resumed(report) => {
                self.resumed.push(run_id.clone());
                report
            }
            RunDisposition::Completed(report) => report,
        };

        if report.hook_accepted {
            self.hooks_fired += 1;
        }
        match report.announce {
            AnnounceOutcome::Deleted | AnnounceOutcome::Kept => self.announced.push(run_id),
            AnnounceOutcome::Deferred => self.deferred.push(run_id),
            AnnounceOutcome::Suppressed => self.suppressed.push(run_id),
            AnnounceOutcome::AlreadyHandled | AnnounceOutcome::InFlight | AnnounceOutcome::Missing => {
                self.skipped.push(run_id)
            }
        }
    }
}

impl CompletionPipeline {
    /// Reconcile every run currently in the registry.
    pub async fn reconcile(&self) -> ReconcileReport {
        let runs = self.registry().snapshot();
        let dispositions = join_all(runs.iter().map(|run| self.reconcile_run(run))).await;

        let mut report = ReconcileReport::default();
        for (run, disposition) in runs.into_iter().zip(dispositions) {
            report.record(run.run_id, disposition);
        }

        tracing::info!(
            path = %self.registry().path().display(),
            skipped = report.skipped.len(),
            pruned = report.pruned.len(),
            announced = report.announced.len(),
            deferred = report.deferred.len(),
            suppressed = report.suppressed.len(),
            resumed = report.resumed.len(),
            running = report.running.len(),
            hooks_fired = report.hooks_fired,
            "subagent registry reconciled"
        );
        report
    }

    async fn reconcile_run(&self, run: &SubagentRun) -> RunDisposition {
        let Some(run) = self.registry().get(&run.run_id) else {
            return RunDisposition::Skipped;
        };
        if run.is_settled() {
            tracing::debug!(run_id = %run.run_id, "run settled, skipping");
            return RunDisposition::Skipped;
        }

        if !self.session_alive(&run.child_session_key).await {
            self.prune_orphan(&run);
            return RunDisposition::Pruned;
        }

        if run.is_ended() {
            return RunDisposition::Completed(self.drive_completion(&run).await);
        }

        match self.monitor().wait_for_completion(&run).await {
            Ok(Some(completion)) => match self.complete(&run.run_id, completion).await {
                Ok(report) => RunDisposition::Resumed(report),
                Err(e) => {
                    tracing::warn!(
                        run_id = %run.run_id,
                        error = %e,
                        "failed to record resumed completion"
                    );
                    RunDisposition::StillRunning
                }
            },
            Ok(None) => RunDisposition::StillRunning,
            Err(e) => {
                tracing::warn!(run_id = %run.run_id, error = %e, "run monitor failed");
                RunDisposition::StillRunning
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::Mutex;

    use anyhow::Result;
    use async_trait::async_trait;

    use crate::announce::{AnnouncePayload, Announcer};
    use crate::hooks::{HookRunner, SubagentEndedEvent};
    use crate::models::{CleanupPolicy, RunPatch};
    use crate::persistence::RegistryCodec;
    use crate::pipeline::{Collaborators, PipelineOptions};
    use crate::registry::RunRegistry;
    use crate::session::SessionStore;

    #[derive(Default)]
    struct Recorder {
        hooks: Mutex<Vec<String>>,
        announces: Mutex<Vec<String>>,
    }

    struct Hooks(Arc<Recorder>);

    #[async_trait]
    impl HookRunner for Hooks {
        fn has_hooks(&self) -> bool {
            true
        }
        async fn run_subagent_ended(&self, event: &SubagentEndedEvent) -> Result<()> {
            self.0.hooks.lock().unwrap().push(event.run_id.clone());
            Ok(())
        }
    }

    struct Announces(Arc<Recorder>);

    #[async_trait]
    impl Announcer for Announces {
        async fn announce(&self, payload: &AnnouncePayload) -> Result<bool> {
            self.0.announces.lock().unwrap().push(payload.run_id.clone());
            Ok(true)
        }
    }

    struct Sessions(HashSet<String>);

    #[async_trait]
    impl SessionStore for Sessions {
        async fn exists(&self, session_key: &str) -> Result<bool> {
            Ok(self.0.contains(session_key))
        }
    }

    struct BrokenSessions;

    #[async_trait]
    impl SessionStore for BrokenSessions {
        async fn exists(&self, _session_key: &str) -> Result<bool> {
            anyhow::bail!("index unreadable")
        }
    }

    fn ended(id: &str, cleanup: CleanupPolicy) -> SubagentRun {
        let mut run = SubagentRun::new(
            id,
            format!("agent:main:subagent:{id}"),
            "agent:main:main",
            "task",
            cleanup,
            1,
        );
        run.started_at = Some(2);
        run.ended_at = Some(3);
        run
    }

    fn pipeline(
        registry: RunRegistry,
        rec: &Arc<Recorder>,
        sessions: Arc<dyn SessionStore>,
    ) -> CompletionPipeline {
        CompletionPipeline::new(
            registry,
            Collaborators::new(
                Arc::new(Hooks(Arc::clone(rec))),
                Arc::new(Announces(Arc::clone(rec))),
                sessions,
            ),
            PipelineOptions::default(),
        )
    }

    fn live(ids: &[&str]) -> Arc<dyn SessionStore> {
        Arc::new(Sessions(
            ids.iter().map(|id| format!("agent:main:subagent:{id}")).collect(),
        ))
    }

    #[tokio::test]
    async fn classifies_each_run() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = RunRegistry::new(RegistryCodec::new(tmp.path().join("runs.json")));
        registry.register(ended("live", CleanupPolicy::Keep)).unwrap();
        registry.register(ended("orphan", CleanupPolicy::Keep)).unwrap();
        registry.register(ended("quiet", CleanupPolicy::Delete)).unwrap();
        registry
            .mutate("quiet", &RunPatch::suppress("steer-restart"))
            .unwrap();

        let rec = Arc::new(Recorder::default());
        let pipeline = pipeline(registry.clone(), &rec, live(&["live", "quiet"]));
        let report = pipeline.reconcile().await;

        assert_eq!(report.announced, vec!["live"]);
        assert_eq!(report.pruned, vec!["orphan"]);
        assert_eq!(report.suppressed, vec!["quiet"]);
        assert_eq!(report.hooks_fired, 2);
        assert!(!registry.contains("orphan"));
        assert!(registry.contains("quiet"));
        assert_eq!(*rec.announces.lock().unwrap(), vec!["live"]);
    }

    #[tokio::test]
    async fn second_pass_has_no_side_effects() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = RunRegistry::new(RegistryCodec::new(tmp.path().join("runs.json")));
        registry.register(ended("a", CleanupPolicy::Keep)).unwrap();
        registry.register(ended("b", CleanupPolicy::Keep)).unwrap();

        let rec = Arc::new(Recorder::default());
        let pipeline = pipeline(registry.clone(), &rec, live(&["a", "b"]));
        pipeline.reconcile().await;
        let before = registry.snapshot();

        let report = pipeline.reconcile().await;
        assert_eq!(report.skipped, vec!["a", "b"]);
        assert_eq!(report.hooks_fired, 0);
        assert_eq!(registry.snapshot(), before);
        assert_eq!(rec.hooks.lock().unwrap().len(), 2);
        assert_eq!(rec.announces.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn session_lookup_error_never_prunes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = RunRegistry::new(RegistryCodec::new(tmp.path().join("runs.json")));
        registry.register(ended("a", CleanupPolicy::Delete)).unwrap();

        let rec = Arc::new(Recorder::default());
        let pipeline = pipeline(registry.clone(), &rec, Arc::new(BrokenSessions));
        let report = pipeline.reconcile().await;

        assert!(report.pruned.is_empty());
        assert_eq!(report.announced, vec!["a"]);
        assert!(!registry.contains("a"));
    }

    #[tokio::test]
    async fn unfinished_runs_without_monitor_stay_running() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = RunRegistry::new(RegistryCodec::new(tmp.path().join("runs.json")));
        let mut run = ended("a", CleanupPolicy::Keep);
        run.ended_at = None;
        registry.register(run.clone()).unwrap();

        let rec = Arc::new(Recorder::default());
        let pipeline = pipeline(registry.clone(), &rec, live(&["a"]));
        let report = pipeline.reconcile().await;

        assert_eq!(report.running, vec!["a"]);
        assert_eq!(registry.get("a").unwrap(), run);
        assert!(rec.hooks.lock().unwrap().is_empty());
    }
}
