//! The host-facing completion pipeline.
//!
//! [`CompletionPipeline`] wires the registry to its collaborators and owns
//! the three announce call sites: a run ending, reconciliation at startup
//! (see [`crate::reconcile`]), and a suppression being cleared.
//!
//! ```text
//! spawner --register--> RunRegistry <--mutate-- engine (start/complete)
//!                           |
//!           complete() -----+----> EndedHookGate ----> HookRunner
//!                           |
//!                           +----> AnnounceFlow -----> Announcer
//!                                        |
//!                                        +--delete--> RunRegistry::remove
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::announce::{AnnounceFlow, AnnounceOutcome, Announcer};
use crate::clock::{Clock, SystemClock};
use crate::error::RegistryError;
use crate::hooks::{EndedHookGate, HookRunner};
use crate::models::{RunPatch, SubagentRun, TimestampMs};
use crate::monitor::{NoopRunMonitor, RunCompletion, RunMonitor};
use crate::query::QueryApi;
use crate::registry::RunRegistry;
use crate::session::SessionStore;

/// The external services the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub hooks: Arc<dyn HookRunner>,
    pub announcer: Arc<dyn Announcer>,
    pub sessions: Arc<dyn SessionStore>,
    pub monitor: Arc<dyn RunMonitor>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Collaborators with no run monitor and the system clock.
    pub fn new(
        hooks: Arc<dyn HookRunner>,
        announcer: Arc<dyn Announcer>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            hooks,
            announcer,
            sessions,
            monitor: Arc::new(NoopRunMonitor),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn RunMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Tunables for the pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Retention for settled `keep` runs before the sweeper archives them.
    pub archive_after: Option<Duration>,
}

/// What happened when completion processing ran for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionReport {
    /// The ended hook marker was set by this pass.
    pub hook_accepted: bool,
    pub announce: AnnounceOutcome,
}

/// Result of [`CompletionPipeline::clear_suppress_announce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    /// Reason cleared; the run has not ended so there is nothing to announce.
    Cleared,
    /// The child session is gone; the run was pruned.
    Pruned,
    /// Completion processing ran.
    Completed(CompletionReport),
}

/// Registry plus completion flows, shared via cheap clones.
#[derive(Clone)]
pub struct CompletionPipeline {
    registry: RunRegistry,
    gate: EndedHookGate,
    announce: AnnounceFlow,
    sessions: Arc<dyn SessionStore>,
    monitor: Arc<dyn RunMonitor>,
    clock: Arc<dyn Clock>,
}

impl CompletionPipeline {
    pub fn new(registry: RunRegistry, collaborators: Collaborators, options: PipelineOptions) -> Self {
        let Collaborators {
            hooks,
            announcer,
            sessions,
            monitor,
            clock,
        } = collaborators;
        let gate = EndedHookGate::new(registry.clone(), hooks, Arc::clone(&clock));
        let announce = AnnounceFlow::new(registry.clone(), announcer, Arc::clone(&clock))
            .with_archive_after(options.archive_after);
        Self {
            registry,
            gate,
            announce,
            sessions,
            monitor,
            clock,
        }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn query(&self) -> QueryApi {
        QueryApi::new(self.registry.clone())
    }

    pub(crate) fn monitor(&self) -> &dyn RunMonitor {
        self.monitor.as_ref()
    }

    /// Load the registry file (migrating legacy records) and reconcile it
    /// against the session store.
    ///
    /// Unfinished runs wait on [`RunMonitor::wait_for_completion`], so this
    /// returns only once every monitor call has resolved. Monitors backed by
    /// a long-running engine should answer from a status query, or return
    /// `None` and complete the run later through [`Self::complete`].
    pub async fn initialize(&self) -> crate::reconcile::ReconcileReport {
        self.registry.reload();
        self.reconcile().await
    }

    pub fn register(&self, run: SubagentRun) -> Result<(), RegistryError> {
        self.registry.register(run)?;
        Ok(())
    }

    /// Record that execution began. `at` defaults to now.
    pub fn start(&self, run_id: &str, at: Option<TimestampMs>) -> Result<SubagentRun, RegistryError> {
        let at = at.unwrap_or_else(|| self.clock.now_ms());
        self.registry
            .mutate(run_id, &RunPatch::started(at))?
            .ok_or_else(|| RegistryError::UnknownRun(run_id.to_owned()))
    }

    /// Record that execution finished and run the completion flows.
    ///
    /// If the engine never reported a start, `startedAt` is taken from the
    /// completion (or set to `endedAt`). Completing a run that already ended
    /// keeps its original timestamps and only re-drives pending work.
    pub async fn complete(
        &self,
        run_id: &str,
        completion: RunCompletion,
    ) -> Result<CompletionReport, RegistryError> {
        let current = self
            .registry
            .get(run_id)
            .ok_or_else(|| RegistryError::UnknownRun(run_id.to_owned()))?;

        let run = if current.is_ended() {
            current
        } else {
            let ended_at = completion.ended_at.unwrap_or_else(|| self.clock.now_ms());
            let started_at = match current.started_at {
                Some(_) => None,
                None => Some(completion.started_at.unwrap_or(ended_at)),
            };
            let patch = RunPatch {
                started_at,
                ended_at: Some(ended_at),
                outcome: Some(completion.outcome),
                ..RunPatch::default()
            };
            let updated = self
                .registry
                .mutate(run_id, &patch)?
                .ok_or_else(|| RegistryError::UnknownRun(run_id.to_owned()))?;
            tracing::info!(
                run_id = %run_id,
                status = %updated.outcome.as_ref().map(|o| o.status.to_string()).unwrap_or_default(),
                "subagent run ended"
            );
            updated
        };

        Ok(self.drive_completion(&run).await)
    }

    /// Hook first, then announce unless suppressed.
    pub(crate) async fn drive_completion(&self, run: &SubagentRun) -> CompletionReport {
        let hook_accepted = if run.ended_hook_emitted_at.is_none() {
            self.gate.invoke(run).await
        } else {
            false
        };

        let announce = match self.registry.get(&run.run_id) {
            None => AnnounceOutcome::Missing,
            Some(current) if current.is_suppressed() => AnnounceOutcome::Suppressed,
            Some(current) => self.announce.process(&current).await,
        };

        CompletionReport {
            hook_accepted,
            announce,
        }
    }

    /// Pause announce processing for a run (e.g. while a steer restart
    /// settles).
    pub fn suppress_announce(
        &self,
        run_id: &str,
        reason: impl Into<String>,
    ) -> Result<SubagentRun, RegistryError> {
        let reason = reason.into();
        tracing::info!(run_id = %run_id, reason = %reason, "suppressing announce");
        self.registry
            .mutate(run_id, &RunPatch::suppress(reason))?
            .ok_or_else(|| RegistryError::UnknownRun(run_id.to_owned()))
    }

    /// Clear a suppression reason and, for ended runs, resume completion.
    ///
    /// Child-session liveness is re-checked first; a run whose session has
    /// disappeared in the meantime is pruned instead of announced.
    pub async fn clear_suppress_announce(&self, run_id: &str) -> Result<ClearOutcome, RegistryError> {
        let run = self
            .registry
            .mutate(run_id, &RunPatch::clear_suppression())?
            .ok_or_else(|| RegistryError::UnknownRun(run_id.to_owned()))?;

        if !run.is_ended() {
            return Ok(ClearOutcome::Cleared);
        }
        if !self.session_alive(&run.child_session_key).await {
            self.prune_orphan(&run);
            return Ok(ClearOutcome::Pruned);
        }
        Ok(ClearOutcome::Completed(self.drive_completion(&run).await))
    }

    /// Session-store check. A failed lookup counts as present so uncertainty
    /// never prunes a run.
    pub(crate) async fn session_alive(&self, session_key: &str) -> bool {
        match self.sessions.exists(session_key).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(
                    child_session_key = %session_key,
                    error = %e,
                    "session store lookup failed, treating session as present"
                );
                true
            }
        }
    }

    pub(crate) fn prune_orphan(&self, run: &SubagentRun) {
        if self.registry.remove(&run.run_id).is_some() {
            tracing::info!(
                run_id = %run.run_id,
                child_session_key = %run.child_session_key,
                "pruned orphaned subagent run (child session missing)"
            );
        }
    }
}

impl std::fmt::Debug for CompletionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionPipeline")
            .field("registry", &self.registry)
            .field("gate", &self.gate)
            .field("announce", &self.announce)
            .finish()
    }
}
