//! "Subagent ended" hook delivery.
//!
//! [`HookRunner`] is the injected plugin runtime; [`EndedHookGate`] wraps it
//! so each run's hook succeeds at most once and failed invocations can be
//! retried later.

pub mod command;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::clock::Clock;
use crate::inflight::InFlightSet;
use crate::models::{RunOutcome, RunPatch, SubagentRun, TimestampMs};
use crate::registry::RunRegistry;

pub use command::CommandHookRunner;

/// Payload handed to `subagent_ended` hook handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentEndedEvent {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<TimestampMs>,
}

impl From<&SubagentRun> for SubagentEndedEvent {
    fn from(run: &SubagentRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            child_session_key: run.child_session_key.clone(),
            requester_session_key: run.requester_session_key.clone(),
            task: run.task.clone(),
            label: run.label.clone(),
            outcome: run.outcome.clone(),
            ended_at: run.ended_at,
        }
    }
}

/// The hook runtime's capability set.
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Whether any `subagent_ended` handlers are registered.
    fn has_hooks(&self) -> bool;

    /// Run every registered `subagent_ended` handler.
    async fn run_subagent_ended(&self, event: &SubagentEndedEvent) -> Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn HookRunner) {}
};

/// A runner with no handlers. Every run's hook is trivially satisfied.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHookRunner;

#[async_trait]
impl HookRunner for NoopHookRunner {
    fn has_hooks(&self) -> bool {
        false
    }

    async fn run_subagent_ended(&self, _event: &SubagentEndedEvent) -> Result<()> {
        Ok(())
    }
}

/// At-most-one-successful-invocation wrapper around a [`HookRunner`].
#[derive(Clone)]
pub struct EndedHookGate {
    registry: RunRegistry,
    runner: Arc<dyn HookRunner>,
    clock: Arc<dyn Clock>,
    in_flight: InFlightSet,
}

impl EndedHookGate {
    pub fn new(registry: RunRegistry, runner: Arc<dyn HookRunner>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            runner,
            clock,
            in_flight: InFlightSet::new(),
        }
    }

    /// Fire the ended hook for `run` unless it already fired or is firing.
    ///
    /// Returns `true` when the marker was set by this call. A hook error
    /// leaves the marker unset and returns `false`.
    pub async fn invoke(&self, run: &SubagentRun) -> bool {
        if run.run_id.trim().is_empty() || run.ended_hook_emitted_at.is_some() {
            return false;
        }
        let Some(_guard) = self.in_flight.try_acquire(&run.run_id) else {
            tracing::debug!(run_id = %run.run_id, "ended hook already in flight");
            return false;
        };

        // Another caller may have set the marker between the caller's read
        // and our claim.
        let current = self.registry.get(&run.run_id);
        if current.as_ref().is_some_and(|r| r.ended_hook_emitted_at.is_some()) {
            return false;
        }
        let run = current.as_ref().unwrap_or(run);

        if self.runner.has_hooks() {
            let event = SubagentEndedEvent::from(run);
            if let Err(e) = self.runner.run_subagent_ended(&event).await {
                tracing::warn!(
                    run_id = %run.run_id,
                    error = %e,
                    "subagent_ended hook failed, will retry"
                );
                return false;
            }
            tracing::info!(run_id = %run.run_id, "subagent_ended hook delivered");
        } else {
            tracing::debug!(run_id = %run.run_id, "no subagent_ended hooks registered");
        }

        let patch = RunPatch::ended_hook_emitted(self.clock.now_ms());
        if let Err(e) = self.registry.mutate(&run.run_id, &patch) {
            tracing::warn!(
                run_id = %run.run_id,
                error = %e,
                "failed to record ended hook marker"
            );
            return false;
        }
        true
    }

    pub fn is_in_flight(&self, run_id: &str) -> bool {
        self.in_flight.contains(run_id)
    }
}

impl std::fmt::Debug for EndedHookGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndedHookGate")
            .field("has_hooks", &self.runner.has_hooks())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
