//! Interface to the execution engine for runs that were still executing
//! when the previous process exited.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{RunOutcome, SubagentRun, TimestampMs};

/// How the engine reports a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCompletion {
    /// Reported start time, if the registry never saw one.
    pub started_at: Option<TimestampMs>,
    /// Defaults to "now" when absent.
    pub ended_at: Option<TimestampMs>,
    pub outcome: RunOutcome,
}

impl RunCompletion {
    pub fn new(outcome: RunOutcome) -> Self {
        Self {
            started_at: None,
            ended_at: None,
            outcome,
        }
    }

    pub fn at(mut self, ended_at: TimestampMs) -> Self {
        self.ended_at = Some(ended_at);
        self
    }
}

/// Waits for a run to finish.
#[async_trait]
pub trait RunMonitor: Send + Sync {
    /// Resolve to the run's completion, or `None` when the engine cannot
    /// say (unknown run, engine unreachable).
    ///
    /// Called from startup reconciliation, which does not finish until this
    /// resolves.
    async fn wait_for_completion(&self, run: &SubagentRun) -> Result<Option<RunCompletion>>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn RunMonitor) {}
};

/// Knows nothing about running work. Unfinished runs stay as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRunMonitor;

#[async_trait]
impl RunMonitor for NoopRunMonitor {
    async fn wait_for_completion(&self, _run: &SubagentRun) -> Result<Option<RunCompletion>> {
        Ok(None)
    }
}
