//! Read-only views over the registry for host code.

use crate::models::SubagentRun;
use crate::registry::RunRegistry;

/// Read-only handle to a [`RunRegistry`].
#[derive(Debug, Clone)]
pub struct QueryApi {
    registry: RunRegistry,
}

impl QueryApi {
    pub fn new(registry: RunRegistry) -> Self {
        Self { registry }
    }

    /// The requester's current runs in registration order. Pruned and
    /// deleted runs are absent.
    pub fn list_subagent_runs_for_requester(&self, requester_session_key: &str) -> Vec<SubagentRun> {
        self.registry.list_by_requester(requester_session_key)
    }

    pub fn get(&self, run_id: &str) -> Option<SubagentRun> {
        self.registry.get(run_id)
    }

    /// Runs for the requester that have not ended.
    pub fn count_active_runs_for_requester(&self, requester_session_key: &str) -> usize {
        self.registry.count_active_for_requester(requester_session_key)
    }
}
