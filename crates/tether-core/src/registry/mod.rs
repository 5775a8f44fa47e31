//! The authoritative in-memory run registry.
//!
//! [`RunRegistry`] owns the `run_id -> SubagentRun` map together with a
//! requester index, and writes every mutation through to the registry file
//! before returning. It is a cheap, cloneable handle; all clones share the
//! same state.
//!
//! The state mutex is never held across an `.await`. File writes happen
//! under it so snapshots land on disk in mutation order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{PersistenceError, ValidationError};
use crate::models::{RunPatch, SubagentRun};
use crate::persistence::{LoadedRegistry, RegistryCodec};

#[derive(Debug, Default)]
struct RegistryState {
    runs: HashMap<String, SubagentRun>,
    /// Registration order.
    order: Vec<String>,
    /// requester session key -> run ids in registration order.
    by_requester: HashMap<String, Vec<String>>,
}

impl RegistryState {
    fn insert(&mut self, run: SubagentRun) {
        self.order.push(run.run_id.clone());
        self.by_requester
            .entry(run.requester_session_key.clone())
            .or_default()
            .push(run.run_id.clone());
        self.runs.insert(run.run_id.clone(), run);
    }

    fn remove(&mut self, run_id: &str) -> Option<SubagentRun> {
        let run = self.runs.remove(run_id)?;
        self.order.retain(|id| id != run_id);
        if let Some(ids) = self.by_requester.get_mut(&run.requester_session_key) {
            ids.retain(|id| id != run_id);
            if ids.is_empty() {
                self.by_requester.remove(&run.requester_session_key);
            }
        }
        Some(run)
    }

    fn ordered(&self) -> impl Iterator<Item = &SubagentRun> {
        self.order.iter().filter_map(|id| self.runs.get(id))
    }
}

struct Inner {
    state: Mutex<RegistryState>,
    codec: RegistryCodec,
}

/// Handle to the run registry.
#[derive(Clone)]
pub struct RunRegistry {
    inner: Arc<Inner>,
}

impl RunRegistry {
    /// Create an empty registry backed by `codec`. Nothing is read from disk;
    /// see [`Self::reload`].
    pub fn new(codec: RegistryCodec) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RegistryState::default()),
                codec,
            }),
        }
    }

    /// Create a registry and populate it from the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> (Self, LoadedRegistry) {
        let registry = Self::new(RegistryCodec::new(path.as_ref()));
        let loaded = registry.reload();
        (registry, loaded)
    }

    pub fn path(&self) -> &Path {
        self.inner.codec.path()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace in-memory state with the file contents (migrating legacy
    /// records). Returns the load summary; the `runs` it carries are a copy
    /// of what was installed.
    pub fn reload(&self) -> LoadedRegistry {
        let loaded = self.inner.codec.load();
        self.install(&loaded);
        loaded
    }

    /// Open the file at `path` without the degrade-to-empty policy and
    /// without rewriting migrated records. For read-only callers.
    pub fn load_existing(path: impl AsRef<Path>) -> Result<(Self, LoadedRegistry), PersistenceError> {
        let registry = Self::new(RegistryCodec::new(path.as_ref()));
        let loaded = registry.inner.codec.try_load()?;
        registry.install(&loaded);
        Ok((registry, loaded))
    }

    fn install(&self, loaded: &LoadedRegistry) {
        let mut state = self.state();
        *state = RegistryState::default();
        for run in &loaded.runs {
            if state.runs.contains_key(&run.run_id) {
                continue;
            }
            state.insert(run.clone());
        }
        tracing::debug!(
            path = %self.path().display(),
            runs = state.runs.len(),
            migrated = loaded.migrated,
            skipped = loaded.skipped,
            "loaded subagent registry"
        );
    }

    /// Best-effort write-through. Failures are logged; the prior file stays
    /// intact.
    fn persist(&self, state: &RegistryState) {
        if let Err(e) = self.inner.codec.save(state.ordered()) {
            tracing::warn!(
                path = %self.path().display(),
                error = %e,
                "failed to persist subagent registry"
            );
        }
    }

    /// Register a new run.
    ///
    /// Fails if the run id is blank, already present, or the record's
    /// timestamps are out of order.
    pub fn register(&self, run: SubagentRun) -> Result<(), ValidationError> {
        run.validate()?;
        let mut state = self.state();
        if state.runs.contains_key(&run.run_id) {
            return Err(ValidationError::DuplicateRunId(run.run_id));
        }
        tracing::info!(
            run_id = %run.run_id,
            child_session_key = %run.child_session_key,
            requester_session_key = %run.requester_session_key,
            cleanup = %run.cleanup,
            "registered subagent run"
        );
        state.insert(run);
        self.persist(&state);
        Ok(())
    }

    pub fn get(&self, run_id: &str) -> Option<SubagentRun> {
        self.state().runs.get(run_id).cloned()
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.state().runs.contains_key(run_id)
    }

    /// Remove a run and persist. Returns the removed record.
    pub fn remove(&self, run_id: &str) -> Option<SubagentRun> {
        let mut state = self.state();
        let removed = state.remove(run_id)?;
        self.persist(&state);
        Some(removed)
    }

    /// Apply a partial update and persist.
    ///
    /// Returns `Ok(None)` without touching anything when `run_id` is
    /// unknown, and the updated record otherwise.
    pub fn mutate(
        &self,
        run_id: &str,
        patch: &RunPatch,
    ) -> Result<Option<SubagentRun>, ValidationError> {
        let mut state = self.state();
        let Some(current) = state.runs.get(run_id) else {
            return Ok(None);
        };
        let next = patch.apply(current)?;
        if &next == current {
            return Ok(Some(next));
        }
        state.runs.insert(run_id.to_owned(), next.clone());
        self.persist(&state);
        Ok(Some(next))
    }

    /// Runs for a requester, in registration order.
    pub fn list_by_requester(&self, requester_session_key: &str) -> Vec<SubagentRun> {
        let state = self.state();
        state
            .by_requester
            .get(requester_session_key)
            .map(|ids| ids.iter().filter_map(|id| state.runs.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    /// Runs for a requester that have not ended yet.
    pub fn count_active_for_requester(&self, requester_session_key: &str) -> usize {
        let state = self.state();
        state
            .by_requester
            .get(requester_session_key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.runs.get(id))
                    .filter(|run| !run.is_ended())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Every run, in registration order.
    pub fn snapshot(&self) -> Vec<SubagentRun> {
        self.state().ordered().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for RunRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRegistry")
            .field("path", &self.path())
            .field("runs", &self.len())
            .finish()
    }
}
