//! Per-run in-flight guards.
//!
//! A run id is held in the set for the lifetime of an [`InFlightGuard`];
//! dropping the guard releases it on every return path, including panics
//! and early `?` returns.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// A shared set of run ids currently being processed by one flow.
#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `run_id`. Returns `None` if it is already claimed.
    pub fn try_acquire(&self, run_id: &str) -> Option<InFlightGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        if !ids.insert(run_id.to_owned()) {
            return None;
        }
        Some(InFlightGuard {
            ids: Arc::clone(&self.ids),
            run_id: run_id.to_owned(),
        })
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(run_id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its run id from the owning [`InFlightSet`] on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    run_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.run_id);
    }
}
