//! Shared test utilities for tether integration tests.
//!
//! Provides recording fakes for every pipeline collaborator and a
//! [`TestHost`] that owns a scratch registry file. Each call to
//! [`TestHost::boot`] builds a fresh registry and pipeline over the same
//! file, which is how tests simulate a process restart.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use tether_core::{
    AnnouncePayload, Announcer, CleanupPolicy, Clock, Collaborators, CompletionPipeline,
    HookRunner, PipelineOptions, RegistryCodec, RunCompletion, RunMonitor, RunRegistry,
    SessionStore, SubagentEndedEvent, SubagentRun, TimestampMs,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Hook runner
// ---------------------------------------------------------------------------

/// Records every `subagent_ended` invocation. Fails while `fail` is set.
#[derive(Debug)]
pub struct RecordingHookRunner {
    has_hooks: bool,
    fail: AtomicBool,
    events: Mutex<Vec<SubagentEndedEvent>>,
}

impl Default for RecordingHookRunner {
    fn default() -> Self {
        Self {
            has_hooks: true,
            fail: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingHookRunner {
    /// A runtime that reports no registered handlers.
    pub fn without_hooks() -> Self {
        Self {
            has_hooks: false,
            ..Self::default()
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn events(&self) -> Vec<SubagentEndedEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl HookRunner for RecordingHookRunner {
    fn has_hooks(&self) -> bool {
        self.has_hooks
    }

    async fn run_subagent_ended(&self, event: &SubagentEndedEvent) -> Result<()> {
        lock(&self.events).push(event.clone());
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("hook handler failed for {}", event.run_id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Announcer
// ---------------------------------------------------------------------------

/// Scripted announce result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceScript {
    Deliver,
    Defer,
    Fail,
}

/// Replays queued results, then falls back to the default (deliver).
#[derive(Debug)]
pub struct ScriptedAnnouncer {
    default: Mutex<AnnounceScript>,
    queue: Mutex<VecDeque<AnnounceScript>>,
    payloads: Mutex<Vec<AnnouncePayload>>,
}

impl Default for ScriptedAnnouncer {
    fn default() -> Self {
        Self {
            default: Mutex::new(AnnounceScript::Deliver),
            queue: Mutex::new(VecDeque::new()),
            payloads: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedAnnouncer {
    pub fn set_default(&self, script: AnnounceScript) {
        *lock(&self.default) = script;
    }

    pub fn push(&self, script: AnnounceScript) {
        lock(&self.queue).push_back(script);
    }

    pub fn calls(&self) -> usize {
        lock(&self.payloads).len()
    }

    pub fn payloads(&self) -> Vec<AnnouncePayload> {
        lock(&self.payloads).clone()
    }

    pub fn announced_ids(&self) -> Vec<String> {
        lock(&self.payloads).iter().map(|p| p.run_id.clone()).collect()
    }
}

#[async_trait]
impl Announcer for ScriptedAnnouncer {
    async fn announce(&self, payload: &AnnouncePayload) -> Result<bool> {
        lock(&self.payloads).push(payload.clone());
        let script = lock(&self.queue)
            .pop_front()
            .unwrap_or_else(|| *lock(&self.default));
        match script {
            AnnounceScript::Deliver => Ok(true),
            AnnounceScript::Defer => Ok(false),
            AnnounceScript::Fail => anyhow::bail!("gateway unavailable"),
        }
    }
}

// ---------------------------------------------------------------------------
// Session store
// ---------------------------------------------------------------------------

/// In-memory session store. `set_fail(true)` makes every lookup error.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    keys: Mutex<HashSet<String>>,
    fail: AtomicBool,
    lookups: AtomicUsize,
}

impl MemorySessionStore {
    pub fn insert(&self, key: impl Into<String>) {
        lock(&self.keys).insert(key.into());
    }

    pub fn remove(&self, key: &str) {
        lock(&self.keys).remove(key);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn exists(&self, session_key: &str) -> Result<bool> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("session index unavailable");
        }
        Ok(lock(&self.keys).contains(session_key))
    }
}

// ---------------------------------------------------------------------------
// Run monitor
// ---------------------------------------------------------------------------

/// Reports preconfigured completions by run id.
#[derive(Debug, Default)]
pub struct ScriptedRunMonitor {
    completions: Mutex<HashMap<String, RunCompletion>>,
    waits: AtomicUsize,
}

impl ScriptedRunMonitor {
    pub fn finish(&self, run_id: impl Into<String>, completion: RunCompletion) {
        lock(&self.completions).insert(run_id.into(), completion);
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunMonitor for ScriptedRunMonitor {
    async fn wait_for_completion(&self, run: &SubagentRun) -> Result<Option<RunCompletion>> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.completions).get(&run.run_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: TimestampMs) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: TimestampMs) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> TimestampMs {
        self.now.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Records and files
// ---------------------------------------------------------------------------

/// Child session key used by [`run`] for `id`.
pub fn child_key(id: &str) -> String {
    format!("agent:main:subagent:{id}")
}

pub const REQUESTER: &str = "agent:main:main";

/// A freshly registered run for [`REQUESTER`], created at `1000`.
pub fn run(id: &str, cleanup: CleanupPolicy) -> SubagentRun {
    SubagentRun::new(id, child_key(id), REQUESTER, format!("task for {id}"), cleanup, 1_000)
}

/// A run that started at `1001` and ended at `1002`.
pub fn ended_run(id: &str, cleanup: CleanupPolicy) -> SubagentRun {
    let mut run = run(id, cleanup);
    run.started_at = Some(1_001);
    run.ended_at = Some(1_002);
    run
}

pub fn read_json(path: &Path) -> serde_json::Value {
    let raw = std::fs::read_to_string(path).expect("failed to read registry file");
    serde_json::from_str(&raw).expect("registry file is not JSON")
}

pub fn write_json(path: &Path, value: &serde_json::Value) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("failed to create registry dir");
    }
    let raw = serde_json::to_string_pretty(value).expect("failed to encode JSON");
    std::fs::write(path, raw).expect("failed to write registry file");
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// A scratch registry file and one shared set of fakes.
pub struct TestHost {
    _tmp: TempDir,
    path: PathBuf,
    pub hooks: Arc<RecordingHookRunner>,
    pub announcer: Arc<ScriptedAnnouncer>,
    pub sessions: Arc<MemorySessionStore>,
    pub monitor: Arc<ScriptedRunMonitor>,
    pub clock: Arc<ManualClock>,
    pub options: PipelineOptions,
}

impl TestHost {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join("subagents").join("runs.json");
        Self {
            _tmp: tmp,
            path,
            hooks: Arc::new(RecordingHookRunner::default()),
            announcer: Arc::new(ScriptedAnnouncer::default()),
            sessions: Arc::new(MemorySessionStore::default()),
            monitor: Arc::new(ScriptedRunMonitor::default()),
            clock: Arc::new(ManualClock::new(5_000)),
            options: PipelineOptions::default(),
        }
    }

    /// Swap in a hook runner that reports no registered handlers.
    pub fn without_hooks(mut self) -> Self {
        self.hooks = Arc::new(RecordingHookRunner::without_hooks());
        self
    }

    pub fn with_archive_after(mut self, archive_after: Duration) -> Self {
        self.options.archive_after = Some(archive_after);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> serde_json::Value {
        read_json(&self.path)
    }

    /// A pipeline over a fresh, empty registry handle. Nothing is loaded.
    pub fn pipeline(&self) -> CompletionPipeline {
        let registry = RunRegistry::new(RegistryCodec::new(&self.path));
        let hooks: Arc<dyn HookRunner> = Arc::clone(&self.hooks) as _;
        let announcer: Arc<dyn Announcer> = Arc::clone(&self.announcer) as _;
        let sessions: Arc<dyn SessionStore> = Arc::clone(&self.sessions) as _;
        let collaborators = Collaborators::new(hooks, announcer, sessions)
            .with_monitor(Arc::clone(&self.monitor) as _)
            .with_clock(Arc::clone(&self.clock) as _);
        CompletionPipeline::new(registry, collaborators, self.options.clone())
    }

    /// Simulate a process start: load the file and reconcile.
    pub async fn boot(&self) -> (CompletionPipeline, tether_core::ReconcileReport) {
        let pipeline = self.pipeline();
        let report = pipeline.initialize().await;
        (pipeline, report)
    }
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}
