//! Durable registry of delegated subagent runs and the pipeline that
//! reports their completion back to the requesting session.
//!
//! A host process owns one [`RunRegistry`] (persisted as a JSON file) and a
//! [`CompletionPipeline`] built around it. The pipeline fires the
//! `subagent_ended` hook at most once per run, announces completion to the
//! requester, applies the run's cleanup policy, and on startup reconciles
//! whatever the previous process left behind.

pub mod announce;
pub mod clock;
pub mod config;
pub mod error;
pub mod hooks;
pub mod inflight;
pub mod models;
pub mod monitor;
pub mod persistence;
pub mod pipeline;
pub mod query;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod sweeper;

pub use announce::{AnnounceFlow, AnnounceOutcome, AnnouncePayload, Announcer};
pub use clock::{Clock, SystemClock};
pub use config::RegistryConfig;
pub use error::{PersistenceError, RegistryError, ValidationError};
pub use hooks::{CommandHookRunner, EndedHookGate, HookRunner, NoopHookRunner, SubagentEndedEvent};
pub use models::{
    CleanupPolicy, OutcomeStatus, RequesterOrigin, RunOutcome, RunPatch, RunPhase, SubagentRun,
    TimestampMs,
};
pub use monitor::{NoopRunMonitor, RunCompletion, RunMonitor};
pub use persistence::{LoadedRegistry, RegistryCodec};
pub use pipeline::{ClearOutcome, Collaborators, CompletionPipeline, CompletionReport, PipelineOptions};
pub use query::QueryApi;
pub use reconcile::{ReconcileReport, RunDisposition};
pub use registry::RunRegistry;
pub use session::{FsSessionStore, SessionStore};
pub use sweeper::ArchiveSweeper;
