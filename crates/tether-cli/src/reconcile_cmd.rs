//! `tether reconcile` command: load, migrate and reconcile the registry.

use std::sync::Arc;

use anyhow::Result;

use tether_core::{
    Collaborators, CommandHookRunner, CompletionPipeline, FsSessionStore, HookRunner,
    NoopHookRunner, PipelineOptions, ReconcileReport, RegistryCodec, RunRegistry,
};

use crate::announcer::StdoutAnnouncer;
use crate::config::TetherConfig;

fn hook_runner(config: &TetherConfig) -> Arc<dyn HookRunner> {
    match CommandHookRunner::from_argv(&config.hook_command) {
        Some(runner) => Arc::new(runner.with_timeout(config.hook_timeout)),
        None => Arc::new(NoopHookRunner),
    }
}

/// Build the pipeline the CLI runs with.
pub fn build_pipeline(config: &TetherConfig) -> CompletionPipeline {
    let registry = RunRegistry::new(RegistryCodec::new(&config.registry.registry_path));
    let collaborators = Collaborators::new(
        hook_runner(config),
        Arc::new(StdoutAnnouncer),
        Arc::new(FsSessionStore::new(&config.sessions_index)),
    );
    let options = PipelineOptions {
        archive_after: config.registry.archive_after,
    };
    CompletionPipeline::new(registry, collaborators, options)
}

/// Run the reconcile command.
pub async fn run_reconcile(config: &TetherConfig) -> Result<()> {
    tracing::debug!(
        registry = %config.registry.registry_path.display(),
        sessions_index = %config.sessions_index.display(),
        hooks = !config.hook_command.is_empty(),
        "starting reconciliation"
    );
    let pipeline = build_pipeline(config);
    let report = pipeline.initialize().await;
    print_report(&report);
    Ok(())
}

fn print_group(label: &str, ids: &[String]) {
    if ids.is_empty() {
        return;
    }
    println!("  {label} ({}):", ids.len());
    for id in ids {
        println!("    {id}");
    }
}

fn print_report(report: &ReconcileReport) {
    println!("Reconciled {} run(s), {} hook(s) fired.", report.total(), report.hooks_fired);
    print_group("announced", &report.announced);
    print_group("deferred", &report.deferred);
    print_group("suppressed", &report.suppressed);
    print_group("pruned", &report.pruned);
    print_group("still running", &report.running);
    print_group("skipped", &report.skipped);
}
