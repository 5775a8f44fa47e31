//! `tether list` command: the runs a requester has spawned.

use std::path::Path;

use anyhow::{Context, Result};

use tether_core::{QueryApi, RunPhase, RunRegistry, SubagentRun};

/// Open the registry file for reading. Legacy files are migrated in memory
/// only; nothing is written back.
pub fn open_query(registry_path: &Path) -> Result<QueryApi> {
    let (registry, loaded) = RunRegistry::load_existing(registry_path)
        .with_context(|| format!("failed to load registry at {}", registry_path.display()))?;
    if loaded.skipped > 0 {
        eprintln!("warning: {} undecodable record(s) ignored", loaded.skipped);
    }
    Ok(QueryApi::new(registry))
}

/// Run the list command.
pub fn run_list(registry_path: &Path, requester: &str) -> Result<()> {
    let runs = open_query(registry_path)?.list_subagent_runs_for_requester(requester);

    if runs.is_empty() {
        println!("No subagent runs for {requester}.");
        return Ok(());
    }

    println!("{:<24} {:<32} {:<10} {:<8} {}", "RUN", "TASK", "PHASE", "CLEANUP", "OUTCOME");
    println!("{}", "-".repeat(90));
    for run in &runs {
        println!("{}", format_row(run));
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        s.to_string()
    }
}

pub fn format_row(run: &SubagentRun) -> String {
    let phase = match run.phase() {
        RunPhase::Ended if run.is_suppressed() => "held".to_string(),
        phase => phase.to_string(),
    };
    let outcome = run
        .outcome
        .as_ref()
        .map(|o| o.status.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<24} {:<32} {:<10} {:<8} {}",
        truncate(&run.run_id, 24),
        truncate(run.label.as_deref().unwrap_or(&run.task), 30),
        phase,
        run.cleanup,
        outcome
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{CleanupPolicy, RegistryCodec, RunOutcome};

    fn sample() -> SubagentRun {
        SubagentRun::new(
            "run-1",
            "agent:main:subagent:test",
            "agent:main:main",
            "a very long task description that will not fit",
            CleanupPolicy::Delete,
            1,
        )
    }

    #[test]
    fn row_truncates_long_tasks() {
        let row = format_row(&sample());
        assert!(row.contains("a very long task description..."), "row: {row}");
        assert!(row.contains("registered"));
        assert!(row.contains("delete"));
    }

    #[test]
    fn row_marks_held_runs() {
        let mut run = sample().with_label("digest");
        run.started_at = Some(2);
        run.ended_at = Some(3);
        run.outcome = Some(RunOutcome::killed());
        run.suppress_announce_reason = Some("steer-restart".into());
        let row = format_row(&run);
        assert!(row.contains("digest"));
        assert!(row.contains("held"));
        assert!(row.ends_with("killed"));
    }

    #[test]
    fn missing_registry_lists_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let query = open_query(&tmp.path().join("runs.json")).unwrap();
        assert!(query.list_subagent_runs_for_requester("agent:main:main").is_empty());
    }

    #[test]
    fn query_lists_only_the_requester_runs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("runs.json");
        let other = SubagentRun::new(
            "run-2",
            "agent:main:subagent:other",
            "agent:other:main",
            "elsewhere",
            CleanupPolicy::Keep,
            2,
        );
        RegistryCodec::new(&path).save([&sample(), &other]).unwrap();

        let ids: Vec<_> = open_query(&path)
            .unwrap()
            .list_subagent_runs_for_requester("agent:main:main")
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec!["run-1"]);
    }

    #[test]
    fn malformed_registry_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("runs.json");
        std::fs::write(&path, "nope").unwrap();
        let msg = format!("{:#}", open_query(&path).unwrap_err());
        assert!(msg.contains("failed to load registry"), "unexpected error: {msg}");
    }
}
