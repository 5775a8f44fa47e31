//! An [`Announcer`] that prints completion notices to stdout.

use anyhow::Result;
use async_trait::async_trait;

use tether_core::{AnnouncePayload, Announcer};

/// Always delivers.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutAnnouncer;

/// One-line completion notice for `payload`.
pub fn format_notice(payload: &AnnouncePayload) -> String {
    let what = payload.label.as_deref().unwrap_or(&payload.task);
    let status = payload
        .outcome
        .as_ref()
        .map(|o| o.status.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let mut line = format!(
        "[{}] {} -> {}: {} ({})",
        payload.run_id, payload.child_session_key, payload.requester_display_key, what, status
    );
    if let Some(error) = payload.outcome.as_ref().and_then(|o| o.error.as_deref()) {
        line.push_str(&format!(": {error}"));
    }
    line
}

#[async_trait]
impl Announcer for StdoutAnnouncer {
    async fn announce(&self, payload: &AnnouncePayload) -> Result<bool> {
        println!("{}", format_notice(payload));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{CleanupPolicy, RunOutcome, SubagentRun};

    fn payload(outcome: Option<RunOutcome>, label: Option<&str>) -> AnnouncePayload {
        let mut run = SubagentRun::new(
            "run-1",
            "agent:main:subagent:test",
            "agent:main:main",
            "summarize inbox",
            CleanupPolicy::Keep,
            1,
        )
        .with_display_key("main");
        run.outcome = outcome;
        run.label = label.map(str::to_owned);
        AnnouncePayload::from(&run)
    }

    #[test]
    fn notice_prefers_label_over_task() {
        let line = format_notice(&payload(Some(RunOutcome::ok()), Some("inbox")));
        assert_eq!(line, "[run-1] agent:main:subagent:test -> main: inbox (ok)");
    }

    #[test]
    fn notice_includes_error_text() {
        let line = format_notice(&payload(Some(RunOutcome::error("rate limited")), None));
        assert_eq!(
            line,
            "[run-1] agent:main:subagent:test -> main: summarize inbox (error): rate limited"
        );
    }

    #[test]
    fn notice_without_outcome_is_unknown() {
        assert!(format_notice(&payload(None, None)).ends_with("(unknown)"));
    }

    #[tokio::test]
    async fn stdout_announcer_always_delivers() {
        assert!(StdoutAnnouncer.announce(&payload(None, None)).await.unwrap());
    }
}
