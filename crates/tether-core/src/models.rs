use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Milliseconds since the Unix epoch.
pub type TimestampMs = i64;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What happens to the child session once completion has been reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Retain the child session and mark the run handled.
    #[default]
    Keep,
    /// Remove the run (and, downstream, the child session) after announce.
    Delete,
}

impl fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Keep => "keep",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

impl FromStr for CleanupPolicy {
    type Err = CleanupPolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep" => Ok(Self::Keep),
            "delete" => Ok(Self::Delete),
            other => Err(CleanupPolicyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CleanupPolicy`] string.
#[derive(Debug, Clone)]
pub struct CleanupPolicyParseError(pub String);

impl fmt::Display for CleanupPolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid cleanup policy: {:?}", self.0)
    }
}

impl std::error::Error for CleanupPolicyParseError {}

// ---------------------------------------------------------------------------

/// How a child run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Ok,
    Error,
    Timeout,
    Killed,
    Unknown,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Terminal outcome recorded alongside `endedAt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn ok() -> Self {
        Self {
            status: OutcomeStatus::Ok,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Error,
            error: Some(message.into()),
        }
    }

    pub fn killed() -> Self {
        Self {
            status: OutcomeStatus::Killed,
            error: None,
        }
    }
}

/// Derived, human-facing phase of a run. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Registered but the engine has not reported a start.
    Registered,
    Running,
    /// Ended, completion not yet reported to the requester.
    Ended,
    /// Completion reported and cleanup applied.
    Settled,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::Running => "running",
            Self::Ended => "ended",
            Self::Settled => "settled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Where the requester's conversation lives (chat channel + account).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequesterOrigin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl RequesterOrigin {
    pub fn new(channel: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            account_id: Some(account_id.into()),
        }
    }

    /// Build an origin from possibly-blank parts.
    ///
    /// Blank strings are dropped; returns `None` when nothing remains.
    pub fn normalize(channel: Option<String>, account_id: Option<String>) -> Option<Self> {
        let clean = |v: Option<String>| {
            v.map(|s| s.trim().to_owned()).filter(|s| !s.is_empty())
        };
        let origin = Self {
            channel: clean(channel),
            account_id: clean(account_id),
        };
        if origin.channel.is_none() && origin.account_id.is_none() {
            None
        } else {
            Some(origin)
        }
    }
}

/// A delegated task executed by a child agent session on behalf of a
/// requester session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentRun {
    /// Redundant with the registry file's map key, which wins on load.
    #[serde(default)]
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    #[serde(default)]
    pub requester_display_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_origin: Option<RequesterOrigin>,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: TimestampMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<TimestampMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<TimestampMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_hook_emitted_at: Option<TimestampMs>,
    #[serde(default)]
    pub cleanup_handled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_completed_at: Option<TimestampMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_at: Option<TimestampMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppress_announce_reason: Option<String>,
}

impl SubagentRun {
    /// Create a freshly registered run with no lifecycle timestamps beyond
    /// `created_at`.
    pub fn new(
        run_id: impl Into<String>,
        child_session_key: impl Into<String>,
        requester_session_key: impl Into<String>,
        task: impl Into<String>,
        cleanup: CleanupPolicy,
        created_at: TimestampMs,
    ) -> Self {
        let requester_session_key = requester_session_key.into();
        Self {
            run_id: run_id.into(),
            child_session_key: child_session_key.into(),
            requester_display_key: requester_session_key.clone(),
            requester_session_key,
            requester_origin: None,
            task: task.into(),
            cleanup,
            label: None,
            model: None,
            created_at,
            started_at: None,
            ended_at: None,
            outcome: None,
            ended_hook_emitted_at: None,
            cleanup_handled: false,
            cleanup_completed_at: None,
            archive_at: None,
            suppress_announce_reason: None,
        }
    }

    pub fn with_display_key(mut self, display_key: impl Into<String>) -> Self {
        self.requester_display_key = display_key.into();
        self
    }

    pub fn with_origin(mut self, origin: RequesterOrigin) -> Self {
        self.requester_origin = Some(origin);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Announce processing is paused while a non-blank reason is present.
    pub fn is_suppressed(&self) -> bool {
        self.suppress_announce_reason
            .as_deref()
            .is_some_and(|r| !r.trim().is_empty())
    }

    /// Both completion flows have finished for this run.
    pub fn has_pending_work(&self) -> bool {
        !(self.ended_hook_emitted_at.is_some() && self.cleanup_handled)
    }

    /// Whether reconciliation may skip this run without consulting the
    /// session store.
    ///
    /// A handled cleanup settles the run even when the ended-hook marker is
    /// missing: the requester already received the completion notice.
    pub fn is_settled(&self) -> bool {
        !self.has_pending_work() || self.cleanup_handled
    }

    pub fn phase(&self) -> RunPhase {
        if self.cleanup_handled {
            RunPhase::Settled
        } else if self.ended_at.is_some() {
            RunPhase::Ended
        } else if self.started_at.is_some() {
            RunPhase::Running
        } else {
            RunPhase::Registered
        }
    }

    /// Check the record-level invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.run_id.trim().is_empty() {
            return Err(ValidationError::BlankRunId);
        }
        match (self.started_at, self.ended_at) {
            (None, Some(_)) => {
                return Err(self.out_of_order("endedAt", "run ended before it started".into()));
            }
            (Some(started), _) if started < self.created_at => {
                return Err(self.out_of_order(
                    "startedAt",
                    format!("startedAt {started} precedes createdAt {}", self.created_at),
                ));
            }
            (Some(started), Some(ended)) if ended < started => {
                return Err(self.out_of_order(
                    "endedAt",
                    format!("endedAt {ended} precedes startedAt {started}"),
                ));
            }
            _ => {}
        }
        if self.cleanup_handled && self.cleanup_completed_at.is_none() {
            return Err(ValidationError::MissingCleanupTimestamp(self.run_id.clone()));
        }
        Ok(())
    }

    fn out_of_order(&self, field: &'static str, detail: String) -> ValidationError {
        ValidationError::OutOfOrder {
            run_id: self.run_id.clone(),
            field,
            detail,
        }
    }
}

/// A partial update applied through the registry's `mutate`.
///
/// `None` leaves a field untouched. `suppress_announce_reason` takes
/// `Some(None)` to clear the reason.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunPatch {
    pub started_at: Option<TimestampMs>,
    pub ended_at: Option<TimestampMs>,
    pub outcome: Option<RunOutcome>,
    pub ended_hook_emitted_at: Option<TimestampMs>,
    pub cleanup_handled: Option<bool>,
    pub cleanup_completed_at: Option<TimestampMs>,
    pub archive_at: Option<TimestampMs>,
    pub suppress_announce_reason: Option<Option<String>>,
}

impl RunPatch {
    pub fn started(at: TimestampMs) -> Self {
        Self {
            started_at: Some(at),
            ..Self::default()
        }
    }

    pub fn ended_hook_emitted(at: TimestampMs) -> Self {
        Self {
            ended_hook_emitted_at: Some(at),
            ..Self::default()
        }
    }

    pub fn suppress(reason: impl Into<String>) -> Self {
        Self {
            suppress_announce_reason: Some(Some(reason.into())),
            ..Self::default()
        }
    }

    pub fn clear_suppression() -> Self {
        Self {
            suppress_announce_reason: Some(None),
            ..Self::default()
        }
    }

    /// Apply to a copy of `run` and validate the result.
    ///
    /// `run` is left untouched when the patched record would violate an
    /// invariant.
    pub fn apply(&self, run: &SubagentRun) -> Result<SubagentRun, ValidationError> {
        let mut next = run.clone();
        if let Some(at) = self.started_at {
            next.started_at = Some(at);
        }
        if let Some(at) = self.ended_at {
            next.ended_at = Some(at);
        }
        if let Some(ref outcome) = self.outcome {
            next.outcome = Some(outcome.clone());
        }
        if let Some(at) = self.ended_hook_emitted_at {
            next.ended_hook_emitted_at = Some(at);
        }
        if let Some(handled) = self.cleanup_handled {
            next.cleanup_handled = handled;
        }
        if let Some(at) = self.cleanup_completed_at {
            next.cleanup_completed_at = Some(at);
        }
        if let Some(at) = self.archive_at {
            next.archive_at = Some(at);
        }
        if let Some(ref reason) = self.suppress_announce_reason {
            next.suppress_announce_reason = reason.clone();
        }
        next.validate()?;
        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
