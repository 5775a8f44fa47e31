//! On-disk document shapes and the version 1 -> 2 migration.
//!
//! The raw document is first split into a [`SchemaDocument`] by its
//! `version` field. Records are then decoded one at a time; a bad entry is
//! dropped on its own.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PersistenceError, ValidationError};
use crate::models::{
    CleanupPolicy, RequesterOrigin, RunOutcome, SubagentRun, TimestampMs,
};

/// Version written by this crate.
pub const CURRENT_VERSION: u64 = 2;

/// A registry document, tagged by schema version. Record bodies stay raw
/// until [`SchemaDocument::decode`].
#[derive(Debug)]
pub enum SchemaDocument {
    V1(BTreeMap<String, Value>),
    V2(BTreeMap<String, Value>),
}

#[derive(Deserialize)]
struct Envelope {
    version: Option<u64>,
    #[serde(default)]
    runs: BTreeMap<String, Value>,
}

/// Borrowed view used when writing.
#[derive(Serialize)]
pub(crate) struct DocumentRef<'a> {
    pub version: u64,
    pub runs: BTreeMap<&'a str, &'a SubagentRun>,
}

/// A record as written before requester origins were nested and before
/// `announce*` was renamed to `cleanup*`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecordV1 {
    #[serde(default)]
    pub run_id: Option<String>,
    pub child_session_key: String,
    pub requester_session_key: String,
    #[serde(default)]
    pub requester_display_key: Option<String>,
    #[serde(default)]
    pub requester_channel: Option<String>,
    #[serde(default)]
    pub requester_account_id: Option<String>,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub created_at: TimestampMs,
    #[serde(default)]
    pub started_at: Option<TimestampMs>,
    #[serde(default)]
    pub ended_at: Option<TimestampMs>,
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
    #[serde(default)]
    pub ended_hook_emitted_at: Option<TimestampMs>,
    #[serde(default)]
    pub announce_handled: Option<bool>,
    #[serde(default)]
    pub announce_completed_at: Option<TimestampMs>,
    #[serde(default)]
    pub suppress_announce_reason: Option<String>,
}

/// Split raw bytes into a versioned document.
pub fn parse_document(bytes: &[u8]) -> Result<SchemaDocument, PersistenceError> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| PersistenceError::Malformed(e.to_string()))?;
    match envelope.version.unwrap_or(1) {
        1 => Ok(SchemaDocument::V1(envelope.runs)),
        2 => Ok(SchemaDocument::V2(envelope.runs)),
        other => Err(PersistenceError::UnsupportedVersion(other)),
    }
}

/// Map a version 1 record onto the current shape. The flat legacy fields
/// do not survive.
pub fn migrate_v1(key: &str, legacy: RunRecordV1) -> SubagentRun {
    let run_id = legacy
        .run_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| key.to_owned());
    let requester_display_key = legacy
        .requester_display_key
        .unwrap_or_else(|| legacy.requester_session_key.clone());

    SubagentRun {
        run_id,
        child_session_key: legacy.child_session_key,
        requester_session_key: legacy.requester_session_key,
        requester_display_key,
        requester_origin: RequesterOrigin::normalize(
            legacy.requester_channel,
            legacy.requester_account_id,
        ),
        task: legacy.task,
        cleanup: legacy.cleanup,
        label: legacy.label,
        model: legacy.model,
        created_at: legacy.created_at,
        started_at: legacy.started_at,
        ended_at: legacy.ended_at,
        outcome: legacy.outcome,
        ended_hook_emitted_at: legacy.ended_hook_emitted_at,
        cleanup_handled: legacy.announce_handled.unwrap_or(false),
        cleanup_completed_at: legacy.announce_completed_at,
        archive_at: None,
        suppress_announce_reason: legacy.suppress_announce_reason,
    }
}

/// Result of decoding every record in a [`SchemaDocument`].
#[derive(Debug, Default)]
pub struct DecodedDocument {
    pub runs: Vec<SubagentRun>,
    /// Records that came through the v1 migration.
    pub migrated: usize,
    /// Records that failed to decode and were dropped.
    pub skipped: usize,
}

impl SchemaDocument {
    /// Decode all records. Undecodable records are logged and skipped.
    ///
    /// The map key is authoritative for the run id.
    pub fn decode(self) -> DecodedDocument {
        let (legacy, bodies) = match self {
            Self::V1(runs) => (true, runs),
            Self::V2(runs) => (false, runs),
        };
        let mut out = DecodedDocument::default();
        for (key, body) in bodies {
            let decoded = if legacy {
                serde_json::from_value::<RunRecordV1>(body).map(|r| migrate_v1(&key, r))
            } else {
                serde_json::from_value::<SubagentRun>(body)
            };
            match decoded {
                Ok(run) => match normalize_loaded(&key, run) {
                    Ok(run) => {
                        if legacy {
                            out.migrated += 1;
                        }
                        out.runs.push(run);
                    }
                    Err(e) => {
                        tracing::warn!(run_id = %key, error = %e, "skipping invalid registry record");
                        out.skipped += 1;
                    }
                },
                Err(e) => {
                    tracing::warn!(run_id = %key, error = %e, "skipping undecodable registry record");
                    out.skipped += 1;
                }
            }
        }
        out
    }
}

/// Bring a loaded record back within the record invariants so later
/// marker patches validate.
fn normalize_loaded(key: &str, mut run: SubagentRun) -> Result<SubagentRun, ValidationError> {
    run.run_id = key.to_owned();
    // A handled marker without its timestamp predates the invariant;
    // backfill from the closest lifecycle timestamp.
    if run.cleanup_handled && run.cleanup_completed_at.is_none() {
        run.cleanup_completed_at = Some(run.ended_at.unwrap_or(run.created_at));
    }
    // Older writers recorded an end without a start.
    if run.started_at.is_none() && run.ended_at.is_some() {
        run.started_at = run.ended_at;
    }
    // Clock skew between writers: pull earlier timestamps down rather than
    // discard the recorded end.
    if let (Some(started), Some(ended)) = (run.started_at, run.ended_at) {
        if ended < started {
            run.started_at = Some(ended);
        }
    }
    if let Some(started) = run.started_at {
        run.created_at = run.created_at.min(started);
    }
    run.validate()?;
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_version_is_v1() {
        let doc = parse_document(br#"{"runs":{}}"#).unwrap();
        assert!(matches!(doc, SchemaDocument::V1(_)));
    }

    #[test]
    fn future_version_is_rejected() {
        let err = parse_document(br#"{"version":7,"runs":{}}"#).unwrap_err();
        assert!(matches!(err, PersistenceError::UnsupportedVersion(7)));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = parse_document(b"{not json").unwrap_err();
        assert!(matches!(err, PersistenceError::Malformed(_)));
    }

    #[test]
    fn v1_record_migrates_flat_fields() {
        let body = json!({
            "runId": "run-legacy",
            "childSessionKey": "agent:main:subagent:legacy",
            "requesterSessionKey": "agent:main:main",
            "requesterDisplayKey": "main",
            "requesterChannel": "whatsapp",
            "requesterAccountId": "legacy-account",
            "task": "legacy task",
            "cleanup": "keep",
            "createdAt": 1,
            "startedAt": 1,
            "endedAt": 2,
            "announceHandled": true,
            "announceCompletedAt": 9
        });
        let decoded = SchemaDocument::V1(BTreeMap::from([("run-legacy".to_owned(), body)])).decode();
        assert_eq!(decoded.migrated, 1);
        let run = decoded.runs.into_iter().next().unwrap();
        assert!(run.cleanup_handled);
        assert_eq!(run.cleanup_completed_at, Some(9));
        let origin = run.requester_origin.as_ref().unwrap();
        assert_eq!(origin.channel.as_deref(), Some("whatsapp"));
        assert_eq!(origin.account_id.as_deref(), Some("legacy-account"));

        let out = serde_json::to_value(&run).unwrap();
        assert!(out.get("announceHandled").is_none());
        assert!(out.get("requesterChannel").is_none());
    }

    #[test]
    fn map_key_wins_over_body_run_id() {
        let body = json!({
            "runId": "other",
            "childSessionKey": "c",
            "requesterSessionKey": "p",
            "createdAt": 1
        });
        let decoded = SchemaDocument::V2(BTreeMap::from([("run-key".to_owned(), body)])).decode();
        assert_eq!(decoded.migrated, 0);
        assert_eq!(decoded.runs[0].run_id, "run-key");
    }

    #[test]
    fn handled_marker_without_timestamp_is_backfilled() {
        let body = json!({
            "childSessionKey": "c",
            "requesterSessionKey": "p",
            "createdAt": 3,
            "startedAt": 4,
            "endedAt": 5,
            "cleanupHandled": true
        });
        let decoded = SchemaDocument::V2(BTreeMap::from([("r".to_owned(), body)])).decode();
        assert_eq!(decoded.runs[0].cleanup_completed_at, Some(5));
    }

    #[test]
    fn end_without_start_is_backfilled() {
        let body = json!({
            "childSessionKey": "c",
            "requesterSessionKey": "p",
            "createdAt": 3,
            "endedAt": 5
        });
        let decoded = SchemaDocument::V2(BTreeMap::from([("r".to_owned(), body)])).decode();
        assert_eq!(decoded.runs[0].started_at, Some(5));
        assert!(decoded.runs[0].validate().is_ok());
    }

    #[test]
    fn skewed_timestamps_are_repaired() {
        let body = json!({
            "childSessionKey": "c",
            "requesterSessionKey": "p",
            "createdAt": 10,
            "startedAt": 8,
            "endedAt": 6
        });
        let decoded = SchemaDocument::V2(BTreeMap::from([("r".to_owned(), body)])).decode();
        let run = &decoded.runs[0];
        assert_eq!((run.created_at, run.started_at, run.ended_at), (6, Some(6), Some(6)));
        assert!(run.validate().is_ok());
    }

    #[test]
    fn blank_map_key_is_skipped() {
        let runs = BTreeMap::from([(
            "  ".to_owned(),
            json!({"runId": "named", "childSessionKey": "c", "requesterSessionKey": "p", "createdAt": 1}),
        )]);
        let decoded = SchemaDocument::V2(runs).decode();
        assert_eq!(decoded.skipped, 1);
        assert!(decoded.runs.is_empty());
    }

    #[test]
    fn undecodable_record_is_skipped() {
        let runs = BTreeMap::from([
            ("bad".to_owned(), json!({"createdAt": "yesterday"})),
            (
                "good".to_owned(),
                json!({"childSessionKey": "c", "requesterSessionKey": "p", "createdAt": 1}),
            ),
        ]);
        let decoded = SchemaDocument::V2(runs).decode();
        assert_eq!(decoded.skipped, 1);
        assert_eq!(decoded.runs.len(), 1);
        assert_eq!(decoded.runs[0].run_id, "good");
    }
}
