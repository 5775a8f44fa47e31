//! Durable on-disk representation of the run registry.
//!
//! The registry lives in a single JSON document (`{"version": 2, "runs":
//! {...}}`). Writes go to a temp file in the same directory and are renamed
//! over the target, so a crash mid-write leaves the previous file intact.
//! Reads never fail the caller: a missing or malformed file is an empty
//! registry.

pub mod schema;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::PersistenceError;
use crate::models::SubagentRun;

use schema::{CURRENT_VERSION, DocumentRef, parse_document};

/// What a load produced, with counters for logging and tests.
#[derive(Debug, Default)]
pub struct LoadedRegistry {
    /// Runs sorted by `created_at`, then `run_id`.
    pub runs: Vec<SubagentRun>,
    pub migrated: usize,
    pub skipped: usize,
    /// Whether the file was rewritten at the current version after migration.
    pub rewritten: bool,
}

/// Reads and writes the registry file at a fixed path.
#[derive(Debug, Clone)]
pub struct RegistryCodec {
    path: PathBuf,
}

impl RegistryCodec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the registry, migrating legacy records.
    ///
    /// Never fails. If any record was migrated the whole file is rewritten
    /// at the current version before returning.
    pub fn load(&self) -> LoadedRegistry {
        let mut loaded = match self.try_load() {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "registry file unreadable, starting empty"
                );
                return LoadedRegistry::default();
            }
        };

        if loaded.migrated > 0 {
            match self.save(&loaded.runs) {
                Ok(()) => {
                    loaded.rewritten = true;
                    tracing::info!(
                        path = %self.path.display(),
                        migrated = loaded.migrated,
                        "migrated legacy registry records to version {CURRENT_VERSION}"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "failed to rewrite migrated registry (will retry on next save)"
                    );
                }
            }
        }

        loaded
    }

    /// Load without the degrade-to-empty policy. A missing file is still an
    /// empty registry.
    pub fn try_load(&self) -> Result<LoadedRegistry, PersistenceError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadedRegistry::default());
            }
            Err(source) => {
                return Err(PersistenceError::Io {
                    action: "read",
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let decoded = parse_document(&bytes)?.decode();
        let mut runs = decoded.runs;
        runs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });

        Ok(LoadedRegistry {
            runs,
            migrated: decoded.migrated,
            skipped: decoded.skipped,
            rewritten: false,
        })
    }

    /// Atomically replace the registry file with `runs`.
    pub fn save<'a>(
        &self,
        runs: impl IntoIterator<Item = &'a SubagentRun>,
    ) -> Result<(), PersistenceError> {
        let document = DocumentRef {
            version: CURRENT_VERSION,
            runs: runs
                .into_iter()
                .map(|run| (run.run_id.as_str(), run))
                .collect::<BTreeMap<_, _>>(),
        };

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|source| PersistenceError::Io {
            action: "create directory",
            path: parent.clone(),
            source,
        })?;

        let mut temp = NamedTempFile::new_in(&parent).map_err(|source| PersistenceError::Io {
            action: "create temp file in",
            path: parent.clone(),
            source,
        })?;
        let write_err = |source: std::io::Error| PersistenceError::Io {
            action: "write",
            path: self.path.clone(),
            source,
        };
        serde_json::to_writer_pretty(&mut temp, &document)?;
        temp.write_all(b"\n").map_err(write_err)?;
        temp.flush().map_err(write_err)?;
        temp.as_file().sync_all().map_err(write_err)?;
        temp.persist(&self.path)
            .map_err(|e| PersistenceError::Io {
                action: "replace",
                path: self.path.clone(),
                source: e.error,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CleanupPolicy;

    fn run(id: &str, created_at: i64) -> SubagentRun {
        SubagentRun::new(id, format!("child:{id}"), "parent", "task", CleanupPolicy::Keep, created_at)
    }

    #[test]
    fn missing_file_is_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let codec = RegistryCodec::new(tmp.path().join("runs.json"));
        let loaded = codec.load();
        assert!(loaded.runs.is_empty());
        assert!(!codec.path().exists());
    }

    #[test]
    fn malformed_file_is_empty_and_untouched() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("runs.json");
        std::fs::write(&path, "{{{ not json").unwrap();
        let codec = RegistryCodec::new(&path);
        assert!(codec.load().runs.is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{{{ not json");
    }

    #[test]
    fn save_writes_version_two_keyed_by_run_id() {
        let tmp = tempfile::TempDir::new().unwrap();
        let codec = RegistryCodec::new(tmp.path().join("nested").join("runs.json"));
        let runs = vec![run("b", 2), run("a", 1)];
        codec.save(&runs).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(codec.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 2);
        assert_eq!(raw["runs"]["a"]["runId"], "a");
        assert_eq!(raw["runs"]["b"]["childSessionKey"], "child:b");

        let loaded = codec.load();
        let ids: Vec<_> = loaded.runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(loaded.migrated, 0);
        assert!(!loaded.rewritten);
    }

    #[test]
    fn save_leaves_no_temp_files_behind() {
        let tmp = tempfile::TempDir::new().unwrap();
        let codec = RegistryCodec::new(tmp.path().join("runs.json"));
        codec.save(&[run("a", 1)]).unwrap();
        codec.save(&[run("a", 1), run("b", 2)]).unwrap();
        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn legacy_file_is_rewritten_on_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("runs.json");
        std::fs::write(
            &path,
            r#"{"version":1,"runs":{"r":{"runId":"r","childSessionKey":"c","requesterSessionKey":"p","createdAt":1,"announceHandled":false}}}"#,
        )
        .unwrap();
        let loaded = RegistryCodec::new(&path).load();
        assert_eq!(loaded.migrated, 1);
        assert!(loaded.rewritten);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 2);
        assert!(raw["runs"]["r"].get("announceHandled").is_none());
        assert_eq!(raw["runs"]["r"]["cleanupHandled"], false);
    }
}
