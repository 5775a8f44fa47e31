use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Registry configuration.
///
/// Reads `TETHER_REGISTRY_PATH`, then `TETHER_STATE_DIR`, falling back to the
/// platform data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Path of the persisted registry file.
    pub registry_path: PathBuf,
    /// Retention for settled `keep` runs. `None` keeps them indefinitely.
    pub archive_after: Option<Duration>,
}

impl RegistryConfig {
    pub const REGISTRY_PATH_ENV: &str = "TETHER_REGISTRY_PATH";
    pub const STATE_DIR_ENV: &str = "TETHER_STATE_DIR";
    pub const ARCHIVE_AFTER_ENV: &str = "TETHER_ARCHIVE_AFTER_MINUTES";

    /// Registry file location relative to a state directory.
    pub const RELATIVE_PATH: &str = "subagents/runs.json";

    /// Build a config from the environment.
    ///
    /// Priority: `TETHER_REGISTRY_PATH`, then `$TETHER_STATE_DIR/subagents/runs.json`,
    /// then `<data dir>/tether/subagents/runs.json`.
    pub fn from_env() -> Self {
        let registry_path = Self::path_from_env().unwrap_or_else(Self::default_path);
        let archive_after = Self::archive_minutes_from_env().and_then(minutes_to_retention);
        Self {
            registry_path,
            archive_after,
        }
    }

    /// The registry path named by the environment, if any.
    pub fn path_from_env() -> Option<PathBuf> {
        env::var_os(Self::REGISTRY_PATH_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                env::var_os(Self::STATE_DIR_ENV)
                    .filter(|v| !v.is_empty())
                    .map(|dir| Self::path_in(Path::new(&dir)))
            })
    }

    /// `TETHER_ARCHIVE_AFTER_MINUTES`, when set to a valid number.
    pub fn archive_minutes_from_env() -> Option<u64> {
        env::var(Self::ARCHIVE_AFTER_ENV)
            .ok()
            .and_then(|v| parse_minutes(&v))
    }

    /// Build a config from an explicit path (useful for tests and CLI flags).
    pub fn new(registry_path: impl Into<PathBuf>) -> Self {
        Self {
            registry_path: registry_path.into(),
            archive_after: None,
        }
    }

    pub fn with_archive_after(mut self, archive_after: Option<Duration>) -> Self {
        self.archive_after = archive_after;
        self
    }

    /// `<state_dir>/subagents/runs.json`.
    pub fn path_in(state_dir: &Path) -> PathBuf {
        state_dir.join(Self::RELATIVE_PATH)
    }

    /// `<data dir>/tether/subagents/runs.json`, or a relative
    /// `.tether/subagents/runs.json` when the platform has no data dir.
    pub fn default_path() -> PathBuf {
        let base = dirs::data_dir()
            .map(|d| d.join("tether"))
            .unwrap_or_else(|| PathBuf::from(".tether"));
        Self::path_in(&base)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Minutes to a retention duration. `0` disables retention.
pub fn minutes_to_retention(minutes: u64) -> Option<Duration> {
    (minutes > 0).then(|| Duration::from_secs(minutes.saturating_mul(60)))
}

fn parse_minutes(raw: &str) -> Option<u64> {
    match raw.trim().parse::<u64>() {
        Ok(minutes) => Some(minutes),
        Err(_) => {
            tracing::warn!(
                value = %raw,
                "ignoring invalid {}",
                RegistryConfig::ARCHIVE_AFTER_ENV
            );
            None
        }
    }
}
