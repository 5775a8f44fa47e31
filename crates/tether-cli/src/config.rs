//! Configuration file management for tether.
//!
//! Provides a TOML-based config file at `~/.config/tether/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use tether_core::RegistryConfig;
use tether_core::config::minutes_to_retention;
use tether_core::hooks::CommandHookRunner;

/// Overrides the session index location.
pub const SESSIONS_INDEX_ENV: &str = "TETHER_SESSIONS_INDEX";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub hooks: HooksSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegistrySection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Retention for settled runs; `0` keeps them forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_after_minutes: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SessionsSection {
    /// JSON index whose top-level keys are live session keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_path: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HooksSection {
    /// argv of the command run for each ended subagent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subagent_ended: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the tether config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/tether` or `~/.config/tether`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("tether");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tether")
}

/// Return the path to the tether config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default session index: `<data dir>/tether/sessions/sessions.json`.
pub fn default_sessions_index() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("tether"))
        .unwrap_or_else(|| PathBuf::from(".tether"))
        .join("sessions")
        .join("sessions.json")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

fn parse_config(path: &Path, contents: &str) -> Result<ConfigFile> {
    toml::from_str(contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Load and parse the config file. A missing file is `Ok(None)`; a file
/// that exists but does not parse is an error.
pub fn load_config_if_present() -> Result<Option<ConfigFile>> {
    let path = config_path();
    match std::fs::read_to_string(&path) {
        Ok(contents) => parse_config(&path, &contents).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => {
            Err(e).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct TetherConfig {
    pub registry: RegistryConfig,
    pub sessions_index: PathBuf,
    pub hook_command: Vec<String>,
    pub hook_timeout: Duration,
}

impl TetherConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Registry path: `cli_registry` > `TETHER_REGISTRY_PATH` / `TETHER_STATE_DIR` env >
    ///   `registry.path` > `RegistryConfig::default_path()`
    /// - Retention: `TETHER_ARCHIVE_AFTER_MINUTES` env > `registry.archive_after_minutes` > none
    /// - Session index: `TETHER_SESSIONS_INDEX` env > `sessions.index_path` > default
    pub fn resolve(cli_registry: Option<&Path>) -> Result<Self> {
        let file_config = load_config_if_present()?.unwrap_or_default();

        let registry_path = if let Some(path) = cli_registry {
            path.to_path_buf()
        } else if let Some(path) = RegistryConfig::path_from_env() {
            path
        } else if let Some(path) = file_config.registry.path.clone() {
            path
        } else {
            RegistryConfig::default_path()
        };

        let archive_after = RegistryConfig::archive_minutes_from_env()
            .or(file_config.registry.archive_after_minutes)
            .and_then(minutes_to_retention);

        let sessions_index = match std::env::var_os(SESSIONS_INDEX_ENV).filter(|v| !v.is_empty()) {
            Some(path) => PathBuf::from(path),
            None => file_config
                .sessions
                .index_path
                .clone()
                .unwrap_or_else(default_sessions_index),
        };

        let hook_timeout = file_config
            .hooks
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(CommandHookRunner::DEFAULT_TIMEOUT);

        Ok(Self {
            registry: RegistryConfig::new(registry_path).with_archive_after(archive_after),
            sessions_index,
            hook_command: file_config.hooks.subagent_ended,
            hook_timeout,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    /// Point config lookup at a scratch directory and clear tether env vars.
    struct ScratchEnv {
        _tmp: tempfile::TempDir,
        orig_xdg: Option<String>,
    }

    impl ScratchEnv {
        fn new() -> Self {
            let tmp = tempfile::TempDir::new().unwrap();
            let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
            unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };
            for key in [
                RegistryConfig::REGISTRY_PATH_ENV,
                RegistryConfig::STATE_DIR_ENV,
                RegistryConfig::ARCHIVE_AFTER_ENV,
                SESSIONS_INDEX_ENV,
            ] {
                unsafe { std::env::remove_var(key) };
            }
            Self {
                _tmp: tmp,
                orig_xdg,
            }
        }

        fn write_config(&self, contents: &str) {
            std::fs::create_dir_all(config_dir()).unwrap();
            std::fs::write(config_path(), contents).unwrap();
        }
    }

    impl Drop for ScratchEnv {
        fn drop(&mut self) {
            match self.orig_xdg.take() {
                Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
                None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
            }
            for key in [
                RegistryConfig::REGISTRY_PATH_ENV,
                RegistryConfig::STATE_DIR_ENV,
                RegistryConfig::ARCHIVE_AFTER_ENV,
                SESSIONS_INDEX_ENV,
            ] {
                unsafe { std::env::remove_var(key) };
            }
        }
    }

    const FULL_CONFIG: &str = r#"
[registry]
path = "/file/runs.json"
archive_after_minutes = 30

[sessions]
index_path = "/file/sessions.json"

[hooks]
subagent_ended = ["notify-send", "done"]
timeout_secs = 5
"#;

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let _env = ScratchEnv::new();

        let original = ConfigFile {
            registry: RegistrySection {
                path: Some(PathBuf::from("/data/runs.json")),
                archive_after_minutes: Some(60),
            },
            sessions: SessionsSection {
                index_path: Some(PathBuf::from("/data/sessions.json")),
            },
            hooks: HooksSection {
                subagent_ended: vec!["true".into()],
                timeout_secs: None,
            },
        };
        save_config(&original).unwrap();

        let loaded = load_config_if_present().unwrap().unwrap();
        assert_eq!(loaded.registry.path, original.registry.path);
        assert_eq!(loaded.registry.archive_after_minutes, Some(60));
        assert_eq!(loaded.sessions.index_path, original.sessions.index_path);
        assert_eq!(loaded.hooks.subagent_ended, vec!["true"]);
        assert_eq!(loaded.hooks.timeout_secs, None);
    }

    #[test]
    fn resolve_uses_config_file() {
        let _lock = lock_env();
        let env = ScratchEnv::new();
        env.write_config(FULL_CONFIG);

        let config = TetherConfig::resolve(None).unwrap();
        assert_eq!(config.registry.registry_path, PathBuf::from("/file/runs.json"));
        assert_eq!(config.registry.archive_after, Some(Duration::from_secs(1_800)));
        assert_eq!(config.sessions_index, PathBuf::from("/file/sessions.json"));
        assert_eq!(config.hook_command, vec!["notify-send", "done"]);
        assert_eq!(config.hook_timeout, Duration::from_secs(5));
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();
        let env = ScratchEnv::new();
        env.write_config(FULL_CONFIG);

        unsafe { std::env::set_var(RegistryConfig::STATE_DIR_ENV, "/env-state") };
        unsafe { std::env::set_var(RegistryConfig::ARCHIVE_AFTER_ENV, "0") };
        unsafe { std::env::set_var(SESSIONS_INDEX_ENV, "/env/sessions.json") };

        let config = TetherConfig::resolve(None).unwrap();
        assert_eq!(
            config.registry.registry_path,
            PathBuf::from("/env-state/subagents/runs.json")
        );
        assert_eq!(config.registry.archive_after, None);
        assert_eq!(config.sessions_index, PathBuf::from("/env/sessions.json"));
    }

    #[test]
    fn resolve_with_cli_flag_overrides_everything() {
        let _lock = lock_env();
        let env = ScratchEnv::new();
        env.write_config(FULL_CONFIG);
        unsafe { std::env::set_var(RegistryConfig::REGISTRY_PATH_ENV, "/env/runs.json") };

        let config = TetherConfig::resolve(Some(Path::new("/cli/runs.json"))).unwrap();
        assert_eq!(config.registry.registry_path, PathBuf::from("/cli/runs.json"));
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();
        let _env = ScratchEnv::new();

        let config = TetherConfig::resolve(None).unwrap();
        assert_eq!(config.registry.registry_path, RegistryConfig::default_path());
        assert_eq!(config.registry.archive_after, None);
        assert_eq!(config.sessions_index, default_sessions_index());
        assert!(config.hook_command.is_empty());
        assert_eq!(config.hook_timeout, CommandHookRunner::DEFAULT_TIMEOUT);
    }

    #[test]
    fn resolve_errors_on_malformed_config() {
        let _lock = lock_env();
        let env = ScratchEnv::new();
        env.write_config("[registry\npath = ");

        let msg = TetherConfig::resolve(None).unwrap_err().to_string();
        assert!(msg.contains("failed to parse config file"), "unexpected error: {msg}");
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("tether/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
