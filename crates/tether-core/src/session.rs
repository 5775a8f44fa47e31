//! Existence checks against the external session store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

/// The only question the registry ever asks the session store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn exists(&self, session_key: &str) -> Result<bool>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn SessionStore) {}
};

/// Session store backed by a JSON index file whose top-level object keys
/// are session keys.
///
/// A missing index means no sessions exist. The file is re-read on every
/// check so external maintenance (pruning, eviction) is seen immediately.
#[derive(Debug, Clone)]
pub struct FsSessionStore {
    index_path: PathBuf,
}

impl FsSessionStore {
    pub fn new(index_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }
}

#[async_trait]
impl SessionStore for FsSessionStore {
    async fn exists(&self, session_key: &str) -> Result<bool> {
        let bytes = match tokio::fs::read(&self.index_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read session index {}", self.index_path.display())
                });
            }
        };
        let index: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&bytes)
            .with_context(|| {
                format!("failed to parse session index {}", self.index_path.display())
            })?;
        Ok(index.contains_key(session_key))
    }
}
