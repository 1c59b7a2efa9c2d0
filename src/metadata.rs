use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// `{version, updateLastChecked}` persisted in `binaries/metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMetadata {
    pub version: String,
    pub update_last_checked: DateTime<Utc>,
}

/// Throttling bookkeeping only. Never the source of truth for what is on disk,
/// so read failures surface as `None` and write failures are logged.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MetadataStore { path: path.into() }
    }

    pub fn read(&self) -> Option<LocalMetadata> {
        let body = std::fs::read(&self.path).ok()?;
        match serde_json::from_slice(&body) {
            Ok(meta) => Some(meta),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "ignoring unparsable metadata");
                None
            }
        }
    }

    /// Record `version` as installed, checked now.
    pub fn write(&self, version: &str) {
        self.store(&LocalMetadata {
            version: version.to_string(),
            update_last_checked: Utc::now(),
        });
    }

    /// Bump `updateLastChecked`, keeping the stored version (empty if none).
    pub fn touch_timestamp(&self) {
        let version = self.read().map(|m| m.version).unwrap_or_default();
        self.store(&LocalMetadata {
            version,
            update_last_checked: Utc::now(),
        });
    }

    /// True when the last index check happened less than `ttl` ago.
    pub fn is_fresh(&self, ttl: std::time::Duration) -> bool {
        let Some(meta) = self.read() else {
            return false;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        Utc::now().signed_duration_since(meta.update_last_checked) < ttl
    }

    fn store(&self, meta: &LocalMetadata) {
        if let Err(e) = self.try_store(meta) {
            warn!(path = %self.path.display(), error = %e, "could not write metadata");
        }
    }

    fn try_store(&self, meta: &LocalMetadata) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec(meta)?;
        std::fs::write(&self.path, body)?;
        Ok(())
    }
}
