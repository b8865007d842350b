use crate::layout::ConfigLayout;
use crate::{write_atomic, StoreError};
use riptide_schema::{Fingerprint, ResolvedConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint of the documents the entry was resolved from.
    pub input_fingerprint: String,
    /// Fingerprint of the resolved tree itself.
    pub fingerprint: Fingerprint,
    pub created_at: String,
    pub config: ResolvedConfig,
}

/// Resolved configurations keyed by project name.
///
/// An entry is only returned when its input fingerprint matches, so editing
/// any layer invalidates it.
pub struct ConfigCache {
    dir: PathBuf,
}

impl ConfigCache {
    pub fn new(layout: &ConfigLayout) -> Self {
        Self {
            dir: layout.cache_dir(),
        }
    }

    fn entry_path(&self, project: &str) -> PathBuf {
        self.dir.join(format!("{project}.json"))
    }

    pub fn get(&self, project: &str, input_fingerprint: &str) -> Option<ResolvedConfig> {
        let path = self.entry_path(project);
        let content = fs::read_to_string(&path).ok()?;
        let entry: CacheEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("ignoring unreadable cache entry {}: {e}", path.display());
                return None;
            }
        };
        if entry.input_fingerprint != input_fingerprint {
            debug!("cache miss for '{project}': inputs changed");
            return None;
        }
        debug!("cache hit for '{project}'");
        Some(entry.config)
    }

    pub fn put(
        &self,
        project: &str,
        input_fingerprint: &str,
        config: &ResolvedConfig,
    ) -> Result<(), StoreError> {
        let entry = CacheEntry {
            input_fingerprint: input_fingerprint.to_owned(),
            fingerprint: config.fingerprint()?,
            created_at: chrono::Utc::now().to_rfc3339(),
            config: config.clone(),
        };
        let content = serde_json::to_string_pretty(&entry)?;
        write_atomic(&self.entry_path(project), content.as_bytes())
    }

    pub fn invalidate(&self, project: &str) -> Result<(), StoreError> {
        let path = self.entry_path(project);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
