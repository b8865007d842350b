use crate::{write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Incremented when the on-disk format of the files below changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Paths inside the user's Riptide config directory.
///
/// Subdirectories are created on [`initialize`](Self::initialize); nothing
/// else touches the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl ConfigLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// User system configuration layered over the built-in defaults.
    #[inline]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    #[inline]
    pub fn ports_file(&self) -> PathBuf {
        self.root.join("ports.json")
    }

    #[inline]
    pub fn projects_file(&self) -> PathBuf {
        self.root.join("projects.json")
    }

    #[inline]
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Local checkouts of remote repositories, one directory per URL.
    #[inline]
    pub fn repos_dir(&self) -> PathBuf {
        self.root.join("repos")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.cache_dir())?;
        fs::create_dir_all(self.repos_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let content = serde_json::to_string_pretty(&StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            })?;
            write_atomic(&version_path, content.as_bytes())?;
        }
        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.root.join(VERSION_FILE))?;
        let ver: StoreVersion = serde_json::from_str(&content)?;
        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
