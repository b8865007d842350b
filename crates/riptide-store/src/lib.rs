//! Persisted, rebuildable state for Riptide.
//!
//! Everything here lives under the user's config directory and can be deleted
//! without losing anything authoritative: the host-port registry for
//! additional ports (`ports.json`), the resolved configuration cache
//! (`cache/`), and the project name registry (`projects.json`). Writes are
//! atomic (temp file, fsync, rename) and cross-process updates take an
//! exclusive file lock.

pub mod cache;
pub mod layout;
pub mod lock;
pub mod ports;
pub mod projects;

pub use cache::{CacheEntry, ConfigCache};
pub use layout::{ConfigLayout, STORE_FORMAT_VERSION};
pub use lock::StoreLock;
pub use ports::{PortBook, PortCheck, PortRegistry, TcpPortCheck};
pub use projects::{validate_project_name, ProjectRecord, ProjectRegistry};

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so a preceding rename inside it is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Replace `dest` with `content` atomically.
pub(crate) fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = dest
        .parent()
        .ok_or_else(|| StoreError::Io(std::io::Error::other("destination has no parent")))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("no free host port at or above {start}")]
    PortsExhausted { start: u16 },
    #[error("invalid project name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
    #[error("project name '{name}' is already registered for {existing}")]
    NameConflict { name: String, existing: String },
    #[error("project '{0}' is not registered")]
    ProjectNotFound(String),
}
