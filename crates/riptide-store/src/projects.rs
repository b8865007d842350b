use crate::layout::ConfigLayout;
use crate::lock::StoreLock;
use crate::{write_atomic, StoreError};
use riptide_schema::RESERVED_PROJECT_NAMES;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub fn validate_project_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.contains('_') {
        return Err(invalid("must not contain underscores"));
    }
    if RESERVED_PROJECT_NAMES.contains(&name) {
        return Err(invalid("is reserved"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Path of the project's `riptide.toml`.
    pub path: PathBuf,
    pub registered_at: String,
}

/// `projects.json`: project name to project file, so projects can be
/// addressed by name from anywhere.
pub struct ProjectRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ProjectRegistry {
    pub fn new(layout: &ConfigLayout) -> Self {
        Self {
            path: layout.projects_file(),
            lock_path: layout.root().join("projects.lock"),
        }
    }

    pub fn list(&self) -> Result<BTreeMap<String, ProjectRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn get(&self, name: &str) -> Result<Option<ProjectRecord>, StoreError> {
        Ok(self.list()?.remove(name))
    }

    fn save(&self, records: &BTreeMap<String, ProjectRecord>) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(records)?;
        write_atomic(&self.path, content.as_bytes())
    }

    /// Record `name` for `project_file`. Re-registering the same file is a
    /// no-op; the same name for a different file is a conflict.
    pub fn register(&self, name: &str, project_file: &Path) -> Result<(), StoreError> {
        validate_project_name(name)?;
        let _lock = StoreLock::acquire(&self.lock_path)?;
        let mut records = self.list()?;
        if let Some(existing) = records.get(name) {
            if existing.path == project_file {
                return Ok(());
            }
            return Err(StoreError::NameConflict {
                name: name.to_owned(),
                existing: existing.path.display().to_string(),
            });
        }
        records.insert(
            name.to_owned(),
            ProjectRecord {
                path: project_file.to_path_buf(),
                registered_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        self.save(&records)?;
        info!("registered project '{name}' at {}", project_file.display());
        Ok(())
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
        validate_project_name(to)?;
        let _lock = StoreLock::acquire(&self.lock_path)?;
        let mut records = self.list()?;
        if let Some(existing) = records.get(to) {
            return Err(StoreError::NameConflict {
                name: to.to_owned(),
                existing: existing.path.display().to_string(),
            });
        }
        let record = records
            .remove(from)
            .ok_or_else(|| StoreError::ProjectNotFound(from.to_owned()))?;
        records.insert(to.to_owned(), record);
        self.save(&records)
    }

    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let _lock = StoreLock::acquire(&self.lock_path)?;
        let mut records = self.list()?;
        if records.remove(name).is_some() {
            self.save(&records)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &Path) -> ProjectRegistry {
        ProjectRegistry::new(&ConfigLayout::new(dir))
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_project_name("shop").is_ok());
        assert!(validate_project_name("my-shop2").is_ok());
        assert!(validate_project_name("").is_err());
        assert!(validate_project_name("my_shop").is_err());
        assert!(validate_project_name("control").is_err());
    }

    #[test]
    fn register_is_idempotent_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let file = Path::new("/work/shop/riptide.toml");
        reg.register("shop", file).unwrap();
        reg.register("shop", file).unwrap();
        assert_eq!(reg.list().unwrap().len(), 1);
        assert_eq!(reg.get("shop").unwrap().unwrap().path, file);
    }

    #[test]
    fn same_name_elsewhere_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.register("shop", Path::new("/a/riptide.toml")).unwrap();
        assert!(matches!(
            reg.register("shop", Path::new("/b/riptide.toml")),
            Err(StoreError::NameConflict { .. })
        ));
    }

    #[test]
    fn rename_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.register("shop", Path::new("/a/riptide.toml")).unwrap();
        reg.register("blog", Path::new("/b/riptide.toml")).unwrap();

        assert!(matches!(
            reg.rename("shop", "blog"),
            Err(StoreError::NameConflict { .. })
        ));
        assert!(matches!(
            reg.rename("ghost", "new"),
            Err(StoreError::ProjectNotFound(_))
        ));
        reg.rename("shop", "store").unwrap();
        assert!(reg.get("shop").unwrap().is_none());
        assert!(reg.get("store").unwrap().is_some());

        reg.remove("store").unwrap();
        reg.remove("store").unwrap();
        assert_eq!(reg.list().unwrap().len(), 1);
    }
}
