//! Finding project files and turning them into a [`ResolvedConfig`].

use crate::CoreError;
use riptide_schema::{
    parse_document, resolve, HostContext, Layer, ProjectDoc, ResolveInput, ResolvedConfig,
};
use riptide_store::{ConfigCache, ConfigLayout, ProjectRegistry, StoreError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const PROJECT_FILE: &str = "riptide.toml";
pub const LOCAL_OVERRIDE_FILE: &str = "riptide.local.toml";

/// Safe wrapper around libc::getuid().
#[cfg(unix)]
#[allow(unsafe_code)]
fn current_uid() -> u32 {
    // SAFETY: getuid() takes no arguments and cannot fail.
    unsafe { libc::getuid() }
}

/// Safe wrapper around libc::getgid().
#[cfg(unix)]
#[allow(unsafe_code)]
fn current_gid() -> u32 {
    // SAFETY: getgid() takes no arguments and cannot fail.
    unsafe { libc::getgid() }
}

/// Numeric uid and gid of the invoking user; containers create a matching
/// user so files written to mounts keep host ownership.
#[cfg(unix)]
pub fn host_context() -> HostContext {
    HostContext {
        os_user: current_uid().to_string(),
        os_group: current_gid().to_string(),
    }
}

#[cfg(not(unix))]
pub fn host_context() -> HostContext {
    HostContext {
        os_user: "1000".to_owned(),
        os_group: "1000".to_owned(),
    }
}

/// Walk up from `start` to the nearest directory holding a project file.
pub fn find_project_file(start: &Path) -> Result<PathBuf, CoreError> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_FILE))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| CoreError::ProjectNotFound(start.to_path_buf()))
}

#[derive(Debug, Clone)]
pub struct Loaded {
    pub config: ResolvedConfig,
    pub project_file: PathBuf,
    pub from_cache: bool,
}

/// Reads the layered documents of a project and resolves them, going
/// through the config cache unless disabled.
pub struct ProjectLoader {
    layout: ConfigLayout,
    host: HostContext,
    use_cache: bool,
}

impl ProjectLoader {
    pub fn new(layout: ConfigLayout) -> Self {
        Self {
            layout,
            host: host_context(),
            use_cache: true,
        }
    }

    #[must_use]
    pub fn with_host(mut self, host: HostContext) -> Self {
        self.host = host;
        self
    }

    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn layout(&self) -> &ConfigLayout {
        &self.layout
    }

    /// Collect every layer that feeds resolution of `project_file`.
    pub fn input_for(&self, project_file: &Path) -> Result<ResolveInput, CoreError> {
        let root = project_file
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let mut system_layers = Vec::new();
        let config_file = self.layout.config_file();
        if config_file.is_file() {
            system_layers.push(read_layer(&config_file)?);
        }

        let mut project_layers = vec![read_layer(project_file)?];
        let local = root.join(LOCAL_OVERRIDE_FILE);
        if local.is_file() {
            debug!("applying local override {}", local.display());
            project_layers.push(read_layer(&local)?);
        }

        Ok(ResolveInput {
            system_layers,
            project_layers,
            project_root: root,
            config_dir: self.layout.root().to_path_buf(),
            host: self.host.clone(),
        })
    }

    pub fn load(&self, project_file: &Path) -> Result<Loaded, CoreError> {
        self.layout.initialize()?;
        let input = self.input_for(project_file)?;
        let cache = ConfigCache::new(&self.layout);

        let fingerprint = input.fingerprint();
        let cached_name = declared_name(&input.project_layers).filter(|_| self.use_cache);
        if let Some(name) = &cached_name {
            if let Some(config) = cache.get(name, &fingerprint) {
                return Ok(Loaded {
                    config,
                    project_file: project_file.to_path_buf(),
                    from_cache: true,
                });
            }
        }

        let config = resolve(&input)?;
        info!(
            "resolved project '{}' from {}",
            config.project.name,
            project_file.display()
        );
        if self.use_cache {
            if let Err(e) = cache.put(&config.project.name, &fingerprint, &config) {
                warn!("could not cache resolved configuration: {e}");
            }
        }
        self.remember(&config.project.name, project_file);

        Ok(Loaded {
            config,
            project_file: project_file.to_path_buf(),
            from_cache: false,
        })
    }

    /// Find the project file above `start` and load it.
    pub fn discover(&self, start: &Path) -> Result<Loaded, CoreError> {
        self.load(&find_project_file(start)?)
    }

    /// Load a project previously seen under `name`.
    pub fn load_by_name(&self, name: &str) -> Result<Loaded, CoreError> {
        let record = ProjectRegistry::new(&self.layout)
            .get(name)?
            .ok_or_else(|| StoreError::ProjectNotFound(name.to_owned()))?;
        self.load(&record.path)
    }

    fn remember(&self, name: &str, project_file: &Path) {
        match ProjectRegistry::new(&self.layout).register(name, project_file) {
            Ok(()) => {}
            Err(StoreError::NameConflict { existing, .. }) => {
                warn!("project name '{name}' is also used by {existing}");
            }
            Err(e) => warn!("could not record project '{name}': {e}"),
        }
    }
}

/// Project name as declared by the topmost layer that sets one. Layers
/// that fail to parse are skipped; resolution reports them.
fn declared_name(layers: &[Layer]) -> Option<String> {
    layers
        .iter()
        .filter_map(|layer| parse_document::<ProjectDoc>(&layer.text).ok()?.name)
        .last()
}

fn read_layer(path: &Path) -> Result<Layer, CoreError> {
    let text = fs::read_to_string(path)?;
    Ok(Layer::new(path.display().to_string(), text))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = r#"
name = "shop"
src = "."

[app]
name = "shop"

[app.services.www]
image = "nginx"
port = 80
roles = ["main", "src"]
"#;

    fn host() -> HostContext {
        HostContext {
            os_user: "1000".to_owned(),
            os_group: "1000".to_owned(),
        }
    }

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, PathBuf) {
        let config = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let file = project.path().join(PROJECT_FILE);
        fs::write(&file, PROJECT).unwrap();
        (config, project, file)
    }

    #[test]
    fn finds_project_file_in_parent() {
        let (_config, project, file) = setup();
        let nested = project.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_project_file(&nested).unwrap(), file);
    }

    #[test]
    fn missing_project_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            find_project_file(dir.path()),
            Err(CoreError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn second_load_hits_cache_until_a_layer_changes() {
        let (config, project, file) = setup();
        let loader = ProjectLoader::new(ConfigLayout::new(config.path())).with_host(host());

        let first = loader.load(&file).unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.config.project.name, "shop");

        let second = loader.load(&file).unwrap();
        assert!(second.from_cache);
        assert_eq!(second.config, first.config);

        fs::write(
            project.path().join(LOCAL_OVERRIDE_FILE),
            "[app.services.www]\nport = 8080\n",
        )
        .unwrap();
        let third = loader.load(&file).unwrap();
        assert!(!third.from_cache);
        assert_eq!(third.config.project.app.services["www"].port, Some(8080));
    }

    #[test]
    fn system_config_is_layered_in() {
        let (config, _project, file) = setup();
        let layout = ConfigLayout::new(config.path());
        layout.initialize().unwrap();
        fs::write(layout.config_file(), "[proxy]\nurl = \"dev.test\"\n").unwrap();
        let loaded = ProjectLoader::new(layout)
            .with_host(host())
            .without_cache()
            .load(&file)
            .unwrap();
        assert_eq!(loaded.config.system.proxy.url, "dev.test");
        assert_eq!(
            loaded.config.project.app.services["www"].domain,
            "shop.dev.test"
        );
    }

    #[test]
    fn loaded_projects_can_be_found_by_name() {
        let (config, _project, file) = setup();
        let loader = ProjectLoader::new(ConfigLayout::new(config.path())).with_host(host());
        loader.load(&file).unwrap();
        let again = loader.load_by_name("shop").unwrap();
        assert_eq!(again.project_file, file);
        assert!(matches!(
            loader.load_by_name("blog"),
            Err(CoreError::Store(StoreError::ProjectNotFound(_)))
        ));
    }

    #[test]
    fn host_context_is_numeric() {
        let host = host_context();
        assert!(host.os_user.parse::<u32>().is_ok());
        assert!(host.os_group.parse::<u32>().is_ok());
    }
}
