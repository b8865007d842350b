//! The validated, fully substituted configuration tree.
//!
//! Nothing here changes after resolution. Maps are ordered so the tree
//! serializes identically for identical inputs.

use crate::types::{CommandName, Fingerprint, ProjectName, ServiceName};
use crate::variables::Scope;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Where the project source is mounted inside containers.
pub const CONTAINER_SRC_PATH: &str = "/src";
/// Home directory of the in-container user.
pub const CONTAINER_HOME_PATH: &str = "/home/riptide";
/// Hostname under which containers reach the host machine.
pub const HOST_ADDRESS: &str = "host.riptide.internal";
/// Per-project state directory, relative to the project root.
pub const STATE_DIR: &str = "_riptide";
/// Suffix of the note written next to config files rendered into the source tree.
pub const CONFIG_NOTICE_SUFFIX: &str = ".riptide_info.txt";
/// Project names that would collide with internal proxy routes.
pub const RESERVED_PROJECT_NAMES: &[&str] = &["control"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub system: SystemConfig,
    pub project: Project,
}

impl ResolvedConfig {
    /// Stable JSON form; identical inputs produce identical bytes.
    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn fingerprint(&self) -> Result<Fingerprint, serde_json::Error> {
        let json = self.canonical_json()?;
        Ok(Fingerprint::new(blake3::hash(json.as_bytes()).to_hex().to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub engine: String,
    pub repos: Vec<String>,
    pub update_hosts_file: bool,
    pub proxy: ProxyConfig,
    pub performance: PerformanceFlags,
    pub timeouts: Timeouts,
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    pub http_port: u16,
    pub https_port: Option<u16>,
    pub autostart: bool,
    pub autostart_restrict: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerfFlag {
    Enabled,
    Disabled,
    Auto,
}

impl PerfFlag {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "auto" => Some(Self::Auto),
            "true" => Some(Self::Enabled),
            "false" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl From<bool> for PerfFlag {
    fn from(b: bool) -> Self {
        if b {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceFlags {
    pub dont_sync_named_volumes_with_host: PerfFlag,
    pub dont_sync_unimportant_src: PerfFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    pub start: Duration,
    pub stop: Duration,
    pub readiness: Duration,
    pub hook: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: ProjectName,
    /// Directory containing the project file.
    pub root: PathBuf,
    /// Absolute source directory mounted at [`CONTAINER_SRC_PATH`].
    pub src: PathBuf,
    pub links: Vec<ProjectName>,
    pub default_services: Vec<ServiceName>,
    pub variables: BTreeMap<String, String>,
    pub app: App,
}

impl Project {
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    /// Host file receiving a service log stream or logging command output.
    pub fn log_file(&self, service: &str, name: &str) -> PathBuf {
        self.state_dir()
            .join("logs")
            .join(service)
            .join(format!("{name}.log"))
    }

    /// Host file a service config entry is rendered to. Entries targeting
    /// the source mount of a `src` service are written into the source tree
    /// and reach the container through that mount.
    pub fn config_file(&self, service: &Service, name: &str) -> Option<PathBuf> {
        let file = service.config.get(name)?;
        Some(match service.config_in_src(file) {
            Some(rel) => self.src.join(rel),
            None => {
                let sanitized: String = name
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                    .collect();
                self.state_dir()
                    .join("processed_config")
                    .join(service.name.as_str())
                    .join(sanitized)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub services: BTreeMap<ServiceName, Service>,
    pub commands: BTreeMap<CommandName, Command>,
    /// Source-relative directories that need not be synced with the host.
    pub unimportant_paths: Vec<String>,
    pub variables: BTreeMap<String, String>,
}

impl App {
    pub fn service_by_role<'a>(
        &'a self,
        role: &'a Role,
    ) -> Option<(&'a ServiceName, &'a Service)> {
        self.services_by_role(role).next()
    }

    pub fn services_by_role<'a>(
        &'a self,
        role: &'a Role,
    ) -> impl Iterator<Item = (&'a ServiceName, &'a Service)> + 'a {
        self.services.iter().filter(move |(_, s)| s.has_role(role))
    }

    /// Follow aliases until a non-alias command is reached.
    pub fn resolve_command(&self, name: &str) -> Result<(&CommandName, &Command), SchemaError> {
        let mut chain: Vec<String> = Vec::new();
        let mut current = name;
        loop {
            let Some((key, command)) = self.commands.get_key_value(current) else {
                return Err(SchemaError::UnknownCommand(current.to_owned()));
            };
            chain.push(current.to_owned());
            match &command.kind {
                CommandKind::Alias { target } => {
                    if chain.iter().any(|seen| seen == target.as_str()) {
                        chain.push(target.to_string());
                        return Err(SchemaError::AliasCycle { chain });
                    }
                    current = target.as_str();
                }
                _ => return Ok((key, command)),
            }
        }
    }

    /// Reject any alias chain that revisits a name.
    pub fn check_aliases(&self) -> Result<(), SchemaError> {
        for (name, command) in &self.commands {
            if matches!(command.kind, CommandKind::Alias { .. }) {
                self.resolve_command(name)?;
            }
        }
        Ok(())
    }

    /// `selected` plus everything it transitively depends on.
    pub fn dependency_closure(&self, selected: &[ServiceName]) -> BTreeSet<ServiceName> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<&ServiceName> = selected.iter().collect();
        while let Some(name) = stack.pop() {
            let Some((key, service)) = self.services.get_key_value(name.as_str()) else {
                continue;
            };
            if out.insert(key.clone()) {
                stack.extend(service.depends_on.iter());
            }
        }
        out
    }

    /// Group services into layers; every service comes after all of its
    /// dependencies. Services inside one layer are independent.
    pub fn start_order(&self, services: &BTreeSet<ServiceName>) -> Vec<Vec<ServiceName>> {
        let mut placed: BTreeSet<&ServiceName> = BTreeSet::new();
        let mut layers = Vec::new();
        loop {
            let layer: Vec<ServiceName> = services
                .iter()
                .filter(|name| !placed.contains(name))
                .filter(|name| {
                    self.services.get(name.as_str()).map_or(true, |s| {
                        s.depends_on
                            .iter()
                            .all(|d| placed.contains(d) || !services.contains(d))
                    })
                })
                .cloned()
                .collect();
            if layer.is_empty() {
                break;
            }
            for name in &layer {
                if let Some(key) = services.get(name) {
                    placed.insert(key);
                }
            }
            layers.push(layer);
        }
        layers
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Main,
    Src,
    Db,
    Custom(String),
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        match s.as_str() {
            "main" => Self::Main,
            "src" => Self::Src,
            "db" => Self::Db,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        Self::from(s.to_owned())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => f.write_str("main"),
            Self::Src => f.write_str("src"),
            Self::Db => f.write_str("db"),
            Self::Custom(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceCommand {
    Single(String),
    Groups(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeMode {
    Rw,
    Ro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Absolute host path.
    pub host: PathBuf,
    pub container: String,
    pub mode: VolumeMode,
    pub kind: VolumeKind,
    /// Backed by a named engine volume instead of a host bind when the
    /// matching performance flag resolves to true.
    pub volume_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalPort {
    pub title: String,
    pub container: u16,
    /// Fixed host port; when absent one is picked from the port registry.
    pub host: Option<u16>,
    /// First host port tried when picking one.
    pub host_start: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logging {
    pub stdout: bool,
    pub stderr: bool,
    /// Log name to in-container file path.
    pub paths: BTreeMap<String, String>,
    /// Log name to command whose output is captured.
    pub commands: BTreeMap<String, String>,
}

impl Logging {
    pub fn is_empty(&self) -> bool {
        !self.stdout && !self.stderr && self.paths.is_empty() && self.commands.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    pub config: toml::Table,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: ServiceName,
    pub roles: Vec<Role>,
    pub image: String,
    pub command: Option<ServiceCommand>,
    pub port: Option<u16>,
    pub additional_ports: Vec<AdditionalPort>,
    pub volumes: Vec<Volume>,
    pub environment: BTreeMap<String, String>,
    pub working_directory: Option<String>,
    pub run_as_root: bool,
    pub dont_create_user: bool,
    pub pre_start: Vec<String>,
    pub post_start: Vec<String>,
    pub logging: Logging,
    pub additional_subdomains: Vec<String>,
    pub optional: bool,
    pub depends_on: Vec<ServiceName>,
    pub ready_label: Option<String>,
    pub allow_full_memlock: bool,
    pub driver: Option<DriverConfig>,
    /// Template files rendered on every start, by entry name.
    pub config: BTreeMap<String, ConfigFile>,
    /// Every variable visible to the service, used to render config files.
    pub variables: BTreeMap<String, String>,
    /// Proxy hostname, e.g. `shop.riptide.local` or `shop--db.riptide.local`.
    pub domain: String,
    /// Host directory for service data: `<root>/_riptide/data/<service>`.
    pub volume_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Template on the host.
    pub source: PathBuf,
    /// Absolute container path.
    pub target: String,
}

impl Service {
    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }

    /// Source-relative path of a config entry that lives in the source tree.
    pub fn config_in_src<'a>(&self, file: &'a ConfigFile) -> Option<&'a str> {
        if !self.has_role(&Role::Src) {
            return None;
        }
        file.target
            .strip_prefix(CONTAINER_SRC_PATH)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rel| !rel.is_empty())
    }

    /// Read a config template and substitute the service's variables in it.
    pub fn render_config(&self, file: &ConfigFile) -> io::Result<String> {
        let template = fs::read_to_string(&file.source)?;
        let mut scope = Scope::root();
        for (name, value) in &self.variables {
            scope.define(name.as_str(), value.as_str());
        }
        scope.substitute(&template).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: {e}", file.source.display()),
            )
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn additional_domains(&self) -> Vec<String> {
        self.additional_subdomains
            .iter()
            .map(|sub| format!("{sub}.{}", self.domain))
            .collect()
    }

    /// Working directory inside the container. Relative paths are anchored at
    /// the source mount, which only `src` services have.
    pub fn container_working_directory(&self) -> Option<String> {
        match &self.working_directory {
            Some(wd) if wd.starts_with('/') => Some(wd.clone()),
            Some(wd) if self.has_role(&Role::Src) => {
                let rel = wd.trim_start_matches("./");
                if rel.is_empty() || rel == "." {
                    Some(CONTAINER_SRC_PATH.to_owned())
                } else {
                    Some(format!("{CONTAINER_SRC_PATH}/{rel}"))
                }
            }
            None if self.has_role(&Role::Src) => Some(CONTAINER_SRC_PATH.to_owned()),
            _ => None,
        }
    }

    /// Command for the given group, falling back to `default`.
    pub fn command_for(&self, group: Option<&str>) -> Option<&str> {
        match &self.command {
            None => None,
            Some(ServiceCommand::Single(cmd)) => Some(cmd),
            Some(ServiceCommand::Groups(groups)) => group
                .and_then(|g| groups.get(g))
                .or_else(|| groups.get("default"))
                .map(String::as_str),
        }
    }
}

/// Build the proxy hostname for a service.
pub fn service_domain(project: &str, service: &str, is_main: bool, proxy_url: &str) -> String {
    if is_main {
        format!("{project}.{proxy_url}")
    } else {
        format!("{project}--{service}.{proxy_url}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: CommandName,
    pub kind: CommandKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    /// One-shot container from its own image.
    Image {
        image: String,
        command: Option<String>,
        volumes: Vec<Volume>,
        environment: BTreeMap<String, String>,
        working_directory: Option<String>,
        use_host_network: bool,
    },
    /// Executed inside the running service carrying `role`.
    InService {
        role: Role,
        command: String,
        environment: BTreeMap<String, String>,
    },
    Alias { target: CommandName },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, roles: &[&str], depends_on: &[&str]) -> Service {
        Service {
            name: ServiceName::new(name),
            roles: roles.iter().map(|r| Role::from(*r)).collect(),
            image: "img".to_owned(),
            command: None,
            port: None,
            additional_ports: Vec::new(),
            volumes: Vec::new(),
            environment: BTreeMap::new(),
            working_directory: None,
            run_as_root: false,
            dont_create_user: false,
            pre_start: Vec::new(),
            post_start: Vec::new(),
            logging: Logging::default(),
            additional_subdomains: Vec::new(),
            optional: false,
            depends_on: depends_on.iter().map(|d| ServiceName::new(*d)).collect(),
            ready_label: None,
            allow_full_memlock: false,
            driver: None,
            config: BTreeMap::new(),
            variables: BTreeMap::new(),
            domain: format!("p--{name}.riptide.local"),
            volume_path: PathBuf::from("/p/_riptide/data").join(name),
        }
    }

    fn alias(name: &str, target: &str) -> (CommandName, Command) {
        (
            CommandName::new(name),
            Command {
                name: CommandName::new(name),
                kind: CommandKind::Alias {
                    target: CommandName::new(target),
                },
            },
        )
    }

    fn app(services: Vec<Service>, commands: Vec<(CommandName, Command)>) -> App {
        App {
            name: "app".to_owned(),
            services: services.into_iter().map(|s| (s.name.clone(), s)).collect(),
            commands: commands.into_iter().collect(),
            unimportant_paths: Vec::new(),
            variables: BTreeMap::new(),
        }
    }

    #[test]
    fn role_lookups_follow_service_order() {
        let app = app(
            vec![
                service("db", &["db"], &[]),
                service("api", &["src", "worker"], &[]),
                service("www", &["main", "src"], &[]),
            ],
            Vec::new(),
        );
        let worker = Role::from("worker");
        let (name, _) = app.service_by_role(&worker).unwrap();
        assert_eq!(name.as_str(), "api");
        assert_eq!(app.service_by_role(&Role::Main).unwrap().0.as_str(), "www");
        let src: Vec<&str> = app
            .services_by_role(&Role::Src)
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(src, vec!["api", "www"]);
        assert!(app.service_by_role(&Role::from("cron")).is_none());
    }

    #[test]
    fn config_templates_render_with_service_variables() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("app.ini");
        fs::write(&source, "host=${domain}\nname=$name\nprice=$$5\n").unwrap();
        let mut www = service("www", &["src"], &[]);
        www.variables = BTreeMap::from([
            ("domain".to_owned(), "shop.riptide.local".to_owned()),
            ("name".to_owned(), "www".to_owned()),
        ]);
        let file = ConfigFile {
            source: source.clone(),
            target: "/src/config/app.ini".to_owned(),
        };
        assert_eq!(
            www.render_config(&file).unwrap(),
            "host=shop.riptide.local\nname=www\nprice=$5\n"
        );
        assert_eq!(www.config_in_src(&file), Some("config/app.ini"));

        let outside = ConfigFile {
            source,
            target: "/etc/app.ini".to_owned(),
        };
        assert_eq!(www.config_in_src(&outside), None);
        let worker = service("worker", &[], &[]);
        assert_eq!(worker.config_in_src(&file), None);

        fs::write(dir.path().join("bad.ini"), "x=$missing\n").unwrap();
        let bad = ConfigFile {
            source: dir.path().join("bad.ini"),
            target: "/etc/bad.ini".to_owned(),
        };
        let err = www.render_config(&bad).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn roles_roundtrip_through_strings() {
        let roles: Vec<Role> = serde_json::from_str(r#"["main","src","db","worker"]"#).unwrap();
        assert_eq!(
            roles,
            vec![Role::Main, Role::Src, Role::Db, Role::Custom("worker".to_owned())]
        );
        assert_eq!(
            serde_json::to_string(&roles).unwrap(),
            r#"["main","src","db","worker"]"#
        );
    }

    #[test]
    fn alias_resolves_to_target() {
        let php = Command {
            name: CommandName::new("php"),
            kind: CommandKind::Image {
                image: "php:8.3".to_owned(),
                command: Some("php".to_owned()),
                volumes: Vec::new(),
                environment: BTreeMap::new(),
                working_directory: None,
                use_host_network: false,
            },
        };
        let app = app(
            Vec::new(),
            vec![(CommandName::new("php"), php), alias("p", "php"), alias("pp", "p")],
        );
        let (name, _) = app.resolve_command("pp").unwrap();
        assert_eq!(name, "php");
        assert!(app.check_aliases().is_ok());
    }

    #[test]
    fn alias_cycle_is_reported_with_chain() {
        let app = app(Vec::new(), vec![alias("a", "b"), alias("b", "a")]);
        match app.resolve_command("a") {
            Err(SchemaError::AliasCycle { chain }) => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("expected alias cycle, got {other:?}"),
        }
        assert!(app.check_aliases().is_err());
    }

    #[test]
    fn unknown_command_lookup() {
        let app = app(Vec::new(), Vec::new());
        assert!(matches!(
            app.resolve_command("nope"),
            Err(SchemaError::UnknownCommand(_))
        ));
    }

    #[test]
    fn working_directory_rules() {
        let mut src = service("www", &["main", "src"], &[]);
        assert_eq!(src.container_working_directory().as_deref(), Some("/src"));
        src.working_directory = Some("public".to_owned());
        assert_eq!(src.container_working_directory().as_deref(), Some("/src/public"));
        src.working_directory = Some("/var/www".to_owned());
        assert_eq!(src.container_working_directory().as_deref(), Some("/var/www"));

        let db = service("db", &["db"], &[]);
        assert_eq!(db.container_working_directory(), None);
    }

    #[test]
    fn command_groups_fall_back_to_default() {
        let mut s = service("www", &["main"], &[]);
        s.command = Some(ServiceCommand::Groups(
            [("default", "run"), ("debug", "run --debug")]
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        ));
        assert_eq!(s.command_for(Some("debug")), Some("run --debug"));
        assert_eq!(s.command_for(Some("other")), Some("run"));
        assert_eq!(s.command_for(None), Some("run"));
    }

    #[test]
    fn domains() {
        assert_eq!(service_domain("shop", "www", true, "riptide.local"), "shop.riptide.local");
        assert_eq!(
            service_domain("shop", "db", false, "riptide.local"),
            "shop--db.riptide.local"
        );
        let mut s = service("www", &["main"], &[]);
        s.additional_subdomains = vec!["api".to_owned()];
        assert_eq!(s.additional_domains(), vec!["api.p--www.riptide.local".to_owned()]);
    }

    #[test]
    fn start_order_layers_dependencies_first() {
        let app = app(
            vec![
                service("www", &["main"], &["php"]),
                service("php", &[], &["db", "redis"]),
                service("db", &["db"], &[]),
                service("redis", &[], &[]),
                service("mail", &[], &[]),
            ],
            Vec::new(),
        );
        let selected = app.dependency_closure(&[ServiceName::new("www")]);
        assert_eq!(selected.len(), 4);
        let layers = app.start_order(&selected);
        assert_eq!(
            layers,
            vec![
                vec![ServiceName::new("db"), ServiceName::new("redis")],
                vec![ServiceName::new("php")],
                vec![ServiceName::new("www")],
            ]
        );
    }
}
