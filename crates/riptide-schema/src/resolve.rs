//! Layered resolution: parse every layer, merge, expand repository
//! references, validate and substitute into a [`ResolvedConfig`].

use crate::document::{
    default_system_doc, parse_document, AdditionalPortDoc, AppDoc, CommandDoc, ConfigFileDoc,
    FlagDoc, HttpsPortDoc, ProjectDoc, ServiceCommandDoc, ServiceDoc, SystemDoc, VolumeDoc,
};
use crate::merge::Merge;
use crate::report::{IssueKind, ValidationReport};
use crate::repository::{expand, expand_traced, Repositories};
use crate::resolved::{
    service_domain, AdditionalPort, App, Command, CommandKind, ConfigFile, DriverConfig, Logging,
    PerfFlag, PerformanceFlags, Project, ProxyConfig, ResolvedConfig, Role, Service,
    ServiceCommand, SystemConfig, Timeouts, Volume, VolumeKind, VolumeMode, CONTAINER_HOME_PATH,
    CONTAINER_SRC_PATH, HOST_ADDRESS, RESERVED_PROJECT_NAMES, STATE_DIR,
};
use crate::types::{CommandName, ProjectName, ServiceName};
use crate::variables::Scope;
use crate::SchemaError;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// One configuration document and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub origin: String,
    pub text: String,
}

impl Layer {
    pub fn new(origin: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            text: text.into(),
        }
    }
}

/// Identity of the invoking user, surfaced as `$os_user` / `$os_group`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostContext {
    pub os_user: String,
    pub os_group: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveInput {
    /// System layers applied over the built-in defaults, lowest first.
    pub system_layers: Vec<Layer>,
    /// Project file first, local override after it.
    pub project_layers: Vec<Layer>,
    pub project_root: PathBuf,
    pub config_dir: PathBuf,
    pub host: HostContext,
}

impl ResolveInput {
    /// Blake3 over every input that influences resolution.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for layer in self.system_layers.iter().chain(&self.project_layers) {
            hasher.update(format!("layer:{}:{}\n", layer.origin, layer.text.len()).as_bytes());
            hasher.update(layer.text.as_bytes());
        }
        hasher.update(format!("root:{}\n", self.project_root.display()).as_bytes());
        hasher.update(format!("config:{}\n", self.config_dir.display()).as_bytes());
        hasher.update(format!("host:{}:{}\n", self.host.os_user, self.host.os_group).as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Resolve all layers into a validated configuration.
///
/// Every parse and validation problem is collected into one report; nothing
/// is returned unless the whole tree is valid. Alias cycles are checked last
/// and reported separately.
pub fn resolve(input: &ResolveInput) -> Result<ResolvedConfig, SchemaError> {
    let mut report = ValidationReport::new();

    let system_docs: Vec<SystemDoc> = parse_layers(&input.system_layers, &mut report);
    let project_docs: Vec<ProjectDoc> = parse_layers(&input.project_layers, &mut report);
    if input.project_layers.is_empty() {
        report.push("project", IssueKind::Missing, "no project document given");
    }
    if !report.is_empty() {
        return Err(SchemaError::Validation(report));
    }

    let system_doc = system_docs
        .into_iter()
        .fold(default_system_doc(), Merge::merge);
    let project_doc = project_docs
        .into_iter()
        .fold(ProjectDoc::default(), Merge::merge);

    let mut resolver = Resolver {
        input,
        report: &mut report,
    };

    let mut system_scope = Scope::root();
    let system = resolver.system(system_doc, &mut system_scope);
    let repos = Repositories::from_entries(&input.config_dir, &system.repos);
    let project = resolver.project(project_doc, &system, &system_scope, &repos);

    if !report.is_empty() {
        return Err(SchemaError::Validation(report));
    }
    let Some(project) = project else {
        return Err(SchemaError::Validation(report));
    };

    project.app.check_aliases()?;
    debug!(
        "resolved project '{}' with {} service(s)",
        project.name,
        project.app.services.len()
    );
    Ok(ResolvedConfig { system, project })
}

fn parse_layers<T: DeserializeOwned>(layers: &[Layer], report: &mut ValidationReport) -> Vec<T> {
    let mut docs = Vec::with_capacity(layers.len());
    for layer in layers {
        match parse_document::<T>(&layer.text) {
            Ok(doc) => docs.push(doc),
            Err(e) => report.push(layer.origin.clone(), IssueKind::Parse, e.to_string()),
        }
    }
    docs
}

struct Resolver<'r> {
    input: &'r ResolveInput,
    report: &'r mut ValidationReport,
}

impl Resolver<'_> {
    fn issue(&mut self, path: impl Into<String>, kind: IssueKind, message: impl Into<String>) {
        self.report.push(path, kind, message);
    }

    fn subst(&mut self, scope: &Scope<'_>, value: &str, path: &str) -> String {
        match scope.substitute(value) {
            Ok(v) => v,
            Err(e) => {
                self.issue(path, IssueKind::UnresolvedVariable, e.to_string());
                value.to_owned()
            }
        }
    }

    fn subst_map(
        &mut self,
        scope: &Scope<'_>,
        map: Option<BTreeMap<String, String>>,
        path: &str,
    ) -> BTreeMap<String, String> {
        map.unwrap_or_default()
            .into_iter()
            .map(|(k, v)| {
                let value = self.subst(scope, &v, &format!("{path}.{k}"));
                (k, value)
            })
            .collect()
    }

    fn subst_list(
        &mut self,
        scope: &Scope<'_>,
        list: Option<Vec<String>>,
        path: &str,
    ) -> Vec<String> {
        list.unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, v)| self.subst(scope, &v, &format!("{path}[{i}]")))
            .collect()
    }

    fn subst_toml(&mut self, scope: &Scope<'_>, value: toml::Value, path: &str) -> toml::Value {
        match value {
            toml::Value::String(s) => toml::Value::String(self.subst(scope, &s, path)),
            toml::Value::Array(items) => toml::Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| self.subst_toml(scope, v, &format!("{path}[{i}]")))
                    .collect(),
            ),
            toml::Value::Table(table) => toml::Value::Table(
                table
                    .into_iter()
                    .map(|(k, v)| {
                        let value = self.subst_toml(scope, v, &format!("{path}.{k}"));
                        (k, value)
                    })
                    .collect(),
            ),
            other => other,
        }
    }

    fn declare(&mut self, scope: &mut Scope<'_>, vars: &BTreeMap<String, String>, path: &str) {
        for (name, err) in scope.declare(vars) {
            self.issue(
                format!("{path}.variables.{name}"),
                IssueKind::UnresolvedVariable,
                err.to_string(),
            );
        }
    }

    fn port(&mut self, value: i64, path: &str) -> Option<u16> {
        match u16::try_from(value) {
            Ok(p) if p >= 1 => Some(p),
            _ => {
                self.issue(
                    path,
                    IssueKind::OutOfRange,
                    format!("port {value} is outside 1..=65535"),
                );
                None
            }
        }
    }

    fn required<T>(&mut self, value: Option<T>, path: &str) -> Option<T> {
        if value.is_none() {
            self.issue(path, IssueKind::Missing, "required value is missing");
        }
        value
    }

    fn system(&mut self, doc: SystemDoc, scope: &mut Scope<'_>) -> SystemConfig {
        let proxy = doc.proxy.unwrap_or_default();
        let url = self
            .required(proxy.url, "system.proxy.url")
            .unwrap_or_default();
        let ports = proxy.ports.unwrap_or_default();
        let http_port = self
            .required(ports.http, "system.proxy.ports.http")
            .and_then(|p| self.port(p, "system.proxy.ports.http"))
            .unwrap_or(80);
        let https_port = match ports.https {
            Some(HttpsPortDoc::Port(p)) => self.port(p, "system.proxy.ports.https"),
            Some(HttpsPortDoc::Toggle(true)) => Some(443),
            Some(HttpsPortDoc::Toggle(false)) | None => None,
        };

        let perf = doc.performance.unwrap_or_default();
        let performance = PerformanceFlags {
            dont_sync_named_volumes_with_host: self.flag(
                perf.dont_sync_named_volumes_with_host,
                "system.performance.dont_sync_named_volumes_with_host",
            ),
            dont_sync_unimportant_src: self.flag(
                perf.dont_sync_unimportant_src,
                "system.performance.dont_sync_unimportant_src",
            ),
        };

        let t = doc.timeouts.unwrap_or_default();
        let timeouts = Timeouts {
            start: self.seconds(t.start_secs, 120, "system.timeouts.start_secs"),
            stop: self.seconds(t.stop_secs, 30, "system.timeouts.stop_secs"),
            readiness: self.seconds(t.readiness_secs, 60, "system.timeouts.readiness_secs"),
            hook: self.seconds(t.hook_secs, 300, "system.timeouts.hook_secs"),
            poll_interval: self.millis(t.poll_interval_ms, 250, "system.timeouts.poll_interval_ms"),
        };

        let engine = doc.engine.unwrap_or_default();
        if engine.is_empty() {
            self.issue("system.engine", IssueKind::Missing, "engine name must not be empty");
        }

        scope.define("proxy_url", url.clone());
        scope.define(
            "config_dir",
            self.input.config_dir.to_string_lossy().into_owned(),
        );
        let variables = doc.variables.unwrap_or_default();
        self.declare(scope, &variables, "system");

        SystemConfig {
            engine,
            repos: doc.repos.unwrap_or_default(),
            update_hosts_file: doc.update_hosts_file.unwrap_or(true),
            proxy: ProxyConfig {
                url,
                http_port,
                https_port,
                autostart: proxy.autostart.unwrap_or(true),
                autostart_restrict: proxy.autostart_restrict,
            },
            performance,
            timeouts,
            variables,
        }
    }

    fn flag(&mut self, flag: Option<FlagDoc>, path: &str) -> PerfFlag {
        match flag {
            None => PerfFlag::Auto,
            Some(FlagDoc::Bool(b)) => b.into(),
            Some(FlagDoc::Text(text)) => PerfFlag::parse(&text).unwrap_or_else(|| {
                self.issue(
                    path,
                    IssueKind::InvalidValue,
                    format!("'{text}' is not one of true, false, \"auto\""),
                );
                PerfFlag::Auto
            }),
        }
    }

    fn seconds(&mut self, value: Option<i64>, default: u64, path: &str) -> Duration {
        match value {
            None => Duration::from_secs(default),
            Some(v) if v >= 1 => Duration::from_secs(v as u64),
            Some(v) => {
                self.issue(path, IssueKind::OutOfRange, format!("{v} must be at least 1"));
                Duration::from_secs(default)
            }
        }
    }

    fn millis(&mut self, value: Option<i64>, default: u64, path: &str) -> Duration {
        match value {
            None => Duration::from_millis(default),
            Some(v) if v >= 1 => Duration::from_millis(v as u64),
            Some(v) => {
                self.issue(path, IssueKind::OutOfRange, format!("{v} must be at least 1"));
                Duration::from_millis(default)
            }
        }
    }

    fn project(
        &mut self,
        doc: ProjectDoc,
        system: &SystemConfig,
        system_scope: &Scope<'_>,
        repos: &Repositories,
    ) -> Option<Project> {
        let root = self.input.project_root.clone();
        let name = self.required(doc.name, "project.name").unwrap_or_default();
        if !name.is_empty() {
            if name.contains('_') {
                self.issue(
                    "project.name",
                    IssueKind::InvalidValue,
                    "project name must not contain underscores",
                );
            }
            if RESERVED_PROJECT_NAMES.contains(&name.as_str()) {
                self.issue(
                    "project.name",
                    IssueKind::InvalidValue,
                    format!("'{name}' is a reserved name"),
                );
            }
        }
        let src = join_normalized(&root, doc.src.as_deref().unwrap_or("."));

        let mut scope = Scope::child(system_scope);
        scope.define("project_name", name.clone());
        scope.define("project_dir", root.to_string_lossy().into_owned());
        scope.define("src_dir", src.to_string_lossy().into_owned());
        let variables = doc.variables.unwrap_or_default();
        self.declare(&mut scope, &variables, "project");

        let app_doc = self.required(doc.app, "project.app")?;
        let (app_doc, app_folders) = expand_traced(app_doc, repos, "app", self.report);
        let ctx = ProjectCtx {
            name: &name,
            root: &root,
            proxy_url: &system.proxy.url,
            app_folders: &app_folders,
        };
        let app = self.app(app_doc, &scope, repos, &ctx);

        let default_services: Vec<ServiceName> = doc
            .default_services
            .unwrap_or_default()
            .into_iter()
            .map(ServiceName::new)
            .collect();
        for (i, svc) in default_services.iter().enumerate() {
            if !app.services.contains_key(svc.as_str()) {
                self.issue(
                    format!("project.default_services[{i}]"),
                    IssueKind::UnknownReference,
                    format!("no service named '{svc}'"),
                );
            }
        }

        Some(Project {
            name: ProjectName::new(name),
            root,
            src,
            links: doc
                .links
                .unwrap_or_default()
                .into_iter()
                .map(ProjectName::new)
                .collect(),
            default_services,
            variables,
            app,
        })
    }

    fn app(
        &mut self,
        doc: AppDoc,
        project_scope: &Scope<'_>,
        repos: &Repositories,
        ctx: &ProjectCtx<'_>,
    ) -> App {
        let mut scope = Scope::child(project_scope);
        let variables = doc.variables.unwrap_or_default();
        self.declare(&mut scope, &variables, "app");

        let unimportant_paths = doc.unimportant_paths.unwrap_or_default();
        for (i, p) in unimportant_paths.iter().enumerate() {
            if Path::new(p).is_absolute() {
                self.issue(
                    format!("app.unimportant_paths[{i}]"),
                    IssueKind::InvalidValue,
                    format!("'{p}' must be relative to the source directory"),
                );
            }
        }

        let mut services = BTreeMap::new();
        for (name, service_doc) in doc.services.unwrap_or_default() {
            let path = format!("app.services.{name}");
            let (service_doc, folders) = expand_traced(service_doc, repos, &path, self.report);
            let search: Vec<PathBuf> = std::iter::once(ctx.root.to_path_buf())
                .chain(folders)
                .chain(ctx.app_folders.iter().cloned())
                .collect();
            if let Some(service) = self.service(&name, service_doc, &scope, ctx, &search, &path) {
                services.insert(ServiceName::new(name), service);
            }
        }
        self.check_service_graph(&services);

        let command_docs = doc.commands.unwrap_or_default();
        let command_names: BTreeSet<String> = command_docs.keys().cloned().collect();
        let mut commands = BTreeMap::new();
        for (name, command_doc) in command_docs {
            let path = format!("app.commands.{name}");
            let command_doc = expand(command_doc, repos, &path, self.report);
            if let Some(kind) =
                self.command(&name, command_doc, &scope, ctx, &command_names, &path)
            {
                let name = CommandName::new(name);
                commands.insert(name.clone(), Command { name, kind });
            }
        }

        App {
            name: doc.name.unwrap_or_else(|| ctx.name.to_owned()),
            services,
            commands,
            unimportant_paths,
            variables,
        }
    }

    fn check_service_graph(&mut self, services: &BTreeMap<ServiceName, Service>) {
        let mains: Vec<&str> = services
            .values()
            .filter(|s| s.has_role(&Role::Main))
            .map(|s| s.name.as_str())
            .collect();
        if mains.len() > 1 {
            self.issue(
                "app.services",
                IssueKind::Duplicate,
                format!("only one service may have role 'main', found: {}", mains.join(", ")),
            );
        }

        for service in services.values() {
            for (i, dep) in service.depends_on.iter().enumerate() {
                if !services.contains_key(dep.as_str()) {
                    self.issue(
                        format!("app.services.{}.depends_on[{i}]", service.name),
                        IssueKind::UnknownReference,
                        format!("no service named '{dep}'"),
                    );
                }
            }
        }

        if let Some(cycle) = dependency_cycle(services) {
            self.issue(
                "app.services",
                IssueKind::Cycle,
                format!("dependency cycle: {}", cycle.join(" -> ")),
            );
        }
    }

    fn unit_scope<'s>(&self, parent: &'s Scope<'s>, name: &str) -> Scope<'s> {
        let mut scope = Scope::child(parent);
        scope.define("name", name);
        scope.define("home_path", CONTAINER_HOME_PATH);
        scope.define("host_address", HOST_ADDRESS);
        scope.define("os_user", self.input.host.os_user.clone());
        scope.define("os_group", self.input.host.os_group.clone());
        scope
    }

    #[allow(clippy::too_many_lines)]
    fn service(
        &mut self,
        name: &str,
        doc: ServiceDoc,
        app_scope: &Scope<'_>,
        ctx: &ProjectCtx<'_>,
        search: &[PathBuf],
        path: &str,
    ) -> Option<Service> {
        let roles: Vec<Role> = doc
            .roles
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| {
                if r.trim().is_empty() {
                    self.issue(format!("{path}.roles[{i}]"), IssueKind::InvalidValue, "empty role");
                    None
                } else {
                    Some(Role::from(r))
                }
            })
            .collect();
        let is_main = roles.contains(&Role::Main);
        let is_src = roles.contains(&Role::Src);
        let domain = service_domain(ctx.name, name, is_main, ctx.proxy_url);
        let volume_path = ctx.root.join(STATE_DIR).join("data").join(name);

        let mut scope = self.unit_scope(app_scope, name);
        scope.define("service_name", name);
        scope.define("domain", domain.clone());
        scope.define("volume_path", volume_path.to_string_lossy().into_owned());
        let variables = doc.variables.unwrap_or_default();
        self.declare(&mut scope, &variables, path);

        let image = self
            .required(doc.image, &format!("{path}.image"))
            .map(|img| self.subst(&scope, &img, &format!("{path}.image")));

        let command = match doc.command {
            None => None,
            Some(ServiceCommandDoc::Single(cmd)) => Some(ServiceCommand::Single(self.subst(
                &scope,
                &cmd,
                &format!("{path}.command"),
            ))),
            Some(ServiceCommandDoc::Groups(groups)) => {
                if !groups.contains_key("default") {
                    self.issue(
                        format!("{path}.command"),
                        IssueKind::Missing,
                        "command groups need a 'default' entry",
                    );
                }
                Some(ServiceCommand::Groups(self.subst_map(
                    &scope,
                    Some(groups),
                    &format!("{path}.command"),
                )))
            }
        };

        let port = doc.port.and_then(|p| self.port(p, &format!("{path}.port")));
        let additional_ports =
            self.additional_ports(doc.additional_ports.unwrap_or_default(), port, path);
        let volumes = self.volumes(doc.volumes.unwrap_or_default(), &scope, ctx.root, path);
        let environment = self.subst_map(&scope, doc.environment, &format!("{path}.environment"));

        let working_directory = doc
            .working_directory
            .map(|wd| self.subst(&scope, &wd, &format!("{path}.working_directory")));
        if let Some(wd) = &working_directory {
            if !wd.starts_with('/') && !is_src {
                self.issue(
                    format!("{path}.working_directory"),
                    IssueKind::InvalidValue,
                    format!("relative working directory '{wd}' requires role 'src'"),
                );
            }
        }

        let run_as_root = doc.run_as_root.unwrap_or(false);
        let dont_create_user = doc.dont_create_user.unwrap_or(false);
        if run_as_root && dont_create_user {
            self.issue(
                path,
                IssueKind::Permission,
                "dont_create_user only applies to services not running as root; \
                 run_as_root and dont_create_user are both set",
            );
        }

        let logging = doc.logging.unwrap_or_default();
        let logging = Logging {
            stdout: logging.stdout.unwrap_or(false),
            stderr: logging.stderr.unwrap_or(false),
            paths: self.subst_map(&scope, logging.paths, &format!("{path}.logging.paths")),
            commands: self.subst_map(&scope, logging.commands, &format!("{path}.logging.commands")),
        };

        let additional_subdomains = self.subst_list(
            &scope,
            doc.additional_subdomains,
            &format!("{path}.additional_subdomains"),
        );
        for (i, sub) in additional_subdomains.iter().enumerate() {
            if sub.is_empty() || sub.contains('.') {
                self.issue(
                    format!("{path}.additional_subdomains[{i}]"),
                    IssueKind::InvalidValue,
                    format!("'{sub}' must be a single non-empty label"),
                );
            }
        }

        let driver = match doc.driver {
            None => None,
            Some(driver) => {
                let name = self.required(driver.name, &format!("{path}.driver.name"));
                let config = match self.subst_toml(
                    &scope,
                    toml::Value::Table(driver.config.unwrap_or_default()),
                    &format!("{path}.driver.config"),
                ) {
                    toml::Value::Table(t) => t,
                    _ => toml::Table::new(),
                };
                name.map(|name| DriverConfig { name, config })
            }
        };
        if roles.contains(&Role::Db) && driver.is_none() {
            self.issue(
                format!("{path}.driver"),
                IssueKind::Missing,
                "services with role 'db' need a driver",
            );
        }

        let pre_start = self.subst_list(&scope, doc.pre_start, &format!("{path}.pre_start"));
        let post_start = self.subst_list(&scope, doc.post_start, &format!("{path}.post_start"));
        let config = self.config_files(doc.config, &scope, search, path);

        Some(Service {
            name: ServiceName::new(name),
            roles,
            image: image.unwrap_or_default(),
            command,
            port,
            additional_ports,
            volumes,
            environment,
            working_directory,
            run_as_root,
            dont_create_user,
            pre_start,
            post_start,
            logging,
            additional_subdomains,
            optional: doc.optional.unwrap_or(false),
            depends_on: doc
                .depends_on
                .unwrap_or_default()
                .into_iter()
                .map(ServiceName::new)
                .collect(),
            ready_label: doc.ready_label,
            allow_full_memlock: doc.allow_full_memlock.unwrap_or(false),
            driver,
            config,
            variables: scope.flatten(),
            domain,
            volume_path,
        })
    }

    /// Locate config templates in the project folder or the repository
    /// folders the service and its app were extended from, first hit wins.
    fn config_files(
        &mut self,
        docs: Option<BTreeMap<String, ConfigFileDoc>>,
        scope: &Scope<'_>,
        search: &[PathBuf],
        path: &str,
    ) -> BTreeMap<String, ConfigFile> {
        let mut files = BTreeMap::new();
        for (name, doc) in docs.unwrap_or_default() {
            let at = format!("{path}.config.{name}");
            let from = self.required(doc.from, &format!("{at}.from"));
            let to = self.required(doc.to, &format!("{at}.to"));
            let (Some(from), Some(to)) = (from, to) else {
                continue;
            };
            if from.starts_with('.') || Path::new(&from).is_absolute() {
                self.issue(
                    format!("{at}.from"),
                    IssueKind::InvalidValue,
                    format!("'{from}' must be a relative path not starting with '.'"),
                );
                continue;
            }
            let Some(source) = search.iter().map(|dir| dir.join(&from)).find(|p| p.is_file())
            else {
                let searched: Vec<String> =
                    search.iter().map(|d| d.display().to_string()).collect();
                self.issue(
                    format!("{at}.from"),
                    IssueKind::UnknownReference,
                    format!("'{from}' is not a file in any of: {}", searched.join(", ")),
                );
                continue;
            };
            let to = self.subst(scope, &to, &format!("{at}.to"));
            let target = join_normalized(Path::new(CONTAINER_SRC_PATH), &to)
                .to_string_lossy()
                .into_owned();
            files.insert(name, ConfigFile { source, target });
        }
        files
    }

    fn additional_ports(
        &mut self,
        docs: Vec<AdditionalPortDoc>,
        main_port: Option<u16>,
        path: &str,
    ) -> Vec<AdditionalPort> {
        let mut container_ports: BTreeSet<u16> = main_port.into_iter().collect();
        let mut host_ports = BTreeSet::new();
        let mut out = Vec::with_capacity(docs.len());

        for (i, doc) in docs.into_iter().enumerate() {
            let at = format!("{path}.additional_ports[{i}]");
            let Some(container) = self.port(doc.container, &format!("{at}.container")) else {
                continue;
            };
            if !container_ports.insert(container) {
                self.issue(
                    format!("{at}.container"),
                    IssueKind::Duplicate,
                    format!("container port {container} is declared more than once"),
                );
            }
            let host = doc.host.and_then(|h| self.port(h, &format!("{at}.host")));
            if let Some(h) = host {
                if !host_ports.insert(h) {
                    self.issue(
                        format!("{at}.host"),
                        IssueKind::Duplicate,
                        format!("host port {h} is declared more than once"),
                    );
                }
            }
            let host_start = doc
                .host_start
                .and_then(|h| self.port(h, &format!("{at}.host_start")))
                .unwrap_or(container);
            out.push(AdditionalPort {
                title: doc.title.unwrap_or_else(|| format!("port {container}")),
                container,
                host,
                host_start,
            });
        }
        out
    }

    fn volumes(
        &mut self,
        docs: Vec<VolumeDoc>,
        scope: &Scope<'_>,
        root: &Path,
        path: &str,
    ) -> Vec<Volume> {
        docs.into_iter()
            .enumerate()
            .filter_map(|(i, doc)| self.volume(doc, scope, root, &format!("{path}.volumes[{i}]")))
            .collect()
    }

    fn volume(
        &mut self,
        doc: VolumeDoc,
        scope: &Scope<'_>,
        root: &Path,
        at: &str,
    ) -> Option<Volume> {
        let host = self.subst(scope, &doc.host, &format!("{at}.host"));
        let container = self.subst(scope, &doc.container, &format!("{at}.container"));
        if !container.starts_with('/') {
            self.issue(
                format!("{at}.container"),
                IssueKind::InvalidValue,
                format!("container path '{container}' must be absolute"),
            );
        }
        let mode = match doc.mode.as_deref() {
            None | Some("rw") => Some(VolumeMode::Rw),
            Some("ro") => Some(VolumeMode::Ro),
            Some(other) => {
                self.issue(
                    format!("{at}.mode"),
                    IssueKind::InvalidValue,
                    format!("mode '{other}' is not one of rw, ro"),
                );
                None
            }
        };
        let kind = match doc.kind.as_deref() {
            None | Some("directory") => Some(VolumeKind::Directory),
            Some("file") => Some(VolumeKind::File),
            Some(other) => {
                self.issue(
                    format!("{at}.type"),
                    IssueKind::InvalidValue,
                    format!("type '{other}' is not one of directory, file"),
                );
                None
            }
        };
        Some(Volume {
            host: join_normalized(root, &host),
            container,
            mode: mode?,
            kind: kind?,
            volume_name: doc.volume_name,
        })
    }

    fn command(
        &mut self,
        name: &str,
        doc: CommandDoc,
        app_scope: &Scope<'_>,
        ctx: &ProjectCtx<'_>,
        known: &BTreeSet<String>,
        path: &str,
    ) -> Option<CommandKind> {
        let forms = [
            doc.image.is_some(),
            doc.aliases.is_some(),
            doc.in_service_with_role.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if forms != 1 {
            self.issue(
                path,
                IssueKind::InvalidValue,
                "a command needs exactly one of image, aliases, in_service_with_role",
            );
            return None;
        }

        let mut scope = self.unit_scope(app_scope, name);
        let variables = doc.variables.unwrap_or_default();
        self.declare(&mut scope, &variables, path);

        if let Some(target) = doc.aliases {
            let extra = doc.command.is_some()
                || doc.volumes.is_some()
                || doc.environment.is_some()
                || doc.working_directory.is_some()
                || doc.use_host_network.is_some();
            if extra {
                self.issue(
                    path,
                    IssueKind::InvalidValue,
                    "an alias may not declare its own command, volumes, environment or working directory",
                );
            }
            if !known.contains(&target) {
                self.issue(
                    format!("{path}.aliases"),
                    IssueKind::UnknownReference,
                    format!("no command named '{target}'"),
                );
            }
            return Some(CommandKind::Alias {
                target: CommandName::new(target),
            });
        }

        let environment = self.subst_map(&scope, doc.environment, &format!("{path}.environment"));

        if let Some(role) = doc.in_service_with_role {
            let command = self
                .required(doc.command, &format!("{path}.command"))
                .map(|c| self.subst(&scope, &c, &format!("{path}.command")));
            return Some(CommandKind::InService {
                role: Role::from(role),
                command: command?,
                environment,
            });
        }

        let image = doc.image.map(|i| self.subst(&scope, &i, &format!("{path}.image")))?;
        let command = doc
            .command
            .map(|c| self.subst(&scope, &c, &format!("{path}.command")));
        let volumes = self.volumes(doc.volumes.unwrap_or_default(), &scope, ctx.root, path);
        let working_directory = doc
            .working_directory
            .map(|wd| self.subst(&scope, &wd, &format!("{path}.working_directory")));
        Some(CommandKind::Image {
            image,
            command,
            volumes,
            environment,
            working_directory,
            use_host_network: doc.use_host_network.unwrap_or(false),
        })
    }
}

struct ProjectCtx<'a> {
    name: &'a str,
    root: &'a Path,
    proxy_url: &'a str,
    /// Repository folders the app document was extended from.
    app_folders: &'a [PathBuf],
}

/// First dependency cycle found, as a name chain that ends where it started.
fn dependency_cycle(services: &BTreeMap<ServiceName, Service>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        services: &'a BTreeMap<ServiceName, Service>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut chain: Vec<String> =
                    stack[start..].iter().map(|s| (*s).to_owned()).collect();
                chain.push(name.to_owned());
                return Some(chain);
            }
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        stack.push(name);
        if let Some(service) = services.get(name) {
            for dep in &service.depends_on {
                if let Some(cycle) = visit(dep.as_str(), services, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    for name in services.keys() {
        let mut stack = Vec::new();
        if let Some(cycle) = visit(name.as_str(), services, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

/// Join `rel` onto `base` (absolute `rel` replaces it) and fold `.`/`..`.
pub fn join_normalized(base: &Path, rel: &str) -> PathBuf {
    let joined = base.join(rel);
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(project: &str) -> ResolveInput {
        ResolveInput {
            system_layers: Vec::new(),
            project_layers: vec![Layer::new("riptide.toml", project)],
            project_root: PathBuf::from("/work/shop"),
            config_dir: PathBuf::from("/home/u/.config/riptide"),
            host: HostContext {
                os_user: "1000".to_owned(),
                os_group: "1000".to_owned(),
            },
        }
    }

    fn report(result: Result<ResolvedConfig, SchemaError>) -> ValidationReport {
        match result {
            Err(SchemaError::Validation(report)) => report,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    const MINIMAL: &str = r#"
name = "shop"

[app.services.www]
roles = ["main", "src"]
image = "nginx"
port = 8080
"#;

    #[test]
    fn minimal_project_uses_system_defaults() {
        let config = resolve(&input(MINIMAL)).unwrap();
        assert_eq!(config.system.engine, "docker");
        assert_eq!(config.system.proxy.url, "riptide.local");
        assert_eq!(config.system.performance.dont_sync_unimportant_src, PerfFlag::Auto);
        let www = &config.project.app.services["www"];
        assert_eq!(www.domain, "shop.riptide.local");
        assert_eq!(www.volume_path, PathBuf::from("/work/shop/_riptide/data/www"));
        assert_eq!(config.project.src, PathBuf::from("/work/shop"));
        assert_eq!(config.project.app.name, "shop");
    }

    #[test]
    fn project_variable_reaches_service_environment() {
        let project = r#"
name = "shop"
[variables]
FOO = "from-project"

[app.services.www]
image = "nginx"
environment = { VALUE = "${FOO}", HOST = "$domain", DATA = "$volume_path" }
"#;
        let config = resolve(&input(project)).unwrap();
        let env = &config.project.app.services["www"].environment;
        assert_eq!(env["VALUE"], "from-project");
        assert_eq!(env["HOST"], "shop--www.riptide.local");
        assert_eq!(env["DATA"], "/work/shop/_riptide/data/www");
    }

    #[test]
    fn unresolved_variable_is_a_validation_issue() {
        let project = r#"
name = "shop"
[app.services.www]
image = "nginx"
environment = { VALUE = "${FOO}" }
"#;
        let report = report(resolve(&input(project)));
        let issue = report
            .issues()
            .iter()
            .find(|i| i.kind == IssueKind::UnresolvedVariable)
            .unwrap();
        assert_eq!(issue.path, "app.services.www.environment.VALUE");
        assert!(issue.message.contains("FOO"));
    }

    #[test]
    fn local_override_layers_last() {
        let mut inp = input(MINIMAL);
        inp.project_layers.push(Layer::new(
            "riptide.local.toml",
            "[app.services.www]\nport = 9090\nenvironment = { DEBUG = \"1\" }\n",
        ));
        let config = resolve(&inp).unwrap();
        let www = &config.project.app.services["www"];
        assert_eq!(www.port, Some(9090));
        assert_eq!(www.image, "nginx");
        assert_eq!(www.environment["DEBUG"], "1");
    }

    #[test]
    fn system_layer_overrides_defaults() {
        let mut inp = input(MINIMAL);
        inp.system_layers.push(Layer::new(
            "config.toml",
            "engine = \"mock\"\n[proxy]\nurl = \"dev.test\"\n[proxy.ports]\nhttps = false\n[performance]\ndont_sync_named_volumes_with_host = true\n",
        ));
        let config = resolve(&inp).unwrap();
        assert_eq!(config.system.engine, "mock");
        assert_eq!(config.system.proxy.https_port, None);
        assert_eq!(config.system.proxy.http_port, 80);
        assert_eq!(
            config.system.performance.dont_sync_named_volumes_with_host,
            PerfFlag::Enabled
        );
        assert_eq!(config.project.app.services["www"].domain, "shop.dev.test");
    }

    #[test]
    fn parse_errors_from_all_layers_are_collected() {
        let mut inp = input("name = \"shop\"\nbogus = 1\n");
        inp.system_layers.push(Layer::new("config.toml", "engine = 5\n"));
        inp.project_layers
            .push(Layer::new("riptide.local.toml", "[app\n"));
        let report = report(resolve(&inp));
        assert_eq!(report.len(), 3);
        assert!(report.issues().iter().all(|i| i.kind == IssueKind::Parse));
        let origins: Vec<&str> = report.issues().iter().map(|i| i.path.as_str()).collect();
        assert_eq!(origins, vec!["config.toml", "riptide.toml", "riptide.local.toml"]);
    }

    #[test]
    fn structural_issues_are_collected_in_one_pass() {
        let project = r#"
name = "my_shop"

[app.services.www]
roles = ["main"]
port = 70000
working_directory = "public"

[[app.services.www.volumes]]
host = "data"
container = "/data"
mode = "rwx"

[app.services.api]
roles = ["main"]
image = "api"
port = 8080
run_as_root = true
dont_create_user = true

[[app.services.api.additional_ports]]
container = 8080

[app.services.db]
roles = ["db"]
image = "mariadb"
"#;
        let report = report(resolve(&input(project)));
        let kinds = |path: &str| -> Vec<IssueKind> { report.at(path).map(|i| i.kind).collect() };
        assert!(kinds("project.name").contains(&IssueKind::InvalidValue));
        assert!(kinds("app.services.www.image").contains(&IssueKind::Missing));
        assert!(kinds("app.services.www.port").contains(&IssueKind::OutOfRange));
        assert!(kinds("app.services.www.working_directory").contains(&IssueKind::InvalidValue));
        assert!(kinds("app.services.www.volumes[0].mode").contains(&IssueKind::InvalidValue));
        assert!(
            kinds("app.services.api.additional_ports[0].container").contains(&IssueKind::Duplicate)
        );
        assert!(kinds("app.services.api").contains(&IssueKind::Permission));
        assert!(kinds("app.services.db.driver").contains(&IssueKind::Missing));
        assert!(report
            .issues()
            .iter()
            .any(|i| i.path == "app.services" && i.kind == IssueKind::Duplicate));
    }

    #[test]
    fn reserved_project_name_is_rejected() {
        let report = report(resolve(&input(
            "name = \"control\"\n[app.services.www]\nimage = \"nginx\"\n",
        )));
        assert!(report.has(IssueKind::InvalidValue));
    }

    #[test]
    fn dependency_problems_are_reported() {
        let project = r#"
name = "shop"
[app.services.a]
image = "a"
depends_on = ["b"]
[app.services.b]
image = "b"
depends_on = ["a", "ghost"]
"#;
        let report = report(resolve(&input(project)));
        assert!(report.has(IssueKind::Cycle));
        assert!(report.has(IssueKind::UnknownReference));
    }

    #[test]
    fn alias_cycle_is_rejected_after_validation() {
        let project = r#"
name = "shop"
[app.commands.a]
aliases = "b"
[app.commands.b]
aliases = "a"
"#;
        match resolve(&input(project)) {
            Err(SchemaError::AliasCycle { chain }) => {
                assert_eq!(chain.first(), chain.last());
                assert_eq!(chain.len(), 3);
            }
            other => panic!("expected alias cycle, got {other:?}"),
        }
    }

    #[test]
    fn command_forms_are_exclusive() {
        let project = r#"
name = "shop"
[app.commands.both]
image = "php"
aliases = "php"
[app.commands.none]
command = "ls"
[app.commands.dangling]
aliases = "ghost"
"#;
        let report = report(resolve(&input(project)));
        assert_eq!(report.at("app.commands.both").count(), 1);
        assert_eq!(report.at("app.commands.none").count(), 1);
        assert!(report
            .at("app.commands.dangling.aliases")
            .any(|i| i.kind == IssueKind::UnknownReference));
    }

    #[test]
    fn volumes_resolve_against_project_root() {
        let project = r#"
name = "shop"
[app.services.www]
image = "nginx"
[[app.services.www.volumes]]
host = "$volume_path/cache"
container = "/cache"
[[app.services.www.volumes]]
host = "./conf/../etc/nginx.conf"
container = "/etc/nginx/nginx.conf"
mode = "ro"
type = "file"
"#;
        let config = resolve(&input(project)).unwrap();
        let volumes = &config.project.app.services["www"].volumes;
        assert_eq!(volumes[0].host, PathBuf::from("/work/shop/_riptide/data/www/cache"));
        assert_eq!(volumes[0].mode, VolumeMode::Rw);
        assert_eq!(volumes[1].host, PathBuf::from("/work/shop/etc/nginx.conf"));
        assert_eq!(volumes[1].kind, VolumeKind::File);
    }

    #[test]
    fn resolution_is_byte_identical() {
        let inp = input(
            r#"
name = "shop"
[variables]
b = "2"
a = "1"
[app.services.www]
image = "nginx"
environment = { Z = "$a", A = "$b" }
[app.services.db]
image = "pg"
roles = ["db"]
driver = { name = "postgres", config = { password = "x" } }
"#,
        );
        let first = resolve(&inp).unwrap();
        let second = resolve(&inp).unwrap();
        assert_eq!(first.canonical_json().unwrap(), second.canonical_json().unwrap());
        assert_eq!(first.fingerprint().unwrap(), second.fingerprint().unwrap());
        assert_eq!(inp.fingerprint(), inp.clone().fingerprint());
    }

    #[test]
    fn repository_extends_is_applied() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(repo.path().join("service")).unwrap();
        std::fs::write(
            repo.path().join("service/php.toml"),
            "image = \"php:8.3\"\nport = 80\n[[volumes]]\nhost = \"$volume_path/sessions\"\ncontainer = \"/sessions\"\n",
        )
        .unwrap();
        let mut inp = input(
            r#"
name = "shop"
[app.services.www]
extends = "service/php"
roles = ["main", "src"]
[[app.services.www.volumes]]
host = "uploads"
container = "/uploads"
"#,
        );
        inp.system_layers.push(Layer::new(
            "config.toml",
            format!("repos = [{:?}]\n", repo.path().to_string_lossy()),
        ));
        let config = resolve(&inp).unwrap();
        let www = &config.project.app.services["www"];
        assert_eq!(www.image, "php:8.3");
        assert_eq!(www.port, Some(80));
        assert_eq!(www.volumes.len(), 2);
    }

    #[test]
    fn config_templates_are_found_in_project_and_repository_folders() {
        let root = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("php")).unwrap();
        std::fs::write(root.path().join("php/php.ini"), "memory_limit = 1G\n").unwrap();
        std::fs::write(root.path().join("env.dist"), "APP_URL=https://$domain\n").unwrap();
        std::fs::create_dir_all(repo.path().join("service")).unwrap();
        std::fs::write(
            repo.path().join("service/php.toml"),
            "image = \"php\"\n[config.fpm]\nfrom = \"fpm.conf\"\nto = \"/etc/php-fpm.conf\"\n",
        )
        .unwrap();
        std::fs::write(repo.path().join("service/fpm.conf"), "listen = 9000\n").unwrap();

        let mut inp = input(
            r#"
name = "shop"
[app.services.www]
extends = "service/php"
roles = ["main", "src"]
[app.services.www.config.ini]
from = "php/php.ini"
to = "/usr/local/etc/php/php.ini"
[app.services.www.config.env]
from = "env.dist"
to = "./.env"
"#,
        );
        inp.project_root = root.path().to_path_buf();
        inp.system_layers.push(Layer::new(
            "config.toml",
            format!("repos = [{:?}]\n", repo.path().to_string_lossy()),
        ));
        let config = resolve(&inp).unwrap();
        let www = &config.project.app.services["www"];
        assert_eq!(www.config.len(), 3);
        assert_eq!(www.config["ini"].source, root.path().join("php/php.ini"));
        assert_eq!(www.config["ini"].target, "/usr/local/etc/php/php.ini");
        assert_eq!(www.config["env"].target, "/src/.env");
        assert_eq!(www.config["fpm"].source, repo.path().join("service/fpm.conf"));
        assert_eq!(www.variables["domain"], "shop.riptide.local");
        assert_eq!(www.variables["project_name"], "shop");
    }

    #[test]
    fn invalid_config_entries_are_reported() {
        let root = tempfile::tempdir().unwrap();
        let mut inp = input(
            r#"
name = "shop"
[app.services.www]
image = "nginx"
config = { up = { from = "../secret", to = "/a" }, gone = { from = "nope.tpl", to = "/b" }, half = { from = "x" } }
"#,
        );
        inp.project_root = root.path().to_path_buf();
        let report = report(resolve(&inp));
        let kinds = |path: &str| -> Vec<IssueKind> { report.at(path).map(|i| i.kind).collect() };
        assert_eq!(kinds("app.services.www.config.up.from"), vec![IssueKind::InvalidValue]);
        assert_eq!(
            kinds("app.services.www.config.gone.from"),
            vec![IssueKind::UnknownReference]
        );
        assert_eq!(kinds("app.services.www.config.half.to"), vec![IssueKind::Missing]);
    }

    #[test]
    fn normalizes_joined_paths() {
        assert_eq!(
            join_normalized(Path::new("/a/b"), "../c/./d"),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(join_normalized(Path::new("/a"), "/abs"), PathBuf::from("/abs"));
    }
}
