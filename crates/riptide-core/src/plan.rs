//! Translating resolved services and commands into engine unit specs, and
//! preparing the host paths they mount.

use riptide_engine::{
    DatabaseDriver, LogSource, LogStream, Mount, MountSource, PortBinding, ResolvedPerformance,
    UnitId, UnitSpec,
};
use riptide_schema::{
    join_normalized, AdditionalPort, CommandKind, Project, Role, Service, Volume, VolumeKind,
    VolumeMode, CONFIG_NOTICE_SUFFIX, CONTAINER_SRC_PATH,
};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

pub(crate) const LABEL_PROJECT: &str = "riptide.project";
pub(crate) const LABEL_SERVICE: &str = "riptide.service";
pub(crate) const LABEL_COMMAND: &str = "riptide.command";
pub(crate) const LABEL_MAIN: &str = "riptide.main";

/// Whether `path` lies inside `root` once `.` and `..` are folded.
pub(crate) fn inside(root: &Path, path: &Path) -> bool {
    let resolved = join_normalized(root, &path.to_string_lossy());
    let root = join_normalized(root, ".");
    resolved.starts_with(root)
}

/// Additional ports of a service, driver-contributed ones first. The
/// service's own entry wins for the same container port.
pub(crate) fn effective_ports(
    service: &Service,
    driver: Option<&dyn DatabaseDriver>,
) -> Vec<AdditionalPort> {
    let mut ports: Vec<AdditionalPort> = driver
        .map(|d| d.collect_additional_ports(service))
        .unwrap_or_default()
        .into_iter()
        .filter(|p| !service.additional_ports.iter().any(|own| own.container == p.container))
        .collect();
    ports.extend(service.additional_ports.iter().cloned());
    ports
}

fn is_named(volume: &Volume, perf: &ResolvedPerformance) -> bool {
    perf.dont_sync_named_volumes_with_host && volume.volume_name.is_some()
}

fn touch(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// Create everything on the host a service mounts or writes to before its
/// container exists.
pub(crate) fn prepare_host(
    project: &Project,
    service: &Service,
    perf: &ResolvedPerformance,
) -> io::Result<()> {
    fs::create_dir_all(&service.volume_path)?;

    if service.has_role(&Role::Src) {
        if let Some(wd) = service.working_directory.as_deref().filter(|wd| !wd.starts_with('/')) {
            fs::create_dir_all(join_normalized(&project.src, wd))?;
        }
    }

    for (name, _) in log_names(service) {
        touch(&project.log_file(&service.name, &name))?;
    }

    for volume in service.volumes.iter().filter(|v| !is_named(v, perf)) {
        match volume.kind {
            VolumeKind::Directory => fs::create_dir_all(&volume.host)?,
            VolumeKind::File => touch(&volume.host)?,
        }
    }
    write_config_files(project, service)
}

/// Render every config template of a service. Files rendered into the
/// source tree get a note next to them naming their template.
fn write_config_files(project: &Project, service: &Service) -> io::Result<()> {
    for (name, file) in &service.config {
        let Some(target) = project.config_file(service, name) else {
            continue;
        };
        let content = service.render_config(file)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, content)?;

        if service.config_in_src(file).is_some() {
            let mut notice = target.clone().into_os_string();
            notice.push(CONFIG_NOTICE_SUFFIX);
            let notice = PathBuf::from(notice);
            if !notice.is_file() {
                fs::write(&notice, config_notice(&target, &file.source))?;
            }
        }
    }
    Ok(())
}

fn config_notice(target: &Path, source: &Path) -> String {
    let file = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(
        "{file} was generated by riptide from {} and is rewritten every time the \
         service starts. Edit the template instead and keep both files out of version \
         control.\n",
        source.display()
    )
}

/// Every log name of a service and where its content comes from; path
/// bindings are mounted, everything else is captured by the backend.
fn log_names(service: &Service) -> Vec<(String, Option<LogSource>)> {
    let logging = &service.logging;
    let mut names = Vec::new();
    if logging.stdout {
        names.push(("stdout".to_owned(), Some(LogSource::Stdout)));
    }
    if logging.stderr {
        names.push(("stderr".to_owned(), Some(LogSource::Stderr)));
    }
    for name in logging.paths.keys() {
        names.push((name.clone(), None));
    }
    for (name, command) in &logging.commands {
        names.push((name.clone(), Some(LogSource::Command(command.clone()))));
    }
    names
}

fn src_mounts(project: &Project, perf: &ResolvedPerformance) -> Vec<Mount> {
    let mut mounts = vec![Mount {
        source: MountSource::HostPath(project.src.clone()),
        target: CONTAINER_SRC_PATH.to_owned(),
        read_only: false,
        sync: true,
    }];
    if perf.dont_sync_unimportant_src {
        for rel in &project.app.unimportant_paths {
            let rel = rel.trim_matches('/');
            mounts.push(Mount {
                source: MountSource::Named(format!("{}--{}", project.name, rel.replace('/', "-"))),
                target: format!("{CONTAINER_SRC_PATH}/{rel}"),
                read_only: false,
                sync: false,
            });
        }
    }
    mounts
}

fn volume_mounts(project: &Project, volumes: &[Volume], perf: &ResolvedPerformance) -> Vec<Mount> {
    volumes
        .iter()
        .map(|volume| {
            let source = match &volume.volume_name {
                Some(name) if is_named(volume, perf) => {
                    MountSource::Named(format!("{}--{name}", project.name))
                }
                _ => MountSource::HostPath(volume.host.clone()),
            };
            Mount {
                sync: matches!(source, MountSource::HostPath(_)),
                source,
                target: volume.container.clone(),
                read_only: volume.mode == VolumeMode::Ro,
            }
        })
        .collect()
}

pub(crate) fn service_spec(
    project: &Project,
    service: &Service,
    perf: &ResolvedPerformance,
    driver: Option<&dyn DatabaseDriver>,
    ports: &BTreeMap<u16, u16>,
    command_group: Option<&str>,
) -> UnitSpec {
    let mut spec = UnitSpec::new(
        UnitId::service(project.name.as_str(), service.name.as_str()),
        service.image.clone(),
    );
    spec.command = service.command_for(command_group).map(str::to_owned);
    spec.working_directory = service.container_working_directory();
    spec.exposed_port = service.port;
    spec.ports = ports
        .iter()
        .map(|(&container, &host)| PortBinding { container, host })
        .collect();
    spec.run_as_root = service.run_as_root;
    spec.create_user = !service.run_as_root && !service.dont_create_user;
    spec.hostname = Some(service.domain.clone());
    spec.full_memlock = service.allow_full_memlock;

    if service.has_role(&Role::Src) {
        spec.mounts.extend(src_mounts(project, perf));
    }
    spec.mounts.extend(volume_mounts(project, &service.volumes, perf));
    for (name, file) in &service.config {
        if service.config_in_src(file).is_some() {
            continue;
        }
        if let Some(host) = project.config_file(service, name) {
            spec.mounts.push(Mount {
                source: MountSource::HostPath(host),
                target: file.target.clone(),
                read_only: true,
                sync: true,
            });
        }
    }
    for (name, container_path) in &service.logging.paths {
        spec.mounts.push(Mount {
            source: MountSource::HostPath(project.log_file(&service.name, name)),
            target: container_path.clone(),
            read_only: false,
            sync: true,
        });
    }
    spec.logs = log_names(service)
        .into_iter()
        .filter_map(|(name, source)| {
            source.map(|source| LogStream {
                source,
                file: project.log_file(&service.name, &name),
            })
        })
        .collect();

    spec.environment = service.environment.clone();
    if let Some(driver) = driver {
        spec.mounts.extend(driver.collect_volumes(service));
        spec.environment.extend(driver.collect_environment(service));
    }

    spec.labels.insert(LABEL_PROJECT.to_owned(), project.name.to_string());
    spec.labels.insert(LABEL_SERVICE.to_owned(), service.name.to_string());
    if service.has_role(&Role::Main) {
        spec.labels.insert(LABEL_MAIN.to_owned(), "true".to_owned());
    }
    spec
}

/// Spec for a one-shot image command. Commands always see the source tree.
pub(crate) fn command_spec(
    project: &Project,
    name: &str,
    kind: &CommandKind,
    perf: &ResolvedPerformance,
) -> Option<UnitSpec> {
    let CommandKind::Image {
        image,
        volumes,
        environment,
        working_directory,
        use_host_network,
        ..
    } = kind
    else {
        return None;
    };
    let mut spec = UnitSpec::new(UnitId::command(project.name.as_str(), name), image.clone());
    spec.mounts.extend(src_mounts(project, perf));
    spec.mounts.extend(volume_mounts(project, volumes, perf));
    spec.environment = environment.clone();
    spec.working_directory = Some(match working_directory.as_deref() {
        Some(wd) if wd.starts_with('/') => wd.to_owned(),
        Some(wd) => join_normalized(Path::new(CONTAINER_SRC_PATH), wd)
            .to_string_lossy()
            .into_owned(),
        None => CONTAINER_SRC_PATH.to_owned(),
    });
    spec.host_network = *use_host_network;
    spec.labels.insert(LABEL_PROJECT.to_owned(), project.name.to_string());
    spec.labels.insert(LABEL_COMMAND.to_owned(), name.to_owned());
    Some(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_engine::mock::MockDriver;
    use riptide_schema::{resolve, HostContext, Layer, ResolveInput, ResolvedConfig};
    use std::path::PathBuf;

    fn config(root: &Path, project: &str) -> ResolvedConfig {
        resolve(&ResolveInput {
            system_layers: Vec::new(),
            project_layers: vec![Layer::new("riptide.toml", project)],
            project_root: root.to_path_buf(),
            config_dir: PathBuf::from("/cfg"),
            host: HostContext::default(),
        })
        .unwrap()
    }

    const SHOP: &str = r#"
name = "shop"
[app]
unimportant_paths = ["node_modules", "var/cache"]
[app.services.www]
image = "php"
port = 80
roles = ["main", "src"]
working_directory = "public"
volumes = [
  { host = "$volume_path/sessions", container = "/var/sessions" },
  { host = "composer-cache", container = "/home/riptide/.composer", volume_name = "composer", mode = "ro" },
  { host = "php.ini", container = "/etc/php.ini", type = "file" },
]
logging = { stdout = true, paths = { access = "/var/log/access.log" }, commands = { tail = "tail -f x" } }
"#;

    const ON: ResolvedPerformance = ResolvedPerformance {
        dont_sync_named_volumes_with_host: true,
        dont_sync_unimportant_src: true,
    };
    const OFF: ResolvedPerformance = ResolvedPerformance {
        dont_sync_named_volumes_with_host: false,
        dont_sync_unimportant_src: false,
    };

    #[test]
    fn host_preparation_creates_mount_sources() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), SHOP);
        let www = &cfg.project.app.services["www"];
        prepare_host(&cfg.project, www, &OFF).unwrap();

        assert!(www.volume_path.join("sessions").is_dir());
        assert!(dir.path().join("public").is_dir());
        assert!(dir.path().join("php.ini").is_file());
        assert!(cfg.project.log_file("www", "stdout").is_file());
        assert!(cfg.project.log_file("www", "access").is_file());
        assert!(cfg.project.log_file("www", "tail").is_file());
    }

    #[test]
    fn performance_flags_change_mount_sources() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), SHOP);
        let www = &cfg.project.app.services["www"];

        let plain = service_spec(&cfg.project, www, &OFF, None, &BTreeMap::new(), None);
        assert!(plain
            .mounts
            .iter()
            .all(|m| matches!(m.source, MountSource::HostPath(_))));

        let tuned = service_spec(&cfg.project, www, &ON, None, &BTreeMap::new(), None);
        let named: Vec<_> = tuned
            .mounts
            .iter()
            .filter_map(|m| match &m.source {
                MountSource::Named(n) => Some((n.as_str(), m.target.as_str())),
                MountSource::HostPath(_) => None,
            })
            .collect();
        assert_eq!(
            named,
            vec![
                ("shop--node_modules", "/src/node_modules"),
                ("shop--var-cache", "/src/var/cache"),
                ("shop--composer", "/home/riptide/.composer"),
            ]
        );
    }

    #[test]
    fn spec_carries_service_settings() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), SHOP);
        let www = &cfg.project.app.services["www"];
        let ports = BTreeMap::from([(9000, 9001)]);
        let spec = service_spec(&cfg.project, www, &OFF, None, &ports, None);

        assert_eq!(spec.unit, UnitId::service("shop", "www"));
        assert_eq!(spec.working_directory.as_deref(), Some("/src/public"));
        assert_eq!(spec.exposed_port, Some(80));
        assert_eq!(spec.ports, vec![PortBinding { container: 9000, host: 9001 }]);
        assert!(spec.create_user);
        assert_eq!(spec.labels[LABEL_MAIN], "true");
        assert_eq!(spec.logs.len(), 2);
        assert_eq!(
            spec.host_path_for("/var/log/access.log"),
            Some(cfg.project.log_file("www", "access"))
        );
        assert!(spec.mounts.iter().any(|m| m.target == "/home/riptide/.composer" && m.read_only));
    }

    #[test]
    fn driver_contributes_mounts_env_and_ports() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            r#"
name = "shop"
[app.services.db]
image = "mariadb"
roles = ["db"]
driver = { name = "mysql" }
additional_ports = [{ title = "mysql", container = 3306, host = 13306 }]
environment = { DB_DRIVER = "overridden" }
"#,
        );
        let db = &cfg.project.app.services["db"];
        let driver = MockDriver::new("mysql");

        let ports = effective_ports(db, Some(&driver));
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].host, Some(13306));

        let spec = service_spec(&cfg.project, db, &OFF, Some(&driver), &BTreeMap::new(), None);
        assert_eq!(spec.environment["DB_DRIVER"], "mysql");
        assert!(spec
            .mounts
            .iter()
            .any(|m| m.source == MountSource::Named("mysql-db-data".to_owned())));
    }

    #[test]
    fn image_commands_default_to_src() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            r#"
name = "shop"
[app.commands.npm]
image = "node"
command = "npm"
working_directory = "frontend"
"#,
        );
        let npm = &cfg.project.app.commands["npm"];
        let spec = command_spec(&cfg.project, "npm", &npm.kind, &OFF).unwrap();
        assert_eq!(spec.unit, UnitId::command("shop", "npm"));
        assert_eq!(spec.working_directory.as_deref(), Some("/src/frontend"));
        assert_eq!(spec.host_path_for("/src/a"), Some(dir.path().join("a")));
    }

    #[test]
    fn config_files_are_rendered_and_mounted_read_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("templates")).unwrap();
        fs::write(
            dir.path().join("templates/nginx.conf"),
            "server_name ${domain};\nroot $project_dir;\n",
        )
        .unwrap();
        let cfg = config(
            dir.path(),
            r#"
name = "shop"
[app.services.www]
image = "nginx"
port = 80
roles = ["main"]
config = { "site.conf" = { from = "templates/nginx.conf", to = "/etc/nginx/conf.d/site.conf" } }
"#,
        );
        let www = &cfg.project.app.services["www"];
        prepare_host(&cfg.project, www, &OFF).unwrap();

        let host = dir.path().join("_riptide/processed_config/www/site-conf");
        assert_eq!(cfg.project.config_file(www, "site.conf"), Some(host.clone()));
        assert_eq!(
            fs::read_to_string(&host).unwrap(),
            format!("server_name shop.riptide.local;\nroot {};\n", dir.path().display())
        );

        let spec = service_spec(&cfg.project, www, &OFF, None, &BTreeMap::new(), None);
        let mount = spec
            .mounts
            .iter()
            .find(|m| m.target == "/etc/nginx/conf.d/site.conf")
            .unwrap();
        assert_eq!(mount.source, MountSource::HostPath(host));
        assert!(mount.read_only);
    }

    #[test]
    fn config_files_below_src_are_written_into_the_source_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("env.dist"), "APP_NAME=$project_name\n").unwrap();
        let cfg = config(
            dir.path(),
            r#"
name = "shop"
[app.services.php]
image = "php"
roles = ["src"]
config = { env = { from = "env.dist", to = "app/.env" } }
"#,
        );
        let php = &cfg.project.app.services["php"];
        prepare_host(&cfg.project, php, &OFF).unwrap();

        let written = dir.path().join("app/.env");
        assert_eq!(fs::read_to_string(&written).unwrap(), "APP_NAME=shop\n");
        let notice = fs::read_to_string(dir.path().join("app/.env.riptide_info.txt")).unwrap();
        assert!(notice.contains("env.dist"));
        assert!(!dir.path().join("_riptide/processed_config").exists());

        let spec = service_spec(&cfg.project, php, &OFF, None, &BTreeMap::new(), None);
        assert!(spec.mounts.iter().all(|m| m.target != "/src/app/.env"));
        assert_eq!(spec.host_path_for("/src/app/.env"), Some(written));
    }

    #[test]
    fn inside_rejects_escapes() {
        let root = Path::new("/work/shop");
        assert!(inside(root, Path::new("/work/shop/dump.sql")));
        assert!(inside(root, Path::new("data/dump.sql")));
        assert!(!inside(root, Path::new("/work/shop/../other/x")));
        assert!(!inside(root, Path::new("../../etc/passwd")));
        assert!(!inside(root, Path::new("/work/shopping/x")));
    }
}
