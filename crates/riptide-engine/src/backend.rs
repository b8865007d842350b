//! The contract every container backend implements.

use crate::deadline::Deadline;
use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Service,
    Command,
}

/// Stable identity of a service or command instance across processes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId {
    pub project: String,
    pub kind: UnitKind,
    pub name: String,
}

impl UnitId {
    pub fn service(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            kind: UnitKind::Service,
            name: name.into(),
        }
    }

    pub fn command(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            kind: UnitKind::Command,
            name: name.into(),
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            UnitKind::Service => "service",
            UnitKind::Command => "command",
        };
        write!(f, "{}/{kind}/{}", self.project, self.name)
    }
}

/// Engine-issued reference to a started unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub id: String,
    pub unit: UnitId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Error(detail) => write!(f, "error: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountSource {
    HostPath(PathBuf),
    /// Engine-managed named volume.
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
    /// Whether changes must be visible on the host immediately. Backends on
    /// virtualized filesystems may relax consistency when false.
    pub sync: bool,
}

/// What a captured log file receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Output of a command the backend keeps running inside the unit.
    Command(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStream {
    pub source: LogSource,
    pub file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container: u16,
    pub host: u16,
}

/// Everything a backend needs to bring a unit up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub unit: UnitId,
    pub image: String,
    pub command: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub working_directory: Option<String>,
    pub mounts: Vec<Mount>,
    /// Port the proxy forwards to; reachable through [`ContainerEngine::address`].
    pub exposed_port: Option<u16>,
    /// Published host ports.
    pub ports: Vec<PortBinding>,
    pub run_as_root: bool,
    /// Create a user matching the host uid/gid inside the container.
    pub create_user: bool,
    pub labels: BTreeMap<String, String>,
    pub logs: Vec<LogStream>,
    pub hostname: Option<String>,
    pub full_memlock: bool,
    pub host_network: bool,
}

impl UnitSpec {
    pub fn new(unit: UnitId, image: impl Into<String>) -> Self {
        Self {
            unit,
            image: image.into(),
            command: None,
            environment: BTreeMap::new(),
            working_directory: None,
            mounts: Vec::new(),
            exposed_port: None,
            ports: Vec::new(),
            run_as_root: false,
            create_user: true,
            labels: BTreeMap::new(),
            logs: Vec::new(),
            hostname: None,
            full_memlock: false,
            host_network: false,
        }
    }

    /// Host location backing `container_path`, when it falls inside a
    /// host-path mount.
    pub fn host_path_for(&self, container_path: &str) -> Option<PathBuf> {
        self.mounts
            .iter()
            .filter_map(|m| match &m.source {
                MountSource::HostPath(host) => {
                    let rest = Path::new(container_path).strip_prefix(&m.target).ok()?;
                    Some((m.target.len(), host.join(rest)))
                }
                MountSource::Named(_) => None,
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, path)| path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExitResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyDirection {
    IntoUnit,
    OutOfUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    ContainerRuntime,
    Cluster,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCapabilities {
    pub kind: BackendKind,
    /// Host files reach containers through a VM or network filesystem layer.
    pub virtualizes_filesystem: bool,
}

/// A pluggable container backend.
///
/// Every blocking call takes a [`Deadline`]. Backends report their own
/// failures as [`EngineError::Backend`]; callers wrap calls with
/// [`call_with_deadline`](crate::call_with_deadline) to turn a backend that
/// never answers into [`EngineError::Timeout`].
pub trait ContainerEngine: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> EngineCapabilities;

    /// Bring the unit up. Starting a running unit returns its existing handle
    /// without creating anything.
    fn start(&self, spec: &UnitSpec, deadline: Deadline) -> Result<Handle, EngineError>;

    /// Take the unit down. Stopping a stopped unit succeeds.
    fn stop(&self, handle: &Handle, deadline: Deadline) -> Result<(), EngineError>;

    /// Best-known state; never blocks on the backend.
    fn status(&self, handle: &Handle) -> UnitStatus;

    fn exec(
        &self,
        handle: &Handle,
        command: &str,
        environment: &BTreeMap<String, String>,
        deadline: Deadline,
    ) -> Result<ExitResult, EngineError>;

    /// Run `command` in a throwaway container built from `spec`.
    fn run_once(
        &self,
        spec: &UnitSpec,
        command: &str,
        deadline: Deadline,
    ) -> Result<ExitResult, EngineError>;

    fn copy_path(
        &self,
        handle: &Handle,
        host: &Path,
        container: &str,
        direction: CopyDirection,
        deadline: Deadline,
    ) -> Result<(), EngineError>;

    fn remove_path(&self, handle: &Handle, path: &str, deadline: Deadline)
        -> Result<(), EngineError>;

    /// Find a unit started earlier, possibly by another process.
    fn lookup(&self, _unit: &UnitId) -> Option<Handle> {
        None
    }

    /// Where a container port of a running unit is reachable from the host.
    fn address(&self, _handle: &Handle, port: u16) -> Option<SocketAddr> {
        Some(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    /// Identifying labels the backend attached to the unit.
    fn labels(&self, _handle: &Handle) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Engines available to this process, by name.
#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn ContainerEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: Arc<dyn ContainerEngine>) {
        self.engines.insert(engine.name().to_owned(), engine);
    }

    pub fn select(&self, name: &str) -> Result<Arc<dyn ContainerEngine>, EngineError> {
        self.engines
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Unavailable(name.to_owned()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.engines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
