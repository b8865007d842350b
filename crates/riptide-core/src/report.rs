//! Per-unit outcomes of orchestrator operations.

use riptide_engine::{EngineError, Handle, UnitStatus};
use riptide_schema::ServiceName;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Why a single unit did not reach its target state. Failures are values
/// inside reports; one unit failing never aborts its siblings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitFailure {
    /// The backend answered with an error.
    Engine { message: String },
    /// The backend or the readiness check did not answer in time.
    Timeout { operation: String, after: Duration },
    PortConflict { port: u16 },
    Hook {
        command: String,
        code: i32,
        stderr: String,
    },
    Host { message: String },
    Driver { message: String },
    /// Host-side preparation (directories, log files, port registry) failed.
    Prepare { message: String },
    DependencyFailed { dependency: ServiceName },
    Cancelled,
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine { message } => write!(f, "engine error: {message}"),
            Self::Timeout { operation, after } => {
                write!(f, "{operation} timed out after {after:?}")
            }
            Self::PortConflict { port } => write!(f, "host port {port} is already in use"),
            Self::Hook {
                command,
                code,
                stderr,
            } => {
                write!(f, "hook '{command}' exited with {code}")?;
                if !stderr.trim().is_empty() {
                    write!(f, ": {}", stderr.trim())?;
                }
                Ok(())
            }
            Self::Host { message } => write!(f, "host integration failed: {message}"),
            Self::Driver { message } => write!(f, "database driver failed: {message}"),
            Self::Prepare { message } => write!(f, "preparation failed: {message}"),
            Self::DependencyFailed { dependency } => {
                write!(f, "dependency '{dependency}' did not become ready")
            }
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl From<EngineError> for UnitFailure {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Timeout { operation, after } => Self::Timeout { operation, after },
            other => Self::Engine {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub service: ServiceName,
    pub status: UnitStatus,
    #[serde(skip)]
    pub handle: Option<Handle>,
    pub ready: bool,
    /// Running before this operation; nothing was done to it.
    pub already_running: bool,
    pub optional: bool,
    /// Container port to host port for additional ports.
    pub ports: BTreeMap<u16, u16>,
    pub failure: Option<UnitFailure>,
}

impl UnitReport {
    pub(crate) fn failed(service: &ServiceName, optional: bool, failure: UnitFailure) -> Self {
        Self {
            service: service.clone(),
            status: UnitStatus::Error(failure.to_string()),
            handle: None,
            ready: false,
            already_running: false,
            optional,
            ports: BTreeMap::new(),
            failure: Some(failure),
        }
    }

    /// Report for a unit that was never touched because of `failure`.
    pub(crate) fn skipped(service: &ServiceName, optional: bool, failure: UnitFailure) -> Self {
        Self {
            status: UnitStatus::Stopped,
            ..Self::failed(service, optional, failure)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub project: String,
    pub units: BTreeMap<ServiceName, UnitReport>,
    pub cancelled: bool,
}

impl StartReport {
    /// Every non-optional service is running and ready.
    pub fn is_up(&self) -> bool {
        !self.cancelled
            && self
                .units
                .values()
                .filter(|u| !u.optional)
                .all(|u| u.ready && u.status == UnitStatus::Running)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ServiceName, &UnitFailure)> {
        self.units
            .iter()
            .filter_map(|(name, u)| u.failure.as_ref().map(|f| (name, f)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub project: String,
    pub stopped: Vec<ServiceName>,
    pub already_stopped: Vec<ServiceName>,
    pub failures: BTreeMap<ServiceName, UnitFailure>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub status: UnitStatus,
    /// Proxy URL, for services with a port.
    pub url: Option<String>,
    pub additional_ports: BTreeMap<u16, u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectStatus {
    pub project: String,
    pub services: BTreeMap<ServiceName, ServiceStatus>,
}

impl ProjectStatus {
    pub fn running(&self) -> usize {
        self.services
            .values()
            .filter(|s| s.status == UnitStatus::Running)
            .count()
    }
}
