//! Engine boundary for Riptide.
//!
//! This crate holds everything the orchestrator talks to outside its own
//! process: the pluggable [`ContainerEngine`] trait and its registry, the
//! [`HostIntegration`] facade for proxy routes and hosts-file entries, the
//! [`DatabaseDriver`] plugin boundary, deadline helpers that turn a silent
//! backend into a timeout, and the performance heuristics that resolve
//! `auto` flags against the host platform and backend capabilities.
//! [`mock`] provides in-memory implementations used throughout the tests.

pub mod backend;
pub mod deadline;
pub mod driver;
pub mod host;
pub mod mock;
pub mod performance;

pub use backend::{
    BackendKind, ContainerEngine, CopyDirection, EngineCapabilities, EngineRegistry, ExitResult,
    Handle, LogSource, LogStream, Mount, MountSource, PortBinding, UnitId, UnitKind, UnitSpec,
    UnitStatus,
};
pub use deadline::{call_with_deadline, poll_until, tcp_reachable, Deadline};
pub use driver::{DatabaseDriver, DriverError, DriverRegistry};
pub use host::{HostError, HostIntegration, NoopHost};
pub use performance::{
    resolve_flag, resolve_performance, HostPlatform, PerfOption, PlatformMatch, PolicyRule,
    PolicyTable, ResolvedPerformance,
};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine '{0}' is not available")]
    Unavailable(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
    #[error("unit '{0}' is not running")]
    NotRunning(String),
    #[error("operation not supported by this engine: {0}")]
    Unsupported(String),
}
