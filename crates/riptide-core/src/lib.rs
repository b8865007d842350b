//! Lifecycle orchestration for Riptide projects.
//!
//! This crate ties the resolved configuration from `riptide-schema`, the
//! persisted state in `riptide-store` and a backend from `riptide-engine`
//! together into the [`Orchestrator`]: the API for starting, stopping and
//! inspecting the services of a project, running its commands and moving
//! files in and out of its units. It also provides the per-unit state
//! machine, cancellation and readiness signalling between service workers,
//! lifecycle events and the project loader that discovers and resolves
//! project files.

pub mod concurrency;
pub mod events;
pub mod lifecycle;
pub mod loader;
pub mod orchestrator;
mod plan;
pub mod report;

pub use concurrency::{CancelToken, Readiness, ReadySignals, UnitLocks};
pub use events::{ChannelSink, EventSink, JsonLinesSink, LifecycleEvent, MemorySink, NullSink};
pub use lifecycle::validate_transition;
pub use loader::{find_project_file, host_context, Loaded, ProjectLoader};
pub use orchestrator::{Orchestrator, OrchestratorSettings, StartOptions, StopOptions};
pub use report::{ProjectStatus, ServiceStatus, StartReport, StopReport, UnitFailure, UnitReport};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Schema(#[from] riptide_schema::SchemaError),
    #[error("store error: {0}")]
    Store(#[from] riptide_store::StoreError),
    #[error("engine error: {0}")]
    Engine(#[from] riptide_engine::EngineError),
    #[error("database driver error: {0}")]
    Driver(#[from] riptide_engine::DriverError),
    #[error("host integration error: {0}")]
    Host(#[from] riptide_engine::HostError),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("project '{name}' is already attached from {existing}")]
    ProjectConflict { name: String, existing: PathBuf },
    #[error("no riptide.toml found in {0} or any parent directory")]
    ProjectNotFound(PathBuf),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
