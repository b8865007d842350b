//! Configuration documents and resolution for Riptide.
//!
//! This crate turns layered TOML documents (built-in defaults, the user's
//! `config.toml`, a project's `riptide.toml` and `riptide.local.toml`, plus
//! repository entries pulled in through `extends`) into one validated,
//! immutable [`ResolvedConfig`]. Merging is typed and total per field kind,
//! `$name` / `${name}` references are substituted against scoped variable
//! tables, and every problem is collected into a single [`ValidationReport`].

pub mod document;
pub mod merge;
pub mod report;
pub mod repository;
pub mod resolve;
pub mod resolved;
pub mod types;
pub mod variables;

pub use document::{parse_document, ProjectDoc, ServiceDoc, SystemDoc};
pub use merge::Merge;
pub use report::{IssueKind, ValidationIssue, ValidationReport};
pub use repository::Repositories;
pub use resolve::{join_normalized, resolve, HostContext, Layer, ResolveInput};
pub use resolved::{
    service_domain, AdditionalPort, App, Command, CommandKind, ConfigFile, DriverConfig, Logging,
    PerfFlag, PerformanceFlags, Project, ProxyConfig, ResolvedConfig, Role, Service,
    ServiceCommand, SystemConfig, Timeouts, Volume, VolumeKind, VolumeMode, CONFIG_NOTICE_SUFFIX,
    CONTAINER_HOME_PATH, CONTAINER_SRC_PATH, HOST_ADDRESS, RESERVED_PROJECT_NAMES, STATE_DIR,
};
pub use types::{CommandName, Fingerprint, ProjectName, ServiceName};
pub use variables::{Scope, SubstitutionError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid configuration: {0}")]
    Validation(ValidationReport),
    #[error("command alias cycle: {}", chain.join(" -> "))]
    AliasCycle { chain: Vec<String> },
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
}

impl SchemaError {
    pub fn report(&self) -> Option<&ValidationReport> {
        match self {
            Self::Validation(report) => Some(report),
            _ => None,
        }
    }
}
