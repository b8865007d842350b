//! Tri-state performance flags resolved against host and backend.
//!
//! `auto` is decided by a [`PolicyTable`]: ordered rows matched against the
//! option, host platform, backend kind and filesystem virtualization. The
//! first matching row decides; no match means off.

use crate::backend::{BackendKind, EngineCapabilities};
use riptide_schema::{PerfFlag, PerformanceFlags};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPlatform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerfOption {
    /// Back declared volumes with named engine volumes instead of host binds.
    DontSyncNamedVolumesWithHost,
    /// Keep `unimportant_paths` of the source tree out of host sync.
    DontSyncUnimportantSrc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformMatch {
    Any,
    Is(HostPlatform),
    Not(HostPlatform),
}

impl PlatformMatch {
    fn matches(self, platform: HostPlatform) -> bool {
        match self {
            Self::Any => true,
            Self::Is(p) => p == platform,
            Self::Not(p) => p != platform,
        }
    }
}

/// One row of the policy table. `None` fields match anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub option: Option<PerfOption>,
    pub platform: PlatformMatch,
    pub backend: Option<BackendKind>,
    pub virtualized_fs: Option<bool>,
    pub enable: bool,
}

impl PolicyRule {
    fn matches(
        &self,
        option: PerfOption,
        platform: HostPlatform,
        caps: &EngineCapabilities,
    ) -> bool {
        self.option.is_none_or_eq(option)
            && self.platform.matches(platform)
            && self.backend.is_none_or_eq(caps.kind)
            && self.virtualized_fs.is_none_or_eq(caps.virtualizes_filesystem)
    }
}

trait WildcardEq<T> {
    fn is_none_or_eq(&self, value: T) -> bool;
}

impl<T: PartialEq + Copy> WildcardEq<T> for Option<T> {
    fn is_none_or_eq(&self, value: T) -> bool {
        match self {
            None => true,
            Some(v) => *v == value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTable {
    rules: Vec<PolicyRule>,
}

impl Default for PolicyTable {
    /// Volume-sync mitigations only pay off when host files cross a
    /// virtualization boundary, which on Linux they do not.
    fn default() -> Self {
        Self {
            rules: vec![PolicyRule {
                option: None,
                platform: PlatformMatch::Not(HostPlatform::Linux),
                backend: None,
                virtualized_fs: Some(true),
                enable: true,
            }],
        }
    }
}

impl PolicyTable {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Insert a row ahead of the existing ones.
    #[must_use]
    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn decide(
        &self,
        option: PerfOption,
        platform: HostPlatform,
        caps: &EngineCapabilities,
    ) -> bool {
        self.rules
            .iter()
            .find(|rule| rule.matches(option, platform, caps))
            .is_some_and(|rule| rule.enable)
    }
}

pub fn resolve_flag(
    option: PerfOption,
    flag: PerfFlag,
    platform: HostPlatform,
    caps: &EngineCapabilities,
    table: &PolicyTable,
) -> bool {
    match flag {
        PerfFlag::Enabled => true,
        PerfFlag::Disabled => false,
        PerfFlag::Auto => table.decide(option, platform, caps),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPerformance {
    pub dont_sync_named_volumes_with_host: bool,
    pub dont_sync_unimportant_src: bool,
}

pub fn resolve_performance(
    flags: &PerformanceFlags,
    platform: HostPlatform,
    caps: &EngineCapabilities,
    table: &PolicyTable,
) -> ResolvedPerformance {
    let resolved = ResolvedPerformance {
        dont_sync_named_volumes_with_host: resolve_flag(
            PerfOption::DontSyncNamedVolumesWithHost,
            flags.dont_sync_named_volumes_with_host,
            platform,
            caps,
            table,
        ),
        dont_sync_unimportant_src: resolve_flag(
            PerfOption::DontSyncUnimportantSrc,
            flags.dont_sync_unimportant_src,
            platform,
            caps,
            table,
        ),
    };
    debug!("performance flags on {platform:?} with {:?}: {resolved:?}", caps.kind);
    resolved
}
