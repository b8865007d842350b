//! Host-side integration: reverse-proxy routes and hosts-file entries.
//!
//! Implementations must tolerate repeated calls; unregistering something
//! that was never registered succeeds.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("proxy route for {project}/{service}: {message}")]
    Route {
        project: String,
        service: String,
        message: String,
    },
    #[error("hosts entry '{hostname}': {message}")]
    HostsFile { hostname: String, message: String },
    #[error("host I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait HostIntegration: Send + Sync {
    /// Route `domain` to `target`, a `host:port` reachable from the proxy.
    fn register_route(
        &self,
        project: &str,
        service: &str,
        domain: &str,
        target: &str,
    ) -> Result<(), HostError>;

    fn unregister_route(&self, project: &str, service: &str) -> Result<(), HostError>;

    fn ensure_host_entry(&self, hostname: &str) -> Result<(), HostError>;

    fn remove_host_entry(&self, hostname: &str) -> Result<(), HostError>;
}

/// Integration for hosts without a proxy or a writable hosts file.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl HostIntegration for NoopHost {
    fn register_route(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), HostError> {
        Ok(())
    }

    fn unregister_route(&self, _: &str, _: &str) -> Result<(), HostError> {
        Ok(())
    }

    fn ensure_host_entry(&self, _: &str) -> Result<(), HostError> {
        Ok(())
    }

    fn remove_host_entry(&self, _: &str) -> Result<(), HostError> {
        Ok(())
    }
}
