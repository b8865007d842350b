//! Host-port registry for additional ports.
//!
//! `ports.json` records, per project and service, which host port each
//! container port was given. A recorded mapping is handed out again on the
//! next start so host-side ports stay stable across restarts.

use crate::layout::ConfigLayout;
use crate::lock::StoreLock;
use crate::{write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::TcpListener;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Tells whether a host port can currently be bound.
pub trait PortCheck: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Checks by binding a listener on all interfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPortCheck;

impl PortCheck for TcpPortCheck {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

/// project -> service -> container port -> host port
pub type PortRequests = BTreeMap<String, BTreeMap<String, BTreeMap<u16, u16>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBook {
    /// Ports never handed out, e.g. the proxy's own ports.
    #[serde(default)]
    pub reserved: BTreeSet<u16>,
    #[serde(default)]
    pub requests: PortRequests,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl PortBook {
    pub fn recorded(&self, project: &str, service: &str, container: u16) -> Option<u16> {
        self.requests
            .get(project)
            .and_then(|services| services.get(service))
            .and_then(|ports| ports.get(&container))
            .copied()
    }

    /// Every host port that is reserved or recorded for any service.
    pub fn taken(&self) -> BTreeSet<u16> {
        let mut taken = self.reserved.clone();
        for services in self.requests.values() {
            for ports in services.values() {
                taken.extend(ports.values().copied());
            }
        }
        taken
    }
}

pub struct PortRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl PortRegistry {
    pub fn new(layout: &ConfigLayout) -> Self {
        Self {
            path: layout.ports_file(),
            lock_path: layout.root().join("ports.lock"),
        }
    }

    /// Current book; a missing file is an empty book, an unreadable one is
    /// discarded since every entry can be recomputed.
    pub fn load(&self) -> Result<PortBook, StoreError> {
        if !self.path.exists() {
            return Ok(PortBook::default());
        }
        let content = fs::read_to_string(&self.path)?;
        match serde_json::from_str(&content) {
            Ok(book) => Ok(book),
            Err(e) => {
                warn!("discarding unreadable port registry {}: {e}", self.path.display());
                Ok(PortBook::default())
            }
        }
    }

    fn save(&self, book: &mut PortBook) -> Result<(), StoreError> {
        book.updated_at = Some(chrono::Utc::now().to_rfc3339());
        let content = serde_json::to_string_pretty(book)?;
        write_atomic(&self.path, content.as_bytes())
    }

    pub fn recorded(
        &self,
        project: &str,
        service: &str,
        container: u16,
    ) -> Result<Option<u16>, StoreError> {
        Ok(self.load()?.recorded(project, service, container))
    }

    /// Host port for `container` of `project`/`service`.
    ///
    /// Returns the recorded port if there is one. Otherwise scans upward
    /// from `start` for a port that is neither taken in the book nor bound on
    /// the host, records it and returns it.
    pub fn allocate(
        &self,
        project: &str,
        service: &str,
        container: u16,
        start: u16,
        check: &dyn PortCheck,
    ) -> Result<u16, StoreError> {
        let _lock = StoreLock::acquire(&self.lock_path)?;
        let mut book = self.load()?;

        if let Some(host) = book.recorded(project, service, container) {
            debug!("{project}/{service}: reusing host port {host} for {container}");
            return Ok(host);
        }

        let taken = book.taken();
        let host = (start.max(1)..=u16::MAX)
            .find(|port| !taken.contains(port) && check.is_free(*port))
            .ok_or(StoreError::PortsExhausted { start })?;

        book.requests
            .entry(project.to_owned())
            .or_default()
            .entry(service.to_owned())
            .or_default()
            .insert(container, host);
        self.save(&mut book)?;
        info!("{project}/{service}: container port {container} mapped to host port {host}");
        Ok(host)
    }

    pub fn reserve(&self, port: u16) -> Result<(), StoreError> {
        let _lock = StoreLock::acquire(&self.lock_path)?;
        let mut book = self.load()?;
        if book.reserved.insert(port) {
            self.save(&mut book)?;
        }
        Ok(())
    }

    /// Forget all mappings of a project, e.g. after it was removed.
    pub fn release_project(&self, project: &str) -> Result<(), StoreError> {
        let _lock = StoreLock::acquire(&self.lock_path)?;
        let mut book = self.load()?;
        if book.requests.remove(project).is_some() {
            self.save(&mut book)?;
        }
        Ok(())
    }

    /// Forget the mappings of a single service.
    pub fn release_service(&self, project: &str, service: &str) -> Result<(), StoreError> {
        let _lock = StoreLock::acquire(&self.lock_path)?;
        let mut book = self.load()?;
        let removed = match book.requests.get_mut(project) {
            Some(services) => {
                let removed = services.remove(service).is_some();
                if services.is_empty() {
                    book.requests.remove(project);
                }
                removed
            }
            None => false,
        };
        if removed {
            self.save(&mut book)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Treats a fixed set of ports as bound by someone else.
    struct BusyPorts(Mutex<BTreeSet<u16>>);

    impl BusyPorts {
        fn new(ports: &[u16]) -> Self {
            Self(Mutex::new(ports.iter().copied().collect()))
        }
    }

    impl PortCheck for BusyPorts {
        fn is_free(&self, port: u16) -> bool {
            !self.0.lock().unwrap().contains(&port)
        }
    }

    fn registry(dir: &std::path::Path) -> PortRegistry {
        PortRegistry::new(&ConfigLayout::new(dir))
    }

    #[test]
    fn two_requests_get_distinct_free_ports() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let check = BusyPorts::new(&[30000]);
        let a = reg.allocate("shop", "www", 9000, 30000, &check).unwrap();
        let b = reg.allocate("shop", "www", 9001, 30000, &check).unwrap();
        assert_eq!(a, 30001);
        assert_eq!(b, 30002);
        assert_ne!(a, b);
    }

    #[test]
    fn recorded_mapping_survives_a_new_registry() {
        let dir = tempfile::tempdir().unwrap();
        let check = BusyPorts::new(&[]);
        let first = registry(dir.path())
            .allocate("shop", "www", 9000, 40000, &check)
            .unwrap();

        let again = registry(dir.path())
            .allocate("shop", "www", 9000, 40000, &BusyPorts::new(&[first]))
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(
            registry(dir.path()).recorded("shop", "www", 9000).unwrap(),
            Some(first)
        );
    }

    #[test]
    fn reserved_ports_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.reserve(50000).unwrap();
        let port = reg
            .allocate("shop", "db", 3306, 50000, &BusyPorts::new(&[]))
            .unwrap();
        assert_eq!(port, 50001);
    }

    #[test]
    fn release_forgets_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let check = BusyPorts::new(&[]);
        reg.allocate("shop", "www", 9000, 41000, &check).unwrap();
        reg.allocate("shop", "db", 3306, 41000, &check).unwrap();
        reg.release_service("shop", "www").unwrap();
        assert_eq!(reg.recorded("shop", "www", 9000).unwrap(), None);
        assert!(reg.recorded("shop", "db", 3306).unwrap().is_some());
        reg.release_project("shop").unwrap();
        assert!(reg.load().unwrap().requests.is_empty());
    }

    #[test]
    fn exhaustion_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let check = BusyPorts::new(&[65534, 65535]);
        assert!(matches!(
            reg.allocate("shop", "www", 80, 65534, &check),
            Err(StoreError::PortsExhausted { start: 65534 })
        ));
    }

    #[test]
    fn corrupt_file_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        fs::write(dir.path().join("ports.json"), "{not json").unwrap();
        assert_eq!(reg.load().unwrap(), PortBook::default());
    }
}
