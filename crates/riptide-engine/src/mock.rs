//! In-memory engine, host integration and database driver for tests.
//!
//! [`MockEngine`] keeps units in a map and opens a real loopback listener for
//! each exposed port, so readiness checks behave as they would against a
//! container. Commands run through a tiny interpreter that understands
//! `true`, `false`, `exit N`, `echo TEXT`, `touch PATH` and
//! `echo TEXT > PATH`, chained with `&&`; paths are mapped to the host
//! through the unit's mounts.

use crate::backend::{
    BackendKind, ContainerEngine, CopyDirection, EngineCapabilities, ExitResult, Handle, Mount,
    MountSource, UnitId, UnitSpec, UnitStatus,
};
use crate::deadline::Deadline;
use crate::driver::{DatabaseDriver, DriverError};
use crate::host::{HostError, HostIntegration};
use crate::EngineError;
use riptide_schema::{AdditionalPort, Service};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

struct MockUnit {
    handle: Handle,
    spec: UnitSpec,
    status: UnitStatus,
    listeners: Vec<TcpListener>,
    addresses: BTreeMap<u16, SocketAddr>,
}

#[derive(Default)]
struct Knobs {
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    silent: HashSet<String>,
}

#[derive(Default)]
pub struct MockEngine {
    units: Mutex<HashMap<UnitId, MockUnit>>,
    knobs: Mutex<Knobs>,
    executed: Mutex<Vec<(UnitId, String)>>,
    next_id: AtomicU64,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    virtualizes_filesystem: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, EngineError> {
    mutex
        .lock()
        .map_err(|e| EngineError::Backend(format!("mutex poisoned: {e}")))
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine that reports host files crossing a virtualization layer.
    pub fn virtualized() -> Self {
        Self {
            virtualizes_filesystem: true,
            ..Self::default()
        }
    }

    /// Make every start of units named `name` fail.
    pub fn fail_start(&self, name: &str) {
        if let Ok(mut knobs) = self.knobs.lock() {
            knobs.failing.insert(name.to_owned());
        }
    }

    /// Make starts of units named `name` block for `delay` first.
    pub fn delay_start(&self, name: &str, delay: Duration) {
        if let Ok(mut knobs) = self.knobs.lock() {
            knobs.delays.insert(name.to_owned(), delay);
        }
    }

    /// Start units named `name` without listening on their exposed port.
    pub fn never_listen(&self, name: &str) {
        if let Ok(mut knobs) = self.knobs.lock() {
            knobs.silent.insert(name.to_owned());
        }
    }

    /// Force the state of a unit, e.g. to simulate a crash.
    pub fn set_status(&self, unit: &UnitId, status: UnitStatus) {
        if let Ok(mut units) = self.units.lock() {
            if let Some(u) = units.get_mut(unit) {
                if status != UnitStatus::Running {
                    u.listeners.clear();
                }
                u.status = status;
            }
        }
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Every command run through `exec` or `run_once`, in order.
    pub fn executed(&self) -> Vec<(UnitId, String)> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn running(&self) -> Vec<UnitId> {
        let mut ids: Vec<UnitId> = self
            .units
            .lock()
            .map(|units| {
                units
                    .values()
                    .filter(|u| u.status == UnitStatus::Running)
                    .map(|u| u.handle.unit.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// The spec a unit was last started with.
    pub fn spec_of(&self, unit: &UnitId) -> Option<UnitSpec> {
        self.units
            .lock()
            .ok()
            .and_then(|units| units.get(unit).map(|u| u.spec.clone()))
    }

    fn record(&self, unit: &UnitId, command: &str) -> Result<(), EngineError> {
        lock(&self.executed)?.push((unit.clone(), command.to_owned()));
        Ok(())
    }

    fn running_spec(&self, handle: &Handle) -> Result<UnitSpec, EngineError> {
        let units = lock(&self.units)?;
        match units.get(&handle.unit) {
            Some(u) if u.status == UnitStatus::Running && u.handle.id == handle.id => {
                Ok(u.spec.clone())
            }
            _ => Err(EngineError::NotRunning(handle.unit.to_string())),
        }
    }
}

impl ContainerEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            kind: BackendKind::Mock,
            virtualizes_filesystem: self.virtualizes_filesystem,
        }
    }

    fn start(&self, spec: &UnitSpec, _deadline: Deadline) -> Result<Handle, EngineError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        {
            let units = lock(&self.units)?;
            if let Some(u) = units.get(&spec.unit) {
                if u.status == UnitStatus::Running {
                    return Ok(u.handle.clone());
                }
            }
        }

        let (fails, delay, silent) = {
            let knobs = lock(&self.knobs)?;
            let name = &spec.unit.name;
            (
                knobs.failing.contains(name),
                knobs.delays.get(name).copied(),
                knobs.silent.contains(name),
            )
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if fails {
            return Err(EngineError::Backend(format!(
                "container for {} exited immediately",
                spec.unit
            )));
        }

        let mut listeners = Vec::new();
        let mut addresses = BTreeMap::new();
        if let Some(port) = spec.exposed_port.filter(|_| !silent) {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            addresses.insert(port, listener.local_addr()?);
            listeners.push(listener);
        }

        let handle = Handle {
            id: format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            unit: spec.unit.clone(),
        };
        lock(&self.units)?.insert(
            spec.unit.clone(),
            MockUnit {
                handle: handle.clone(),
                spec: spec.clone(),
                status: UnitStatus::Running,
                listeners,
                addresses,
            },
        );
        Ok(handle)
    }

    fn stop(&self, handle: &Handle, _deadline: Deadline) -> Result<(), EngineError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut units = lock(&self.units)?;
        if let Some(u) = units.get_mut(&handle.unit) {
            u.listeners.clear();
            u.addresses.clear();
            u.status = UnitStatus::Stopped;
        }
        Ok(())
    }

    fn status(&self, handle: &Handle) -> UnitStatus {
        self.units
            .lock()
            .ok()
            .and_then(|units| units.get(&handle.unit).map(|u| u.status.clone()))
            .unwrap_or(UnitStatus::Stopped)
    }

    fn exec(
        &self,
        handle: &Handle,
        command: &str,
        _environment: &BTreeMap<String, String>,
        _deadline: Deadline,
    ) -> Result<ExitResult, EngineError> {
        let spec = self.running_spec(handle)?;
        self.record(&handle.unit, command)?;
        Ok(interpret(&spec, command))
    }

    fn run_once(
        &self,
        spec: &UnitSpec,
        command: &str,
        _deadline: Deadline,
    ) -> Result<ExitResult, EngineError> {
        self.record(&spec.unit, command)?;
        Ok(interpret(spec, command))
    }

    fn copy_path(
        &self,
        handle: &Handle,
        host: &Path,
        container: &str,
        direction: CopyDirection,
        _deadline: Deadline,
    ) -> Result<(), EngineError> {
        let spec = self.running_spec(handle)?;
        let inside = spec
            .host_path_for(container)
            .ok_or_else(|| EngineError::Backend(format!("{container} is not mounted")))?;
        let (from, to) = match direction {
            CopyDirection::IntoUnit => (host.to_path_buf(), inside),
            CopyDirection::OutOfUnit => (inside, host.to_path_buf()),
        };
        copy_recursive(&from, &to)?;
        Ok(())
    }

    fn remove_path(
        &self,
        handle: &Handle,
        path: &str,
        _deadline: Deadline,
    ) -> Result<(), EngineError> {
        let spec = self.running_spec(handle)?;
        let Some(target) = spec.host_path_for(path) else {
            return Err(EngineError::Backend(format!("{path} is not mounted")));
        };
        if target.is_dir() {
            fs::remove_dir_all(&target)?;
        } else if target.exists() {
            fs::remove_file(&target)?;
        }
        Ok(())
    }

    fn lookup(&self, unit: &UnitId) -> Option<Handle> {
        let units = self.units.lock().ok()?;
        units
            .get(unit)
            .filter(|u| u.status == UnitStatus::Running)
            .map(|u| u.handle.clone())
    }

    fn address(&self, handle: &Handle, port: u16) -> Option<SocketAddr> {
        let units = self.units.lock().ok()?;
        units.get(&handle.unit)?.addresses.get(&port).copied()
    }

    fn labels(&self, handle: &Handle) -> BTreeMap<String, String> {
        self.units
            .lock()
            .ok()
            .and_then(|units| units.get(&handle.unit).map(|u| u.spec.labels.clone()))
            .unwrap_or_default()
    }
}

fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to).map(|_| ())
    }
}

fn interpret(spec: &UnitSpec, command: &str) -> ExitResult {
    let mut result = ExitResult {
        code: 0,
        stdout: String::new(),
        stderr: String::new(),
    };
    for step in command.split("&&").map(str::trim) {
        result.code = match run_step(spec, step, &mut result.stdout) {
            Ok(code) => code,
            Err(message) => {
                result.stderr.push_str(&message);
                result.stderr.push('\n');
                1
            }
        };
        if result.code != 0 {
            break;
        }
    }
    result
}

fn run_step(spec: &UnitSpec, step: &str, stdout: &mut String) -> Result<i32, String> {
    let (word, rest) = step.split_once(' ').unwrap_or((step, ""));
    let rest = rest.trim();
    match word {
        "true" | "" => Ok(0),
        "false" => Ok(1),
        "exit" => rest.parse().map_err(|_| format!("exit: bad code '{rest}'")),
        "touch" => {
            write_mapped(spec, rest, "")?;
            Ok(0)
        }
        "echo" => {
            if let Some((text, path)) = rest.split_once('>') {
                write_mapped(spec, path.trim(), &format!("{}\n", text.trim()))?;
            } else {
                stdout.push_str(rest);
                stdout.push('\n');
            }
            Ok(0)
        }
        _ => {
            stdout.push_str(&format!("mock-exec: {step}\n"));
            Ok(0)
        }
    }
}

fn write_mapped(spec: &UnitSpec, container_path: &str, content: &str) -> Result<(), String> {
    let target = spec
        .host_path_for(container_path)
        .ok_or_else(|| format!("{container_path}: no such file or directory"))?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("{container_path}: {e}"))?;
    }
    fs::write(&target, content).map_err(|e| format!("{container_path}: {e}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    RegisterRoute {
        project: String,
        service: String,
        domain: String,
        target: String,
    },
    UnregisterRoute {
        project: String,
        service: String,
    },
    EnsureHostEntry(String),
    RemoveHostEntry(String),
}

/// Host integration that records every call.
#[derive(Default)]
pub struct RecordingHost {
    calls: Mutex<Vec<HostCall>>,
    fail_routes: bool,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host whose route registration always fails.
    pub fn failing_routes() -> Self {
        Self {
            fail_routes: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, predicate: impl Fn(&HostCall) -> bool) -> usize {
        self.calls().iter().filter(|c| predicate(c)).count()
    }

    fn push(&self, call: HostCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl HostIntegration for RecordingHost {
    fn register_route(
        &self,
        project: &str,
        service: &str,
        domain: &str,
        target: &str,
    ) -> Result<(), HostError> {
        if self.fail_routes {
            return Err(HostError::Route {
                project: project.to_owned(),
                service: service.to_owned(),
                message: "proxy refused the route".to_owned(),
            });
        }
        self.push(HostCall::RegisterRoute {
            project: project.to_owned(),
            service: service.to_owned(),
            domain: domain.to_owned(),
            target: target.to_owned(),
        });
        Ok(())
    }

    fn unregister_route(&self, project: &str, service: &str) -> Result<(), HostError> {
        self.push(HostCall::UnregisterRoute {
            project: project.to_owned(),
            service: service.to_owned(),
        });
        Ok(())
    }

    fn ensure_host_entry(&self, hostname: &str) -> Result<(), HostError> {
        self.push(HostCall::EnsureHostEntry(hostname.to_owned()));
        Ok(())
    }

    fn remove_host_entry(&self, hostname: &str) -> Result<(), HostError> {
        self.push(HostCall::RemoveHostEntry(hostname.to_owned()));
        Ok(())
    }
}

/// Driver that keeps data in a named volume, publishes 3306 and rejects
/// `fail = true`.
pub struct MockDriver {
    name: String,
}

impl MockDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl DatabaseDriver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate_service(&self, service: &Service) -> Result<(), DriverError> {
        let failing = service
            .driver
            .as_ref()
            .and_then(|d| d.config.get("fail"))
            .and_then(toml::Value::as_bool)
            .unwrap_or(false);
        if failing {
            return Err(DriverError::new(&self.name, "configuration rejected"));
        }
        Ok(())
    }

    fn collect_volumes(&self, service: &Service) -> Vec<Mount> {
        vec![Mount {
            source: MountSource::Named(format!("{}-{}-data", self.name, service.name)),
            target: format!("/var/lib/{}", self.name),
            read_only: false,
            sync: false,
        }]
    }

    fn collect_additional_ports(&self, _service: &Service) -> Vec<AdditionalPort> {
        vec![AdditionalPort {
            title: format!("{} access port", self.name),
            container: 3306,
            host: None,
            host_start: 30_000,
        }]
    }

    fn collect_environment(&self, service: &Service) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("DB_DRIVER".to_owned(), self.name.clone()),
            ("DB_HOST".to_owned(), service.domain.clone()),
        ])
    }
}
