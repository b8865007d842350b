use crate::concurrency::{CancelToken, Readiness, ReadySignals, UnitLocks};
use crate::events::{EventSink, LifecycleEvent, NullSink};
use crate::lifecycle::validate_transition;
use crate::plan::{self, effective_ports};
use crate::report::{ProjectStatus, ServiceStatus, StartReport, StopReport, UnitFailure, UnitReport};
use crate::CoreError;
use riptide_engine::{
    call_with_deadline, poll_until, resolve_performance, tcp_reachable, ContainerEngine,
    CopyDirection, DatabaseDriver, Deadline, DriverRegistry, EngineError, EngineRegistry,
    ExitResult, Handle, HostError, HostIntegration, HostPlatform, PolicyTable,
    ResolvedPerformance, UnitId, UnitSpec, UnitStatus,
};
use riptide_schema::{
    CommandKind, ProxyConfig, ResolvedConfig, SchemaError, Service, ServiceName, SystemConfig,
    HOST_ADDRESS,
};
use riptide_store::{ConfigLayout, PortCheck, PortRegistry, StoreError, TcpPortCheck};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Host-dependent inputs of the orchestrator.
#[derive(Clone)]
pub struct OrchestratorSettings {
    pub platform: HostPlatform,
    pub policy: PolicyTable,
    pub port_check: Arc<dyn PortCheck>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            platform: HostPlatform::current(),
            policy: PolicyTable::default(),
            port_check: Arc::new(TcpPortCheck),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Services to start; `None` means the project's default services, or
    /// all of them when it declares none. Dependencies are always included.
    pub services: Option<Vec<ServiceName>>,
    /// Named command group for services that declare several.
    pub command_group: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    /// Services to stop; `None` stops every service of the project.
    pub services: Option<Vec<ServiceName>>,
}

/// What was registered with the host for a running service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Registration {
    route: bool,
    host_entries: Vec<String>,
}

impl Registration {
    fn is_empty(&self) -> bool {
        !self.route && self.host_entries.is_empty()
    }
}

#[derive(Debug, Clone)]
struct UnitSnapshot {
    status: UnitStatus,
    handle: Option<Handle>,
    spec: Option<UnitSpec>,
    registration: Option<Registration>,
}

impl Default for UnitSnapshot {
    fn default() -> Self {
        Self {
            status: UnitStatus::Stopped,
            handle: None,
            spec: None,
            registration: None,
        }
    }
}

/// Shared state of one start operation.
struct StartContext<'a> {
    config: &'a ResolvedConfig,
    options: &'a StartOptions,
    cancel: &'a CancelToken,
    perf: ResolvedPerformance,
    signals: ReadySignals,
}

/// Publishes a worker's readiness when it finishes, including by panic, so
/// dependents never wait forever.
struct Settle<'a> {
    signals: &'a ReadySignals,
    name: &'a str,
    ready: bool,
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        let readiness = if self.ready {
            Readiness::Ready
        } else {
            Readiness::Failed
        };
        self.signals.publish(self.name, readiness);
    }
}

/// Everything a start attempt produced so far; kept on failure so the unit
/// can be cleaned up.
#[derive(Default)]
struct Progress {
    spec: Option<UnitSpec>,
    handle: Option<Handle>,
    registration: Registration,
    ports: BTreeMap<u16, u16>,
}

enum StopOutcome {
    Stopped,
    AlreadyStopped,
    Failed(UnitFailure),
}

/// Drives the lifecycle of project services against a container engine.
///
/// One orchestrator owns the status table for every unit it has touched.
/// Operations on different projects, and on different units of one project,
/// run concurrently; Start and Stop of the same unit are serialized.
pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    host: Arc<dyn HostIntegration>,
    drivers: DriverRegistry,
    ports: PortRegistry,
    events: Arc<dyn EventSink>,
    settings: OrchestratorSettings,
    table: RwLock<HashMap<UnitId, UnitSnapshot>>,
    locks: UnitLocks,
    attached: Mutex<BTreeMap<String, PathBuf>>,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        host: Arc<dyn HostIntegration>,
        layout: &ConfigLayout,
    ) -> Self {
        Self {
            engine,
            host,
            drivers: DriverRegistry::new(),
            ports: PortRegistry::new(layout),
            events: Arc::new(NullSink),
            settings: OrchestratorSettings::default(),
            table: RwLock::new(HashMap::new()),
            locks: UnitLocks::new(),
            attached: Mutex::new(BTreeMap::new()),
        }
    }

    /// Build an orchestrator for the engine named by the system config.
    pub fn from_registry(
        registry: &EngineRegistry,
        system: &SystemConfig,
        host: Arc<dyn HostIntegration>,
        layout: &ConfigLayout,
    ) -> Result<Self, CoreError> {
        let engine = registry.select(&system.engine)?;
        info!("using engine '{}'", engine.name());
        Ok(Self::new(engine, host, layout))
    }

    #[must_use]
    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Performance flags for this engine on this host.
    pub fn performance(&self, config: &ResolvedConfig) -> ResolvedPerformance {
        resolve_performance(
            &config.system.performance,
            self.settings.platform,
            &self.engine.capabilities(),
            &self.settings.policy,
        )
    }

    // -- start --------------------------------------------------------------

    pub fn start_project(
        &self,
        config: &ResolvedConfig,
        options: &StartOptions,
        cancel: &CancelToken,
    ) -> Result<StartReport, CoreError> {
        let project = &config.project;
        let app = &project.app;
        app.check_aliases()?;
        check_timeouts(config)?;

        let requested = match &options.services {
            Some(names) => names.clone(),
            None if !project.default_services.is_empty() => project.default_services.clone(),
            None => app.services.keys().cloned().collect(),
        };
        check_known(config, &requested)?;
        let selected = app.dependency_closure(&requested);

        for name in &selected {
            let service = &app.services[name];
            if let Some(driver) = self.drivers.for_service(service)? {
                driver.validate_service(service)?;
            }
        }
        if selected.iter().any(|name| self.needs_allocation(&app.services[name])) {
            self.reserve_proxy_ports(&config.system.proxy)?;
        }

        info!(
            "starting {} service(s) of project '{}'",
            selected.len(),
            project.name
        );
        let ctx = StartContext {
            config,
            options,
            cancel,
            perf: self.performance(config),
            signals: ReadySignals::new(selected.iter().map(|n| n.as_str())),
        };

        let mut units: BTreeMap<ServiceName, UnitReport> = thread::scope(|scope| {
            let ctx = &ctx;
            let workers: Vec<_> = selected
                .iter()
                .map(|name| (name, scope.spawn(move || self.start_worker(ctx, name))))
                .collect();
            workers
                .into_iter()
                .map(|(name, worker)| {
                    let report = worker.join().unwrap_or_else(|_| {
                        UnitReport::failed(
                            name,
                            app.services[name].optional,
                            UnitFailure::Engine {
                                message: "start worker panicked".to_owned(),
                            },
                        )
                    });
                    (name.clone(), report)
                })
                .collect()
        });

        let cancelled = cancel.is_cancelled();
        if cancelled {
            warn!("start of project '{}' cancelled, rolling back", project.name);
            self.roll_back(config, &selected, &mut units);
        }

        let report = StartReport {
            project: project.name.to_string(),
            units,
            cancelled,
        };
        if report.is_up() {
            info!("project '{}' is up", project.name);
        } else {
            for (name, failure) in report.failures() {
                warn!("{}/{name}: {failure}", project.name);
            }
        }
        Ok(report)
    }

    fn start_worker(&self, ctx: &StartContext<'_>, name: &ServiceName) -> UnitReport {
        let mut settle = Settle {
            signals: &ctx.signals,
            name: name.as_str(),
            ready: false,
        };
        let service = &ctx.config.project.app.services[name];

        for dep in &service.depends_on {
            let readiness = ctx.signals.wait(dep, ctx.cancel);
            if ctx.cancel.is_cancelled() || readiness == Readiness::Pending {
                return UnitReport::skipped(name, service.optional, UnitFailure::Cancelled);
            }
            if readiness == Readiness::Failed {
                debug!("{name}: dependency '{dep}' failed, skipping");
                let failure = UnitFailure::DependencyFailed {
                    dependency: dep.clone(),
                };
                return UnitReport::skipped(name, service.optional, failure);
            }
        }
        if ctx.cancel.is_cancelled() {
            return UnitReport::skipped(name, service.optional, UnitFailure::Cancelled);
        }

        let unit = UnitId::service(ctx.config.project.name.as_str(), name.as_str());
        let report = self
            .locks
            .with(&unit, || self.start_service(ctx, &unit, service));
        settle.ready = report.ready;
        report
    }

    fn start_service(
        &self,
        ctx: &StartContext<'_>,
        unit: &UnitId,
        service: &Service,
    ) -> UnitReport {
        let project = &ctx.config.project;
        if let Some(handle) = self.running_handle(unit) {
            debug!("{unit}: already running");
            return UnitReport {
                service: service.name.clone(),
                status: UnitStatus::Running,
                handle: Some(handle),
                ready: true,
                already_running: true,
                optional: service.optional,
                ports: self.known_ports(ctx.config, service),
                failure: None,
            };
        }
        self.reconcile(unit);
        self.record_exit(project.name.as_str(), unit, service);

        if let Err(e) = self.transition(unit, UnitStatus::Starting) {
            let failure = UnitFailure::Engine {
                message: e.to_string(),
            };
            return UnitReport::failed(&service.name, service.optional, failure);
        }

        let mut progress = Progress::default();
        match self.bring_up(ctx, unit, service, &mut progress) {
            Ok(()) => {
                info!("{unit}: running");
                self.settle_snapshot(unit, UnitStatus::Running, &progress);
                UnitReport {
                    service: service.name.clone(),
                    status: UnitStatus::Running,
                    handle: progress.handle,
                    ready: true,
                    already_running: false,
                    optional: service.optional,
                    ports: progress.ports,
                    failure: None,
                }
            }
            Err(failure) => {
                if let Err(e) =
                    self.unregister(project.name.as_str(), service, &progress.registration)
                {
                    warn!("{unit}: undoing host registration failed: {e}");
                }
                progress.registration = Registration::default();
                self.events.emit(LifecycleEvent::Failed {
                    unit: unit.clone(),
                    failure: failure.to_string(),
                });

                let status = if failure == UnitFailure::Cancelled {
                    self.abandon(ctx.config, unit, &mut progress)
                } else {
                    warn!("{unit}: {failure}");
                    UnitStatus::Error(failure.to_string())
                };
                self.settle_snapshot(unit, status.clone(), &progress);
                UnitReport {
                    service: service.name.clone(),
                    status,
                    handle: progress.handle,
                    ready: false,
                    already_running: false,
                    optional: service.optional,
                    ports: progress.ports,
                    failure: Some(failure),
                }
            }
        }
    }

    fn bring_up(
        &self,
        ctx: &StartContext<'_>,
        unit: &UnitId,
        service: &Service,
        progress: &mut Progress,
    ) -> Result<(), UnitFailure> {
        let project = &ctx.config.project;
        let timeouts = &ctx.config.system.timeouts;
        let driver = self
            .drivers
            .for_service(service)
            .map_err(|e| UnitFailure::Driver {
                message: e.to_string(),
            })?;

        plan::prepare_host(project, service, &ctx.perf).map_err(|e| UnitFailure::Prepare {
            message: e.to_string(),
        })?;
        progress.ports = self.allocate_ports(project.name.as_str(), service, driver.as_deref())?;

        let spec = plan::service_spec(
            project,
            service,
            &ctx.perf,
            driver.as_deref(),
            &progress.ports,
            ctx.options.command_group.as_deref(),
        );
        progress.spec = Some(spec.clone());

        for hook in &service.pre_start {
            if ctx.cancel.is_cancelled() {
                return Err(UnitFailure::Cancelled);
            }
            self.progress(unit, format!("pre-start: {hook}"));
            let (spec, line) = (spec.clone(), hook.clone());
            let result = self.call("pre-start hook", timeouts.hook, move |engine, deadline| {
                engine.run_once(&spec, &line, deadline)
            })?;
            hook_outcome(hook, result)?;
        }

        if ctx.cancel.is_cancelled() {
            return Err(UnitFailure::Cancelled);
        }
        let start_spec = spec.clone();
        let handle = self.call("start", timeouts.start, move |engine, deadline| {
            engine.start(&start_spec, deadline)
        })?;
        progress.handle = Some(handle.clone());

        for hook in &service.post_start {
            self.progress(unit, format!("post-start: {hook}"));
            let (target, line) = (handle.clone(), hook.clone());
            let result = self.call("post-start hook", timeouts.hook, move |engine, deadline| {
                engine.exec(&target, &line, &BTreeMap::new(), deadline)
            })?;
            hook_outcome(hook, result)?;
        }

        self.wait_ready(ctx, service, &handle)?;
        self.register(ctx.config, service, &handle, &mut progress.registration)
    }

    /// Host ports for every additional port of a service.
    fn allocate_ports(
        &self,
        project: &str,
        service: &Service,
        driver: Option<&dyn DatabaseDriver>,
    ) -> Result<BTreeMap<u16, u16>, UnitFailure> {
        let check = self.settings.port_check.as_ref();
        let mut ports = BTreeMap::new();
        for port in effective_ports(service, driver) {
            let host = match port.host {
                Some(fixed) if !check.is_free(fixed) => {
                    return Err(UnitFailure::PortConflict { port: fixed });
                }
                Some(fixed) => fixed,
                None => self
                    .ports
                    .allocate(project, &service.name, port.container, port.host_start, check)
                    .map_err(|e| match e {
                        StoreError::PortsExhausted { start } => {
                            UnitFailure::PortConflict { port: start }
                        }
                        other => UnitFailure::Prepare {
                            message: other.to_string(),
                        },
                    })?,
            };
            debug!("{project}/{}: {} -> host {host}", service.name, port.title);
            ports.insert(port.container, host);
        }
        Ok(ports)
    }

    fn wait_ready(
        &self,
        ctx: &StartContext<'_>,
        service: &Service,
        handle: &Handle,
    ) -> Result<(), UnitFailure> {
        let timeouts = &ctx.config.system.timeouts;
        let deadline = Deadline::after(timeouts.readiness);
        let connect_timeout = timeouts.poll_interval.min(Duration::from_millis(500));
        let mut crashed = None;

        let ready = poll_until(deadline, timeouts.poll_interval, || {
            if ctx.cancel.is_cancelled() {
                return true;
            }
            match self.engine.status(handle) {
                UnitStatus::Running => {}
                UnitStatus::Error(detail) => {
                    crashed = Some(detail);
                    return true;
                }
                _ => return false,
            }
            let labelled = service
                .ready_label
                .as_ref()
                .map_or(true, |label| self.engine.labels(handle).contains_key(label));
            let listening = service.port.map_or(true, |port| {
                self.engine
                    .address(handle, port)
                    .is_some_and(|addr| tcp_reachable(addr, connect_timeout))
            });
            labelled && listening
        });

        if ctx.cancel.is_cancelled() {
            return Err(UnitFailure::Cancelled);
        }
        if let Some(message) = crashed {
            return Err(UnitFailure::Engine { message });
        }
        if !ready {
            return Err(UnitFailure::Timeout {
                operation: "readiness".to_owned(),
                after: timeouts.readiness,
            });
        }
        Ok(())
    }

    fn register(
        &self,
        config: &ResolvedConfig,
        service: &Service,
        handle: &Handle,
        registration: &mut Registration,
    ) -> Result<(), UnitFailure> {
        let host_failure = |e: HostError| UnitFailure::Host {
            message: e.to_string(),
        };
        if config.system.update_hosts_file {
            let mut hostnames = vec![service.domain.clone()];
            hostnames.extend(service.additional_domains());
            for hostname in hostnames {
                self.host.ensure_host_entry(&hostname).map_err(host_failure)?;
                registration.host_entries.push(hostname);
            }
        }
        if let Some(port) = service.port {
            let target = self
                .engine
                .address(handle, port)
                .map_or_else(|| format!("{HOST_ADDRESS}:{port}"), |addr| addr.to_string());
            self.host
                .register_route(
                    config.project.name.as_str(),
                    &service.name,
                    &service.domain,
                    &target,
                )
                .map_err(host_failure)?;
            registration.route = true;
        }
        Ok(())
    }

    /// Take a unit whose start was cancelled back to `Stopped`.
    fn abandon(
        &self,
        config: &ResolvedConfig,
        unit: &UnitId,
        progress: &mut Progress,
    ) -> UnitStatus {
        let Some(handle) = progress.handle.clone() else {
            return match self.transition(unit, UnitStatus::Stopped) {
                Ok(()) => UnitStatus::Stopped,
                Err(e) => UnitStatus::Error(e.to_string()),
            };
        };
        if let Err(e) = self.transition(unit, UnitStatus::Stopping) {
            return UnitStatus::Error(e.to_string());
        }
        let result = self.call("stop", config.system.timeouts.stop, move |engine, deadline| {
            engine.stop(&handle, deadline)
        });
        let status = match result {
            Ok(()) => {
                progress.handle = None;
                UnitStatus::Stopped
            }
            Err(e) => UnitStatus::Error(UnitFailure::from(e).to_string()),
        };
        if let Err(e) = self.transition(unit, status.clone()) {
            warn!("{unit}: {e}");
        }
        status
    }

    /// Stop what a cancelled start brought up, dependents first.
    fn roll_back(
        &self,
        config: &ResolvedConfig,
        selected: &BTreeSet<ServiceName>,
        units: &mut BTreeMap<ServiceName, UnitReport>,
    ) {
        for layer in config.project.app.start_order(selected).iter().rev() {
            for name in layer {
                let Some(report) = units.get_mut(name) else {
                    continue;
                };
                if report.already_running || report.status != UnitStatus::Running {
                    continue;
                }
                let unit = UnitId::service(config.project.name.as_str(), name.as_str());
                let outcome = self.locks.with(&unit, || self.stop_service(config, name));
                report.ready = false;
                report.failure = Some(UnitFailure::Cancelled);
                match outcome {
                    StopOutcome::Stopped | StopOutcome::AlreadyStopped => {
                        report.status = UnitStatus::Stopped;
                        report.handle = None;
                    }
                    StopOutcome::Failed(failure) => {
                        warn!("{unit}: rollback failed: {failure}");
                        report.status = UnitStatus::Error(failure.to_string());
                    }
                }
            }
        }
    }

    // -- stop ---------------------------------------------------------------

    pub fn stop_project(
        &self,
        config: &ResolvedConfig,
        options: &StopOptions,
    ) -> Result<StopReport, CoreError> {
        let project = &config.project;
        check_timeouts(config)?;
        let selected: BTreeSet<ServiceName> = match &options.services {
            Some(names) => {
                check_known(config, names)?;
                names.iter().cloned().collect()
            }
            None => project.app.services.keys().cloned().collect(),
        };
        info!(
            "stopping {} service(s) of project '{}'",
            selected.len(),
            project.name
        );

        let mut report = StopReport {
            project: project.name.to_string(),
            ..StopReport::default()
        };
        for layer in project.app.start_order(&selected).into_iter().rev() {
            let outcomes: Vec<(ServiceName, StopOutcome)> = thread::scope(|scope| {
                let workers: Vec<_> = layer
                    .iter()
                    .map(|name| {
                        let unit = UnitId::service(project.name.as_str(), name.as_str());
                        let worker = scope.spawn(move || {
                            self.locks.with(&unit, || self.stop_service(config, name))
                        });
                        (name, worker)
                    })
                    .collect();
                workers
                    .into_iter()
                    .map(|(name, worker)| {
                        let outcome = worker.join().unwrap_or_else(|_| {
                            StopOutcome::Failed(UnitFailure::Engine {
                                message: "stop worker panicked".to_owned(),
                            })
                        });
                        (name.clone(), outcome)
                    })
                    .collect()
            });
            for (name, outcome) in outcomes {
                match outcome {
                    StopOutcome::Stopped => report.stopped.push(name),
                    StopOutcome::AlreadyStopped => report.already_stopped.push(name),
                    StopOutcome::Failed(failure) => {
                        warn!("{}/{name}: {failure}", project.name);
                        report.failures.insert(name, failure);
                    }
                }
            }
        }
        Ok(report)
    }

    fn stop_service(&self, config: &ResolvedConfig, name: &ServiceName) -> StopOutcome {
        let project = config.project.name.as_str();
        let unit = UnitId::service(project, name.as_str());
        let Some(service) = config.project.app.services.get(name) else {
            return StopOutcome::AlreadyStopped;
        };
        let snapshot = self.snapshot(&unit).unwrap_or_default();
        self.reconcile(&unit);

        let handle = snapshot.handle.clone().or_else(|| self.engine.lookup(&unit));
        let needs_stop = match (&snapshot.status, &handle) {
            (UnitStatus::Error(_), _) => true,
            (_, Some(handle)) => self.engine.status(handle) != UnitStatus::Stopped,
            (_, None) => false,
        };
        if !needs_stop {
            if snapshot.status != UnitStatus::Stopped {
                self.force(&unit, UnitStatus::Stopped);
            }
            debug!("{unit}: already stopped");
            return StopOutcome::AlreadyStopped;
        }
        if !matches!(snapshot.status, UnitStatus::Running | UnitStatus::Error(_)) {
            // Started by an earlier process.
            self.force(&unit, UnitStatus::Running);
        }
        if let Err(e) = self.transition(&unit, UnitStatus::Stopping) {
            return StopOutcome::Failed(UnitFailure::Engine {
                message: e.to_string(),
            });
        }

        let registration = match (&snapshot.status, snapshot.registration) {
            (_, Some(registration)) => registration,
            // Undone when the unit failed.
            (UnitStatus::Error(_), None) => Registration::default(),
            (_, None) => derived_registration(config, service),
        };
        let unregistered = self.unregister(project, service, &registration);

        if let Some(handle) = handle {
            let result = self.call("stop", config.system.timeouts.stop, move |engine, deadline| {
                engine.stop(&handle, deadline)
            });
            if let Err(e) = result {
                let failure = UnitFailure::from(e);
                if let Err(e) = self.transition(&unit, UnitStatus::Error(failure.to_string())) {
                    warn!("{unit}: {e}");
                }
                return StopOutcome::Failed(failure);
            }
        }

        self.settle_snapshot(&unit, UnitStatus::Stopped, &Progress::default());
        info!("{unit}: stopped");
        match unregistered {
            Ok(()) => StopOutcome::Stopped,
            Err(e) => StopOutcome::Failed(UnitFailure::Host {
                message: e.to_string(),
            }),
        }
    }

    fn unregister(
        &self,
        project: &str,
        service: &Service,
        registration: &Registration,
    ) -> Result<(), HostError> {
        if registration.is_empty() {
            return Ok(());
        }
        let mut first_error = None;
        if registration.route {
            if let Err(e) = self.host.unregister_route(project, &service.name) {
                warn!("{project}/{}: {e}", service.name);
                first_error.get_or_insert(e);
            }
        }
        for hostname in &registration.host_entries {
            if let Err(e) = self.host.remove_host_entry(hostname) {
                warn!("{project}/{}: {e}", service.name);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // -- inspection ---------------------------------------------------------

    pub fn unit_status(&self, unit: &UnitId) -> UnitStatus {
        match self.snapshot(unit) {
            Some(UnitSnapshot {
                status: UnitStatus::Running,
                handle: Some(handle),
                ..
            }) => self.engine.status(&handle),
            Some(snapshot) if snapshot.status != UnitStatus::Stopped => snapshot.status,
            _ => self
                .engine
                .lookup(unit)
                .map_or(UnitStatus::Stopped, |handle| self.engine.status(&handle)),
        }
    }

    pub fn project_status(&self, config: &ResolvedConfig) -> ProjectStatus {
        let project = &config.project;
        let services = project
            .app
            .services
            .iter()
            .map(|(name, service)| {
                let unit = UnitId::service(project.name.as_str(), name.as_str());
                let status = ServiceStatus {
                    status: self.unit_status(&unit),
                    url: service
                        .port
                        .map(|_| proxy_url(&config.system.proxy, &service.domain)),
                    additional_ports: self.known_ports(config, service),
                };
                (name.clone(), status)
            })
            .collect();
        ProjectStatus {
            project: project.name.to_string(),
            services,
        }
    }

    // -- commands and files -------------------------------------------------

    /// Run `command` inside a running service.
    pub fn exec(
        &self,
        config: &ResolvedConfig,
        service: &str,
        command: &str,
    ) -> Result<ExitResult, CoreError> {
        let handle = self.handle_of(config, service)?;
        let line = command.to_owned();
        debug!("{}/{service}: exec {command}", config.project.name);
        Ok(self.call("exec", config.system.timeouts.hook, move |engine, deadline| {
            engine.exec(&handle, &line, &BTreeMap::new(), deadline)
        })?)
    }

    /// Run a project command, following aliases.
    pub fn run_command(
        &self,
        config: &ResolvedConfig,
        name: &str,
        args: &[String],
    ) -> Result<ExitResult, CoreError> {
        let project = &config.project;
        let (resolved, command) = project.app.resolve_command(name).map_err(|e| match e {
            SchemaError::UnknownCommand(missing) => CoreError::UnknownCommand(missing),
            other => other.into(),
        })?;
        info!("{}: running command '{resolved}'", project.name);
        let budget = config.system.timeouts.hook;

        match &command.kind {
            CommandKind::Image { command: line, .. } => {
                let perf = self.performance(config);
                let spec = plan::command_spec(project, resolved, &command.kind, &perf)
                    .ok_or_else(|| CoreError::UnknownCommand(name.to_owned()))?;
                let line = command_line(line.as_deref(), args);
                Ok(self.call("run command", budget, move |engine, deadline| {
                    engine.run_once(&spec, &line, deadline)
                })?)
            }
            CommandKind::InService {
                role,
                command: line,
                environment,
            } => {
                let (service, _) = project
                    .app
                    .service_by_role(role)
                    .ok_or_else(|| CoreError::UnknownService(format!("with role '{role}'")))?;
                let handle = self.handle_of(config, service)?;
                let (line, env) = (command_line(Some(line.as_str()), args), environment.clone());
                Ok(self.call("run command", budget, move |engine, deadline| {
                    engine.exec(&handle, &line, &env, deadline)
                })?)
            }
            CommandKind::Alias { .. } => Err(CoreError::UnknownCommand(name.to_owned())),
        }
    }

    /// Copy between the project folder and a running service.
    pub fn copy_path(
        &self,
        config: &ResolvedConfig,
        service: &str,
        host_path: &Path,
        container_path: &str,
        direction: CopyDirection,
    ) -> Result<(), CoreError> {
        let root = &config.project.root;
        if !plan::inside(root, host_path) {
            return Err(CoreError::PermissionDenied(format!(
                "{} is outside the project folder {}",
                host_path.display(),
                root.display()
            )));
        }
        let host_path = riptide_schema::join_normalized(root, &host_path.to_string_lossy());
        let handle = self.handle_of(config, service)?;
        let container_path = container_path.to_owned();
        Ok(self.call("copy", config.system.timeouts.hook, move |engine, deadline| {
            engine.copy_path(&handle, &host_path, &container_path, direction, deadline)
        })?)
    }

    /// Remove a path inside a running service. Paths backed by a host mount
    /// must resolve into the project folder.
    pub fn remove_path(
        &self,
        config: &ResolvedConfig,
        service: &str,
        container_path: &str,
    ) -> Result<(), CoreError> {
        let handle = self.handle_of(config, service)?;
        let mapped = self
            .snapshot(&handle.unit)
            .and_then(|s| s.spec)
            .and_then(|spec| spec.host_path_for(container_path));
        if let Some(host_path) = mapped {
            if !plan::inside(&config.project.root, &host_path) {
                return Err(CoreError::PermissionDenied(format!(
                    "{container_path} maps to {} outside the project folder",
                    host_path.display()
                )));
            }
        }
        let path = container_path.to_owned();
        Ok(self.call("remove", config.system.timeouts.hook, move |engine, deadline| {
            engine.remove_path(&handle, &path, deadline)
        })?)
    }

    // -- attached projects --------------------------------------------------

    /// Track a project by name. A name can only be attached from one folder.
    pub fn attach_project(&self, config: &ResolvedConfig) -> Result<(), CoreError> {
        let project = &config.project;
        let mut attached = self.attached.lock().unwrap_or_else(PoisonError::into_inner);
        match attached.get(project.name.as_str()) {
            Some(existing) if existing != &project.root => Err(CoreError::ProjectConflict {
                name: project.name.to_string(),
                existing: existing.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                debug!("attached project '{}'", project.name);
                attached.insert(project.name.to_string(), project.root.clone());
                Ok(())
            }
        }
    }

    pub fn detach_project(&self, name: &str) -> bool {
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn attached_projects(&self) -> Vec<(String, PathBuf)> {
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, root)| (name.clone(), root.clone()))
            .collect()
    }

    // -- internals ----------------------------------------------------------

    fn call<T, F>(&self, operation: &str, budget: Duration, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ContainerEngine, Deadline) -> Result<T, EngineError> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let deadline = Deadline::after(budget);
        call_with_deadline(operation, deadline, move || f(engine.as_ref(), deadline))
    }

    fn read_table(&self) -> RwLockReadGuard<'_, HashMap<UnitId, UnitSnapshot>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, HashMap<UnitId, UnitSnapshot>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, unit: &UnitId) -> Option<UnitSnapshot> {
        self.read_table().get(unit).cloned()
    }

    fn transition(&self, unit: &UnitId, to: UnitStatus) -> Result<(), CoreError> {
        {
            let mut table = self.write_table();
            let entry = table.entry(unit.clone()).or_default();
            validate_transition(&entry.status, &to)?;
            entry.status = to.clone();
        }
        debug!("{unit}: {to}");
        self.events.emit(LifecycleEvent::status(unit, &to));
        Ok(())
    }

    /// Set a status observed outside this orchestrator without validating
    /// the change.
    fn force(&self, unit: &UnitId, to: UnitStatus) {
        self.write_table().entry(unit.clone()).or_default().status = to.clone();
        self.events.emit(LifecycleEvent::status(unit, &to));
    }

    /// Clear a transient status left behind by an interrupted worker.
    fn reconcile(&self, unit: &UnitId) {
        let stale = self
            .snapshot(unit)
            .is_some_and(|s| matches!(s.status, UnitStatus::Starting | UnitStatus::Stopping));
        if stale {
            warn!("{unit}: clearing stale transient state");
            self.force(unit, UnitStatus::Stopped);
        }
    }

    /// A unit the table still lists as running but the engine no longer
    /// runs has exited on its own. Record what the engine reports and undo
    /// its host registration so Start can bring it up again.
    fn record_exit(&self, project: &str, unit: &UnitId, service: &Service) {
        let Some(snapshot) = self.snapshot(unit) else {
            return;
        };
        if snapshot.status != UnitStatus::Running {
            return;
        }
        let observed = match snapshot.handle.as_ref().map(|h| self.engine.status(h)) {
            Some(UnitStatus::Error(detail)) => UnitStatus::Error(detail),
            _ => UnitStatus::Stopped,
        };
        warn!("{unit}: exited outside riptide ({observed})");
        if let Some(registration) = &snapshot.registration {
            if let Err(e) = self.unregister(project, service, registration) {
                warn!("{unit}: undoing host registration failed: {e}");
            }
        }
        {
            let mut table = self.write_table();
            let entry = table.entry(unit.clone()).or_default();
            entry.registration = None;
            if observed == UnitStatus::Stopped {
                entry.handle = None;
                entry.spec = None;
            }
        }
        self.force(unit, observed);
    }

    fn settle_snapshot(&self, unit: &UnitId, status: UnitStatus, progress: &Progress) {
        let registration = (status == UnitStatus::Running).then(|| progress.registration.clone());
        let keep = status != UnitStatus::Stopped;
        {
            let mut table = self.write_table();
            let entry = table.entry(unit.clone()).or_default();
            entry.handle = progress.handle.clone().filter(|_| keep);
            entry.spec = progress.spec.clone().filter(|_| keep);
            entry.registration = registration;
        }
        if let Err(e) = self.transition_if_changed(unit, status) {
            warn!("{unit}: {e}");
        }
    }

    fn transition_if_changed(&self, unit: &UnitId, to: UnitStatus) -> Result<(), CoreError> {
        let current = self.snapshot(unit).map(|s| s.status);
        if current.as_ref() == Some(&to) {
            return Ok(());
        }
        self.transition(unit, to)
    }

    /// Handle of a running unit, adopting units an earlier process started.
    fn running_handle(&self, unit: &UnitId) -> Option<Handle> {
        if let Some(UnitSnapshot {
            status: UnitStatus::Running,
            handle: Some(handle),
            ..
        }) = self.snapshot(unit)
        {
            if self.engine.status(&handle) == UnitStatus::Running {
                return Some(handle);
            }
        }
        let handle = self.engine.lookup(unit)?;
        if self.engine.status(&handle) != UnitStatus::Running {
            return None;
        }
        let known = self
            .snapshot(unit)
            .is_some_and(|s| s.status == UnitStatus::Running);
        if !known {
            info!("{unit}: adopting running unit {}", handle.id);
            self.write_table().entry(unit.clone()).or_default().handle = Some(handle.clone());
            self.force(unit, UnitStatus::Running);
        }
        Some(handle)
    }

    fn handle_of(&self, config: &ResolvedConfig, service: &str) -> Result<Handle, CoreError> {
        if !config.project.app.services.contains_key(service) {
            return Err(CoreError::UnknownService(service.to_owned()));
        }
        let unit = UnitId::service(config.project.name.as_str(), service);
        self.running_handle(&unit)
            .ok_or_else(|| EngineError::NotRunning(unit.to_string()).into())
    }

    /// Container port to host port for every additional port whose host
    /// side is fixed or already recorded.
    fn known_ports(&self, config: &ResolvedConfig, service: &Service) -> BTreeMap<u16, u16> {
        let driver = self.drivers.for_service(service).ok().flatten();
        let book = self.ports.load().unwrap_or_else(|e| {
            warn!("port registry unavailable: {e}");
            Default::default()
        });
        let project = config.project.name.as_str();
        effective_ports(service, driver.as_deref())
            .into_iter()
            .filter_map(|port| {
                let host = port
                    .host
                    .or_else(|| book.recorded(project, &service.name, port.container))?;
                Some((port.container, host))
            })
            .collect()
    }

    fn needs_allocation(&self, service: &Service) -> bool {
        let driver = self.drivers.for_service(service).ok().flatten();
        effective_ports(service, driver.as_deref())
            .iter()
            .any(|p| p.host.is_none())
    }

    /// Keep allocated ports clear of the proxy's own ports.
    fn reserve_proxy_ports(&self, proxy: &ProxyConfig) -> Result<(), CoreError> {
        self.ports.reserve(proxy.http_port)?;
        if let Some(https) = proxy.https_port {
            self.ports.reserve(https)?;
        }
        Ok(())
    }

    fn progress(&self, unit: &UnitId, message: String) {
        debug!("{unit}: {message}");
        self.events.emit(LifecycleEvent::Progress {
            unit: unit.clone(),
            message,
        });
    }
}

fn check_timeouts(config: &ResolvedConfig) -> Result<(), CoreError> {
    let t = &config.system.timeouts;
    let named = [
        ("start", t.start),
        ("stop", t.stop),
        ("readiness", t.readiness),
        ("hook", t.hook),
        ("poll_interval", t.poll_interval),
    ];
    match named.iter().find(|(_, d)| d.is_zero()) {
        Some((name, _)) => Err(CoreError::InvalidOptions(format!(
            "timeout '{name}' must be greater than zero"
        ))),
        None => Ok(()),
    }
}

fn check_known(config: &ResolvedConfig, names: &[ServiceName]) -> Result<(), CoreError> {
    match names
        .iter()
        .find(|n| !config.project.app.services.contains_key(n.as_str()))
    {
        Some(unknown) => Err(CoreError::UnknownService(unknown.to_string())),
        None => Ok(()),
    }
}

fn hook_outcome(hook: &str, result: ExitResult) -> Result<(), UnitFailure> {
    if result.success() {
        return Ok(());
    }
    Err(UnitFailure::Hook {
        command: hook.to_owned(),
        code: result.code,
        stderr: result.stderr,
    })
}

/// What a running service of `config` has registered, for units this
/// orchestrator did not start.
fn derived_registration(config: &ResolvedConfig, service: &Service) -> Registration {
    let mut host_entries = Vec::new();
    if config.system.update_hosts_file {
        host_entries.push(service.domain.clone());
        host_entries.extend(service.additional_domains());
    }
    Registration {
        route: service.port.is_some(),
        host_entries,
    }
}

fn proxy_url(proxy: &ProxyConfig, domain: &str) -> String {
    match proxy.https_port {
        Some(443) => format!("https://{domain}"),
        Some(port) => format!("https://{domain}:{port}"),
        None if proxy.http_port == 80 => format!("http://{domain}"),
        None => format!("http://{domain}:{}", proxy.http_port),
    }
}

fn command_line(base: Option<&str>, args: &[String]) -> String {
    let mut parts: Vec<String> = base.map(str::to_owned).into_iter().collect();
    parts.extend(args.iter().map(|arg| {
        if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || "'\"$`\\".contains(c)) {
            format!("'{}'", arg.replace('\'', r"'\''"))
        } else {
            arg.clone()
        }
    }));
    parts.join(" ")
}
