use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::health::{HealthProber, HealthResult};
use crate::logbuf::{LogBuffer, LogEntry, SequenceSource};
use crate::manifest::Project;
use crate::ports::PortBroker;
use crate::registry::{Registry, RegistryEntry};
use crate::runner::{self, ProcessHandle, SpawnSpec};
use crate::state::ServiceStatus;

pub mod plan;
pub mod ready;

use plan::{PlanOptions, ServiceRuntime};
use ready::ReadyOutcome;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Keep going when a service fails during startup.
    pub tolerate_partial: bool,
    pub grace: Duration,
    pub ready_deadline: Duration,
    pub shutdown_deadline: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Mirror logs to `.azure/logs/<service>.log`.
    pub write_log_files: bool,
    pub plan: PlanOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            tolerate_partial: false,
            grace: runner::DEFAULT_GRACE,
            ready_deadline: ready::DEFAULT_READY_DEADLINE,
            shutdown_deadline: Duration::from_secs(10),
            probe_interval: Duration::from_secs(10),
            probe_timeout: crate::health::DEFAULT_PROBE_TIMEOUT,
            write_log_files: true,
            plan: PlanOptions::default(),
        }
    }
}

struct ServiceCell {
    runtime: ServiceRuntime,
    log: Arc<LogBuffer>,
    status_tx: watch::Sender<ServiceStatus>,
    handle: Option<Arc<ProcessHandle>>,
    prober: Option<Arc<HealthProber>>,
    last_health: Option<HealthResult>,
    exit_code: Option<i32>,
    /// Tail captured at the moment of failure, for display after shutdown.
    failure_tail: Vec<LogEntry>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceCell {
    fn status(&self) -> ServiceStatus {
        *self.status_tx.borrow()
    }
}

/// JSON shape shared by the dashboard and the CLI for one service.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ServiceView {
    pub name: String,
    pub kind: String,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub port: u16,
    pub debug_port: Option<u16>,
    pub url: String,
    pub command: String,
    pub health: Option<HealthResult>,
    pub uptime_secs: Option<u64>,
    pub exit_code: Option<i32>,
}

/// Owns a run's services for its lifetime: plans them, starts them in
/// dependency order, holds their worker tasks, and tears everything down in
/// reverse order on shutdown.
pub struct Supervisor {
    project: Project,
    registry: Arc<Registry>,
    broker: Arc<PortBroker>,
    seq: Arc<SequenceSource>,
    cells: RwLock<IndexMap<String, ServiceCell>>,
    cancel: CancellationToken,
    opts: RunOptions,
}

impl Supervisor {
    pub fn new(project: Project, registry: Arc<Registry>, opts: RunOptions) -> Self {
        Self {
            project,
            registry,
            broker: Arc::new(PortBroker::new()),
            seq: Arc::new(SequenceSource::default()),
            cells: RwLock::new(IndexMap::new()),
            cancel: CancellationToken::new(),
            opts,
        }
    }

    pub fn project_name(&self) -> &str {
        &self.project.name
    }

    pub fn project_dir(&self) -> &std::path::Path {
        &self.project.dir
    }

    pub fn broker(&self) -> &Arc<PortBroker> {
        &self.broker
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the plan phase only; nothing is spawned. Used by `run --dry-run`
    /// and as the first step of `start_all`.
    pub fn plan_only(&self, selected: Option<&[String]>) -> Result<plan::Plan> {
        plan::plan(&self.project, selected, &self.broker, &self.opts.plan)
    }

    /// Cancel the run on SIGINT/SIGTERM. One listener per supervisor.
    pub fn spawn_signal_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut term = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("cannot install SIGTERM handler: {e}");
                        let _ = tokio::signal::ctrl_c().await;
                        cancel.cancel();
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            cancel.cancel();
        })
    }

    /// Plan and start every selected service, one worker per service,
    /// synchronized only by `depends_on`. Returns once all workers finish
    /// (everything ready, or the first failure has cascaded).
    pub async fn start_all(self: &Arc<Self>, selected: Option<&[String]>) -> Result<()> {
        let planned = self.plan_only(selected)?;

        // Materialize cells first so dependency watchers exist before any
        // worker runs.
        {
            let mut cells = self.cells.write().await;
            for runtime in &planned.runtimes {
                let log = Arc::new(LogBuffer::new(runtime.name(), self.seq.clone()));
                let (status_tx, _) = watch::channel(ServiceStatus::Planned);
                let mut tasks = Vec::new();
                if self.opts.write_log_files {
                    tasks.push(crate::logfile::spawn_writer(
                        &self.project.dir,
                        log.clone(),
                        self.cancel.clone(),
                    ));
                }
                cells.insert(
                    runtime.name().to_string(),
                    ServiceCell {
                        runtime: runtime.clone(),
                        log,
                        status_tx,
                        handle: None,
                        prober: None,
                        last_health: None,
                        exit_code: None,
                        failure_tail: Vec::new(),
                        tasks,
                    },
                );
            }
        }

        let mut workers = Vec::new();
        for runtime in &planned.runtimes {
            let name = runtime.name().to_string();
            let deps: Vec<(String, watch::Receiver<ServiceStatus>)> = {
                let cells = self.cells.read().await;
                runtime
                    .spec
                    .depends_on
                    .iter()
                    .filter_map(|d| {
                        cells
                            .get(d)
                            .map(|c| (d.clone(), c.status_tx.subscribe()))
                    })
                    .collect()
            };
            let sup = self.clone();
            workers.push(tokio::spawn(async move {
                sup.run_worker(name, deps).await
            }));
        }

        let mut first_err: Option<AppError> = None;
        for worker in workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(AppError::Config(format!("worker panicked: {e}")));
                    }
                }
            }
        }

        match first_err {
            Some(e) if !self.opts.tolerate_partial => Err(e),
            _ => Ok(()),
        }
    }

    async fn run_worker(
        self: &Arc<Self>,
        name: String,
        deps: Vec<(String, watch::Receiver<ServiceStatus>)>,
    ) -> Result<()> {
        for (dep, mut rx) in deps {
            loop {
                let status = *rx.borrow();
                match status {
                    ServiceStatus::Ready => break,
                    ServiceStatus::Failed | ServiceStatus::Stopped => {
                        self.mark_failed(&name, None, format!("dependency '{dep}' failed"))
                            .await;
                        return Err(AppError::Spawn {
                            service: name,
                            msg: format!("dependency '{dep}' failed"),
                        });
                    }
                    _ => {
                        tokio::select! {
                            changed = rx.changed() => {
                                if changed.is_err() {
                                    return Ok(());
                                }
                            }
                            _ = self.cancel.cancelled() => return Ok(()),
                        }
                    }
                }
            }
        }
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.start_one(&name).await
    }

    /// Spawn one planned service, wait for readiness, and hand it over to
    /// its steady-state tasks.
    async fn start_one(self: &Arc<Self>, name: &str) -> Result<()> {
        let (runtime, log) = {
            let cells = self.cells.read().await;
            let cell = cells
                .get(name)
                .ok_or_else(|| AppError::UnknownService(name.to_string()))?;
            (cell.runtime.clone(), cell.log.clone())
        };

        let spec = SpawnSpec {
            name: runtime.name().to_string(),
            program: runtime.program.clone(),
            args: runtime.args.clone(),
            dir: runtime.working_dir.clone(),
            env: runtime.env.clone(),
        };

        tracing::info!("[{name}] starting on :{}", runtime.port);
        let after_seq = log.snapshot().last().map(|e| e.sequence).unwrap_or(0);
        let handle = match runner::start(&spec, log.clone()).await {
            Ok(h) => Arc::new(h),
            Err(e) => {
                self.mark_failed(name, None, e.to_string()).await;
                if !self.opts.tolerate_partial {
                    self.cancel.cancel();
                }
                return Err(e);
            }
        };

        let prober = Arc::new(HealthProber::new(
            &runtime.spec,
            runtime.port,
            handle.pid,
            handle.started_at,
        ));

        {
            let mut cells = self.cells.write().await;
            if let Some(cell) = cells.get_mut(name) {
                cell.handle = Some(handle.clone());
                cell.prober = Some(prober.clone());
                cell.exit_code = None;
                let _ = cell.status_tx.send_replace(ServiceStatus::Starting);
            }
        }
        self.write_registry_entry(name, ServiceStatus::Starting, Some(handle.pid))
            .await;

        self.spawn_child_watcher(name.to_string(), handle.clone())
            .await;

        match ready::wait_ready(
            &runtime,
            &log,
            after_seq,
            &prober,
            self.opts.ready_deadline,
            &self.cancel,
        )
        .await
        {
            Ok(ReadyOutcome::Ready(signal)) => {
                // Never enter ready once shutdown has begun.
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                tracing::info!("[{name}] ready ({signal:?})");
                self.set_status(name, ServiceStatus::Ready, None).await;
                self.spawn_probe_task(name.to_string(), prober).await;
                Ok(())
            }
            Ok(ReadyOutcome::Cancelled) => {
                // Cancelled because this very service died during startup?
                let (status, code) = {
                    let cells = self.cells.read().await;
                    match cells.get(name) {
                        Some(c) => (c.status(), c.exit_code),
                        None => return Ok(()),
                    }
                };
                if status == ServiceStatus::Failed {
                    return Err(AppError::ChildFailure {
                        service: name.to_string(),
                        code: code.unwrap_or(-1),
                    });
                }
                Ok(())
            }
            Err(e) => {
                self.mark_failed(name, None, e.to_string()).await;
                if !self.opts.tolerate_partial {
                    self.cancel.cancel();
                }
                Err(e)
            }
        }
    }

    /// One watcher per service: reaps the child and turns its exit into a
    /// status transition.
    async fn spawn_child_watcher(self: &Arc<Self>, name: String, handle: Arc<ProcessHandle>) {
        let sup = self.clone();
        let cell_name = name.clone();
        let task = tokio::spawn(async move {
            let code = handle.wait().await;
            let status = {
                let cells = sup.cells.read().await;
                cells.get(&name).map(|c| c.status())
            };
            let Some(status) = status else { return };

            match status {
                ServiceStatus::Stopping | ServiceStatus::Stopped => {
                    let mut cells = sup.cells.write().await;
                    if let Some(cell) = cells.get_mut(&name) {
                        cell.exit_code = code;
                    }
                }
                _ => {
                    if code == Some(0) {
                        tracing::info!("[{name}] exited cleanly");
                        sup.set_status(&name, ServiceStatus::Stopping, None).await;
                        sup.set_status(&name, ServiceStatus::Stopped, None).await;
                        sup.broker.release_service(&name);
                        return;
                    }
                    let rendered = code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "killed".into());
                    tracing::error!("[{name}] exited unexpectedly (code={rendered})");
                    sup.mark_failed(&name, code, format!("exited with code {rendered}"))
                        .await;
                    if !sup.opts.tolerate_partial {
                        sup.cancel.cancel();
                    }
                }
            }
        });
        let mut cells = self.cells.write().await;
        if let Some(cell) = cells.get_mut(&cell_name) {
            cell.tasks.push(task);
        } else {
            task.abort();
        }
    }

    /// Periodic health probe on an absolute schedule.
    async fn spawn_probe_task(self: &Arc<Self>, name: String, prober: Arc<HealthProber>) {
        let sup = self.clone();
        let cell_name = name.clone();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(sup.opts.probe_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = sup.cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let still_running = {
                    let cells = sup.cells.read().await;
                    cells.get(&name).is_some_and(|c| c.status().is_running())
                };
                if !still_running {
                    break;
                }
                let result = prober.probe(sup.opts.probe_timeout).await;
                let still_running = {
                    let mut cells = sup.cells.write().await;
                    match cells.get_mut(&name) {
                        Some(cell) => {
                            cell.last_health = Some(result.clone());
                            cell.status().is_running()
                        }
                        None => false,
                    }
                };
                // The child watcher may have marked the service failed while
                // the probe was in flight; never write ready over that.
                if !still_running {
                    break;
                }
                let _ = sup.registry.update_status(
                    &name,
                    ServiceStatus::Ready,
                    Some(result.status),
                    None,
                );
            }
        });
        let mut cells = self.cells.write().await;
        if let Some(cell) = cells.get_mut(&cell_name) {
            cell.tasks.push(task);
        } else {
            task.abort();
        }
    }

    async fn set_status(&self, name: &str, status: ServiceStatus, error: Option<String>) {
        let pid = {
            let mut cells = self.cells.write().await;
            match cells.get_mut(name) {
                Some(cell) => {
                    let from = cell.status();
                    if from == status {
                        return;
                    }
                    // Late signals lose: a settle-based ready must not revive
                    // a service that already stopped or failed.
                    if !from.can_transition(status) {
                        tracing::debug!("[{name}] dropping transition {from} -> {status}");
                        return;
                    }
                    let _ = cell.status_tx.send_replace(status);
                    cell.handle.as_ref().map(|h| h.pid)
                }
                None => return,
            }
        };
        if status.is_running() {
            self.write_registry_entry(name, status, pid).await;
        } else {
            let _ = self.registry.update_status(name, status, None, error);
        }
    }

    async fn mark_failed(&self, name: &str, exit_code: Option<i32>, error: String) {
        {
            let mut cells = self.cells.write().await;
            if let Some(cell) = cells.get_mut(name) {
                cell.exit_code = exit_code;
                cell.failure_tail = cell.log.tail(100);
                let _ = cell.status_tx.send_replace(ServiceStatus::Failed);
            }
        }
        let _ = self
            .registry
            .update_status(name, ServiceStatus::Failed, None, Some(error));
    }

    async fn write_registry_entry(&self, name: &str, status: ServiceStatus, pid: Option<u32>) {
        let entry = {
            let cells = self.cells.read().await;
            let Some(cell) = cells.get(name) else { return };
            RegistryEntry {
                name: name.to_string(),
                kind: cell.runtime.spec.kind.label().to_string(),
                pid,
                port: Some(cell.runtime.port),
                debug_port: cell.runtime.debug_port,
                url: Some(cell.runtime.url()),
                status,
                health: cell.last_health.as_ref().map(|h| h.status),
                command: Some(cell.runtime.rendered_command()),
                working_dir: Some(cell.runtime.working_dir.clone()),
                start_time: cell.handle.as_ref().map(|h| h.started_at),
                last_checked: Some(Utc::now()),
                error: None,
            }
        };
        if let Err(e) = self.registry.register(entry) {
            tracing::warn!("[{name}] registry write failed: {e}");
        }
    }

    /// Stop one service: graceful signal, grace window, then force kill.
    /// Stopping an already stopped service is a no-op that reports success.
    pub async fn stop_service(&self, name: &str) -> Result<()> {
        self.stop_service_with(name, self.opts.grace).await
    }

    pub async fn stop_service_with(&self, name: &str, grace: Duration) -> Result<()> {
        let handle = {
            let mut cells = self.cells.write().await;
            let cell = cells
                .get_mut(name)
                .ok_or_else(|| AppError::UnknownService(name.to_string()))?;
            if !cell.status().is_running() {
                return Ok(());
            }
            let _ = cell.status_tx.send_replace(ServiceStatus::Stopping);
            cell.handle.take()
        };
        let _ = self
            .registry
            .update_status(name, ServiceStatus::Stopping, None, None);

        if let Some(handle) = handle {
            runner::stop(&handle, grace).await;
        }
        self.set_status(name, ServiceStatus::Stopped, None).await;
        self.broker.release_service(name);
        tracing::info!("[{name}] stopped");
        Ok(())
    }

    /// Start a service that is currently stopped or failed, re-acquiring its
    /// port (previous port preferred).
    pub async fn start_service(self: &Arc<Self>, name: &str) -> Result<()> {
        {
            let cells = self.cells.read().await;
            let cell = cells
                .get(name)
                .ok_or_else(|| AppError::UnknownService(name.to_string()))?;
            if cell.status().is_running() {
                return Ok(());
            }
        }
        self.replan_service(name).await?;
        self.start_one(name).await
    }

    /// Stop + release + re-plan + start. Other services keep the sibling
    /// environment they were told at their own start time.
    pub async fn restart_service(self: &Arc<Self>, name: &str) -> Result<()> {
        self.stop_service(name).await?;
        self.replan_service(name).await?;
        self.start_one(name).await
    }

    async fn replan_service(&self, name: &str) -> Result<()> {
        let (spec, prev_port, prev_debug) = {
            let cells = self.cells.read().await;
            let cell = cells
                .get(name)
                .ok_or_else(|| AppError::UnknownService(name.to_string()))?;
            (
                cell.runtime.spec.clone(),
                cell.runtime.port,
                cell.runtime.debug_port,
            )
        };

        let mut requested = vec![prev_port];
        requested.extend(spec.requested_ports.iter().copied());
        let port = self.broker.acquire(name, &requested)?;
        let debug_port = match prev_debug {
            Some(d) => Some(self.broker.acquire(name, &[d])?),
            None => None,
        };

        let sibling_ports: IndexMap<String, u16> = {
            let cells = self.cells.read().await;
            cells
                .iter()
                .map(|(n, c)| {
                    if n == name {
                        (n.clone(), port)
                    } else {
                        (n.clone(), c.runtime.port)
                    }
                })
                .collect()
        };

        let runtime = plan::build_runtime(
            &self.project,
            &spec,
            port,
            debug_port,
            &sibling_ports,
            &self.opts.plan,
        )?;

        let mut cells = self.cells.write().await;
        if let Some(cell) = cells.get_mut(name) {
            cell.runtime = runtime;
            cell.last_health = None;
        }
        Ok(())
    }

    /// Ordered shutdown: reverse dependency order, bounded by the shutdown
    /// deadline; services past the deadline are force-killed immediately.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + self.opts.shutdown_deadline;

        let names: Vec<String> = {
            let cells = self.cells.read().await;
            cells.keys().rev().cloned().collect()
        };
        for name in &names {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let grace = self.opts.grace.min(remaining);
            let _ = self.stop_service_with(name, grace).await;
        }

        // Drain leftovers: claims for services that never started, and the
        // steady-state tasks.
        let mut cells = self.cells.write().await;
        for (name, cell) in cells.iter_mut() {
            self.broker.release_service(name);
            for task in cell.tasks.drain(..) {
                task.abort();
            }
        }
    }

    pub async fn service_names(&self) -> Vec<String> {
        self.cells.read().await.keys().cloned().collect()
    }

    pub async fn view(&self, name: &str) -> Option<ServiceView> {
        let cells = self.cells.read().await;
        cells.get(name).map(|c| view_of(name, c))
    }

    pub async fn views(&self) -> Vec<ServiceView> {
        let cells = self.cells.read().await;
        cells.iter().map(|(n, c)| view_of(n, c)).collect()
    }

    pub async fn log_buffer(&self, name: &str) -> Option<Arc<LogBuffer>> {
        self.cells.read().await.get(name).map(|c| c.log.clone())
    }

    pub async fn prober(&self, name: &str) -> Option<Arc<HealthProber>> {
        self.cells.read().await.get(name).and_then(|c| c.prober.clone())
    }

    /// Failed services with their exit codes and captured log tails.
    pub async fn failures(&self) -> Vec<(String, Option<i32>, Vec<LogEntry>)> {
        let cells = self.cells.read().await;
        cells
            .iter()
            .filter(|(_, c)| c.status() == ServiceStatus::Failed)
            .map(|(n, c)| (n.clone(), c.exit_code, c.failure_tail.clone()))
            .collect()
    }

    pub async fn any_failed(&self) -> bool {
        let cells = self.cells.read().await;
        cells.values().any(|c| c.status() == ServiceStatus::Failed)
    }
}

fn view_of(name: &str, cell: &ServiceCell) -> ServiceView {
    let uptime_secs = cell
        .handle
        .as_ref()
        .filter(|_| cell.status().is_running())
        .map(|h| {
            Utc::now()
                .signed_duration_since(h.started_at)
                .num_seconds()
                .max(0) as u64
        });
    ServiceView {
        name: name.to_string(),
        kind: cell.runtime.spec.kind.label().to_string(),
        status: cell.status(),
        pid: cell.handle.as_ref().map(|h| h.pid),
        port: cell.runtime.port,
        debug_port: cell.runtime.debug_port,
        url: cell.runtime.url(),
        command: cell.runtime.rendered_command(),
        health: cell.last_health.clone(),
        uptime_secs,
        exit_code: cell.exit_code,
    }
}
