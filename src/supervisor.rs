use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{ProbeSettings, Settings};
use crate::error::SupervisorError;
use crate::launcher::{LaunchPlan, LaunchPlanner, ProcessLauncher};
use crate::ports::PortResolver;
use crate::probe;
use crate::registry::{
    ProcessHandle, ServicePhase, ServiceRegistry, ServiceStatus, FOUNDATIONAL, STT,
};

const LOCALHOST: &str = "127.0.0.1";

type Reply = oneshot::Sender<Result<(), SupervisorError>>;

/// Messages consumed by the supervisor loop. Every registry mutation happens
/// in the loop task; probes, process monitors, and restart timers report
/// back through these instead of touching shared state.
#[derive(Debug)]
enum Event {
    StartRequested {
        service: String,
        reply: Option<Reply>,
    },
    /// An already-running healthy instance owns the port; use it.
    Attached { service: String },
    /// The port is occupied by something that does not answer health checks.
    Conflict { service: String },
    Spawned {
        service: String,
        handle: ProcessHandle,
    },
    SpawnFailed { service: String, error: String },
    BecameReady { service: String },
    ReadyTimeout { service: String },
    Exited {
        service: String,
        code: Option<i32>,
    },
    Query {
        service: String,
        reply: oneshot::Sender<Option<ServiceStatus>>,
    },
}

/// Handle owned by the host application.
///
/// Explicitly constructed and passed around rather than a process-global
/// singleton, so independent supervisors (with isolated registries) can
/// coexist in tests.
pub struct Supervisor {
    settings: Settings,
    planner: Arc<dyn LaunchPlanner>,
    ports: BTreeMap<String, u16>,
    events_tx: Option<mpsc::UnboundedSender<Event>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    /// Present until `start()` hands it to the loop task.
    registry: Option<ServiceRegistry>,
}

impl Supervisor {
    pub fn new(settings: Settings) -> Self {
        let planner = Arc::new(ProcessLauncher::new(settings.clone()));
        Self::with_planner(settings, planner)
    }

    pub fn with_planner(settings: Settings, planner: Arc<dyn LaunchPlanner>) -> Self {
        Self {
            settings,
            planner,
            ports: BTreeMap::new(),
            events_tx: None,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            registry: Some(ServiceRegistry::with_default_services()),
        }
    }

    /// Resolves ports, then brings every service up: the foundational
    /// database first (awaited, since the siblings assume it is reachable),
    /// then the siblings concurrently with join semantics.
    ///
    /// Fails if the database or any sibling cannot reach readiness; sibling
    /// failures are aggregated without cancelling the other starts.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        let mut registry = self
            .registry
            .take()
            .ok_or(SupervisorError::AlreadyStarted)?;

        let resolver = PortResolver::new(self.settings.ports_path());
        registry.apply_ports(&resolver.load());
        self.ports = registry.ports();
        let siblings = registry.siblings();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.events_tx = Some(events_tx.clone());
        let sup_loop = SupervisorLoop {
            registry,
            planner: Arc::clone(&self.planner),
            settings: self.settings.clone(),
            events_tx,
            events_rx,
            shutdown: self.shutdown.clone(),
            tracker: self.tracker.clone(),
        };
        self.tracker.spawn(sup_loop.run());

        self.request_start(FOUNDATIONAL).await?;

        let results = join_all(siblings.iter().map(|name| self.request_start(name))).await;
        let failures: Vec<String> = siblings
            .iter()
            .zip(results)
            .filter_map(|(name, result)| result.err().map(|e| format!("{name}: {e}")))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::StartupFailed(failures))
        }
    }

    async fn request_start(&self, service: &str) -> Result<(), SupervisorError> {
        let tx = self
            .events_tx
            .as_ref()
            .ok_or(SupervisorError::ShuttingDown)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Event::StartRequested {
            service: service.to_string(),
            reply: Some(reply_tx),
        })
        .map_err(|_| SupervisorError::ShuttingDown)?;
        reply_rx.await.map_err(|_| SupervisorError::ShuttingDown)?
    }

    /// Best-effort shutdown: flips the shutdown flag. The loop terminates
    /// every tracked process and every pending restart timer checks the flag
    /// before acting.
    pub fn stop(&self) {
        info!("stopping supervised services");
        self.shutdown.cancel();
    }

    /// Waits for the loop, process monitors, and timers to wind down after
    /// [`stop`](Self::stop).
    pub async fn wait_stopped(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// The full service-name to port mapping for downstream consumers.
    /// Available (and stable) from the moment `start()` resolved ports,
    /// including after shutdown.
    pub fn service_ports(&self) -> BTreeMap<String, u16> {
        self.ports.clone()
    }

    /// Speech websocket endpoint, derived from the STT service's port.
    pub fn websocket_url(&self) -> Option<String> {
        match self.ports.get(STT) {
            Some(port) if *port != 0 => Some(format!("ws://{LOCALHOST}:{port}")),
            _ => None,
        }
    }

    /// Snapshot of one service's runtime state.
    pub async fn service_status(
        &self,
        service: &str,
    ) -> Result<ServiceStatus, SupervisorError> {
        // Before start() the registry still lives here.
        if let Some(registry) = &self.registry {
            return registry
                .get(service)
                .map(ServiceStatus::from)
                .ok_or_else(|| SupervisorError::UnknownService(service.to_string()));
        }
        let tx = self
            .events_tx
            .as_ref()
            .ok_or(SupervisorError::ShuttingDown)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Event::Query {
            service: service.to_string(),
            reply: reply_tx,
        })
        .map_err(|_| SupervisorError::ShuttingDown)?;
        reply_rx
            .await
            .map_err(|_| SupervisorError::ShuttingDown)?
            .ok_or_else(|| SupervisorError::UnknownService(service.to_string()))
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// SupervisorLoop — single writer for the registry
// ---------------------------------------------------------------------------

struct SupervisorLoop {
    registry: ServiceRegistry,
    planner: Arc<dyn LaunchPlanner>,
    settings: Settings,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl SupervisorLoop {
    async fn run(mut self) {
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.terminate_all();
                    break;
                }
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                }
            }
        }
        debug!("supervisor loop exited");
    }

    /// Handlers never await; long-running work (probes, readiness polling,
    /// process waits, backoff timers) runs in auxiliary tasks that report
    /// back through the event channel.
    fn handle(&mut self, event: Event) {
        match event {
            Event::StartRequested { service, reply } => self.handle_start(service, reply),
            Event::Attached { service } => {
                if let Some(svc) = self.registry.get_mut(&service) {
                    svc.ready = true;
                    svc.phase = ServicePhase::Ready;
                }
            }
            Event::Conflict { service } => {
                if let Some(svc) = self.registry.get_mut(&service) {
                    svc.ready = false;
                    svc.phase = ServicePhase::Stopped;
                }
            }
            Event::Spawned { service, handle } => {
                if let Some(svc) = self.registry.get_mut(&service) {
                    svc.process = Some(handle);
                }
            }
            Event::SpawnFailed { service, error } => {
                error!(service = %service, error = %error, "spawn failed; service left not ready, no restart scheduled");
                if let Some(svc) = self.registry.get_mut(&service) {
                    svc.clear_process();
                    svc.phase = ServicePhase::SpawnFailed;
                }
            }
            Event::BecameReady { service } => {
                if let Some(svc) = self.registry.get_mut(&service) {
                    if svc.phase == ServicePhase::Starting {
                        info!(service = %service, port = svc.port, "service is ready");
                        svc.ready = true;
                        svc.phase = ServicePhase::Ready;
                    }
                }
            }
            Event::ReadyTimeout { service } => {
                warn!(service = %service, "service never became healthy within the poll budget");
                if let Some(svc) = self.registry.get_mut(&service) {
                    // A crash may already have moved the phase on; only an
                    // attempt still waiting is marked unresponsive.
                    if svc.phase == ServicePhase::Starting {
                        svc.phase = ServicePhase::Unresponsive;
                    }
                }
            }
            Event::Exited { service, code } => self.handle_exit(service, code),
            Event::Query { service, reply } => {
                let _ = reply.send(self.registry.get(&service).map(ServiceStatus::from));
            }
        }
    }

    fn handle_start(&mut self, service: String, reply: Option<Reply>) {
        if self.shutdown.is_cancelled() {
            respond(reply, Err(SupervisorError::ShuttingDown));
            return;
        }
        let Some(svc) = self.registry.get(&service) else {
            respond(reply, Err(SupervisorError::UnknownService(service)));
            return;
        };
        if svc.phase == ServicePhase::GivenUp {
            warn!(service = %service, "service was given up; refusing to start");
            respond(reply, Err(SupervisorError::GivenUp(service)));
            return;
        }
        if svc.port == 0 {
            error!(service = %service, "no resolved port; refusing to start");
            respond(reply, Err(SupervisorError::PortUnresolved(service)));
            return;
        }
        if svc.process.is_some() || svc.phase == ServicePhase::Starting {
            debug!(service = %service, "already running or starting");
            respond(reply, Ok(()));
            return;
        }

        let port = svc.port;
        let plan = match self.planner.resolve(svc) {
            Ok(plan) => plan,
            Err(e) => {
                error!(service = %service, error = %e, "launch resolution failed");
                if let Some(svc) = self.registry.get_mut(&service) {
                    svc.phase = ServicePhase::SpawnFailed;
                }
                respond(reply, Err(e));
                return;
            }
        };

        if let Some(svc) = self.registry.get_mut(&service) {
            svc.phase = ServicePhase::Starting;
        }
        let probe = self.settings.probe.clone();
        let events = self.events_tx.clone();
        let shutdown = self.shutdown.clone();
        let tracker = self.tracker.clone();
        self.tracker.spawn(start_attempt(
            service, port, plan, probe, events, shutdown, tracker, reply,
        ));
    }

    /// Restart policy. A clean exit (code 0) is a deliberate stop; a death
    /// without an exit code (signal) does not restart either. Non-zero exits
    /// feed the crash-loop counter and exponential backoff.
    fn handle_exit(&mut self, service: String, code: Option<i32>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let policy = self.settings.restart.clone();
        let Some(svc) = self.registry.get_mut(&service) else {
            return;
        };
        svc.clear_process();
        info!(service = %service, code = ?code, "process exited");

        match code {
            Some(0) => {
                svc.phase = ServicePhase::Stopped;
            }
            None => {
                warn!(service = %service, "terminated by signal; not restarting");
                svc.phase = ServicePhase::Stopped;
            }
            Some(code) => {
                svc.phase = ServicePhase::Crashed;
                let now = Instant::now();
                if let Some(last) = svc.last_exit {
                    if now.duration_since(last) > policy.stable_window {
                        debug!(service = %service, "stable window elapsed; resetting restart counter");
                        svc.restart_count = 0;
                    }
                }
                svc.restart_count += 1;
                svc.last_exit = Some(now);

                if svc.restart_count > policy.max_restarts {
                    error!(
                        service = %service,
                        restarts = svc.restart_count,
                        "restart budget exhausted; giving up on this service"
                    );
                    svc.phase = ServicePhase::GivenUp;
                    return;
                }

                let delay = policy.backoff_delay(svc.restart_count);
                warn!(
                    service = %service,
                    code,
                    attempt = svc.restart_count,
                    delay_ms = delay.as_millis() as u64,
                    "crashed; restarting after backoff"
                );
                svc.phase = ServicePhase::Backoff {
                    attempt: svc.restart_count,
                };

                let events = self.events_tx.clone();
                let shutdown = self.shutdown.clone();
                self.tracker.spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            // Checked again at fire time: a timer scheduled
                            // before shutdown must not spawn anything after.
                            if shutdown.is_cancelled() {
                                return;
                            }
                            let _ = events.send(Event::StartRequested {
                                service,
                                reply: None,
                            });
                        }
                        _ = shutdown.cancelled() => {}
                    }
                });
            }
        }
    }

    /// Force-terminates everything this supervisor spawned. Best-effort and
    /// continue-on-error; attached services are left alone, their ready
    /// state included.
    fn terminate_all(&mut self) {
        for svc in self.registry.services_mut() {
            if let Some(handle) = svc.process.take() {
                info!(service = svc.name, pid = ?handle.pid, "terminating process");
                handle.kill.cancel();
                svc.ready = false;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Start attempt — probe, attach-or-spawn, readiness
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn start_attempt(
    service: String,
    port: u16,
    plan: LaunchPlan,
    probe_cfg: ProbeSettings,
    events: mpsc::UnboundedSender<Event>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    reply: Option<Reply>,
) {
    if probe::is_port_open(LOCALHOST, port, probe_cfg.connect_timeout).await {
        let liveness = probe::check_health(LOCALHOST, port, probe_cfg.health_timeout).await;
        if liveness.is_alive() {
            // Something already owns this port and answers health checks,
            // possibly a previous supervisor instance. Use it.
            info!(service = %service, port, "healthy instance already listening; attaching");
            let _ = events.send(Event::Attached { service });
            respond(reply, Ok(()));
        } else {
            warn!(
                service = %service,
                port,
                "port occupied by an unresponsive process; refusing to spawn"
            );
            let _ = events.send(Event::Conflict { service });
            // Observable and recoverable, not a startup error.
            respond(reply, Ok(()));
        }
        return;
    }

    // The shutdown flag is consulted before the spawn step, not mid-probe.
    if shutdown.is_cancelled() {
        respond(reply, Err(SupervisorError::ShuttingDown));
        return;
    }

    let kill = CancellationToken::new();
    if let Err(e) = spawn_plan(&service, &plan, kill, &shutdown, &events, &tracker) {
        let _ = events.send(Event::SpawnFailed {
            service: service.clone(),
            error: e.to_string(),
        });
        respond(reply, Err(e));
        return;
    }

    match probe::wait_for_ready(&service, LOCALHOST, port, &probe_cfg).await {
        Ok(()) => {
            let _ = events.send(Event::BecameReady { service });
            respond(reply, Ok(()));
        }
        Err(e) => {
            let _ = events.send(Event::ReadyTimeout { service });
            respond(reply, Err(e));
        }
    }
}

/// Spawns the process with captured stdio, forwards its output as
/// per-service log lines, and wires a monitor task that reports the exit
/// through the event channel.
///
/// The `Spawned` event is enqueued before the monitor task exists, so the
/// loop can never observe a process's exit ahead of the spawn that produced
/// it. A fast-exiting child would otherwise leave a stale handle in the
/// registry and block every later restart behind the double-spawn guard.
fn spawn_plan(
    service: &str,
    plan: &LaunchPlan,
    kill: CancellationToken,
    shutdown: &CancellationToken,
    events: &mpsc::UnboundedSender<Event>,
    tracker: &TaskTracker,
) -> Result<(), SupervisorError> {
    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args);
    if let Some(dir) = &plan.cwd {
        cmd.current_dir(dir);
    }
    cmd.envs(&plan.env);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailure {
        service: service.to_string(),
        source: e,
    })?;
    let pid = child.id();
    info!(
        service = %service,
        pid = ?pid,
        program = %plan.program.display(),
        "process spawned"
    );

    if let Some(out) = child.stdout.take() {
        tracker.spawn(forward_output(service.to_string(), out, false));
    }
    if let Some(err) = child.stderr.take() {
        tracker.spawn(forward_output(service.to_string(), err, true));
    }

    let _ = events.send(Event::Spawned {
        service: service.to_string(),
        handle: ProcessHandle {
            pid,
            kill: kill.clone(),
        },
    });

    let name = service.to_string();
    let events = events.clone();
    let shutdown = shutdown.clone();
    tracker.spawn(async move {
        tokio::select! {
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code());
                let _ = events.send(Event::Exited { service: name, code });
            }
            _ = kill.cancelled() => {
                let _ = child.kill().await;
            }
            _ = shutdown.cancelled() => {
                let _ = child.kill().await;
            }
        }
    });

    Ok(())
}

async fn forward_output<R>(service: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = line.trim_end_matches(['\n', '\r']);
                if is_stderr {
                    warn!(service = %service, "{text}");
                } else {
                    info!(service = %service, "{text}");
                }
            }
            Err(e) => {
                warn!(service = %service, error = %e, "output read error");
                break;
            }
        }
    }
}

fn respond(reply: Option<Reply>, result: Result<(), SupervisorError>) {
    if let Some(tx) = reply {
        let _ = tx.send(result);
    }
}
