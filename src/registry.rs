use std::collections::BTreeMap;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::ports::PortsConfig;

/// The database every other service depends on. It is started and awaited
/// before any sibling spawn is attempted.
pub const FOUNDATIONAL: &str = "surreal";
pub const MEMORY: &str = "memory";
pub const STT: &str = "stt";
pub const TTS: &str = "tts";

/// Launch template for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Dedicated executable with its own argument template (the database).
    NativeBinary,
    /// Launched through the shared sibling entry point with the service
    /// name as its sole argument.
    InterpretedService,
}

/// Per-service lifecycle state.
///
/// `Stopped -> Starting -> Ready`, with failure paths
/// `Starting -> SpawnFailed` (terminal for the attempt),
/// `Starting -> Unresponsive` (spawned but never healthy) and
/// `Ready -> Crashed -> Backoff -> Starting` (cyclic) or
/// `Backoff -> GivenUp` (terminal for the supervisor's lifetime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServicePhase {
    Stopped,
    Starting,
    Ready,
    /// Spawned and still running, but never answered the health endpoint
    /// within the poll budget.
    Unresponsive,
    SpawnFailed,
    Crashed,
    Backoff { attempt: u32 },
    GivenUp,
}

/// Tracks a process spawned by this supervisor. Ownership of the OS child
/// lives in its monitor task; cancelling `kill` terminates it.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub kill: CancellationToken,
}

/// One managed service: static definition plus mutable runtime state.
/// Owned exclusively by the supervisor loop and mutated only by it.
#[derive(Debug)]
pub struct ServiceDescriptor {
    pub name: &'static str,
    pub kind: ServiceKind,
    /// `0` means unresolved; a service is never spawned while its port is 0.
    pub port: u16,
    /// Present only while the process is believed to be running under this
    /// supervisor's control. Absent for attached (externally-owned) services.
    pub process: Option<ProcessHandle>,
    /// Set only after a successful health probe.
    pub ready: bool,
    /// Monotonic within a crash-loop window.
    pub restart_count: u32,
    pub last_exit: Option<Instant>,
    pub phase: ServicePhase,
}

impl ServiceDescriptor {
    fn new(name: &'static str, kind: ServiceKind) -> Self {
        Self {
            name,
            kind,
            port: 0,
            process: None,
            ready: false,
            restart_count: 0,
            last_exit: None,
            phase: ServicePhase::Stopped,
        }
    }

    /// The handle and the ready flag are cleared together whenever the
    /// process goes away, regardless of cause.
    pub fn clear_process(&mut self) {
        self.process = None;
        self.ready = false;
    }
}

/// Read-only snapshot of a descriptor, handed to callers outside the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub ready: bool,
    pub restart_count: u32,
    pub phase: ServicePhase,
}

impl From<&ServiceDescriptor> for ServiceStatus {
    fn from(svc: &ServiceDescriptor) -> Self {
        Self {
            name: svc.name.to_string(),
            port: svc.port,
            pid: svc.process.as_ref().and_then(|p| p.pid),
            ready: svc.ready,
            restart_count: svc.restart_count,
            phase: svc.phase.clone(),
        }
    }
}

/// In-memory table of every managed service.
#[derive(Debug)]
pub struct ServiceRegistry {
    services: BTreeMap<&'static str, ServiceDescriptor>,
}

impl ServiceRegistry {
    /// The static service definitions. Ports are filled in from the ports
    /// file during startup.
    pub fn with_default_services() -> Self {
        let mut services = BTreeMap::new();
        for (name, kind) in [
            (FOUNDATIONAL, ServiceKind::NativeBinary),
            (MEMORY, ServiceKind::InterpretedService),
            (STT, ServiceKind::InterpretedService),
            (TTS, ServiceKind::InterpretedService),
        ] {
            services.insert(name, ServiceDescriptor::new(name, kind));
        }
        Self { services }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServiceDescriptor> {
        self.services.get_mut(name)
    }

    /// Every managed service except the foundational database.
    pub fn siblings(&self) -> Vec<&'static str> {
        self.services
            .keys()
            .copied()
            .filter(|name| *name != FOUNDATIONAL)
            .collect()
    }

    pub fn services_mut(&mut self) -> impl Iterator<Item = &mut ServiceDescriptor> {
        self.services.values_mut()
    }

    /// Copies resolved ports into the descriptors by name. Unknown keys in
    /// the config are ignored; services missing from it keep their prior
    /// value.
    pub fn apply_ports(&mut self, config: &PortsConfig) {
        for svc in self.services.values_mut() {
            if let Some(port) = config.get(svc.name) {
                svc.port = port;
            }
        }
    }

    /// Full service-name to port snapshot for downstream consumers.
    pub fn ports(&self) -> BTreeMap<String, u16> {
        self.services
            .values()
            .map(|svc| (svc.name.to_string(), svc.port))
            .collect()
    }
}
