use std::path::PathBuf;
use std::time::Duration;

/// How the host application is being run. Controls where executables,
/// scripts, and the ports file are looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployMode {
    /// Running from a source checkout; sibling services run under an
    /// interpreter.
    Development,
    /// Running from a packaged, self-contained resource tree.
    Deployed,
}

impl DeployMode {
    /// Environment name handed to every spawned service.
    pub fn env_name(&self) -> &'static str {
        match self {
            DeployMode::Development => "development",
            DeployMode::Deployed => "production",
        }
    }
}

/// Timeouts and cadence for the health probes. The probes must never stall
/// the supervisor, so every network operation here is bounded.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Budget for the raw TCP reachability check.
    pub connect_timeout: Duration,
    /// Budget for a single HTTP GET /health request.
    pub health_timeout: Duration,
    /// Number of retries before `wait_for_ready` reports a hard failure.
    pub ready_max_retries: usize,
    /// Spacing between readiness polls.
    pub ready_interval: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            health_timeout: Duration::from_secs(2),
            ready_max_retries: 30,
            ready_interval: Duration::from_secs(1),
        }
    }
}

/// Crash-loop restart policy.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Restarts allowed within the stable window before the service is
    /// given up for the lifetime of the supervisor.
    pub max_restarts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// A crash this long after the previous one resets the restart counter.
    pub stable_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            stable_window: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    /// Backoff before restart attempt `restart_count` (1-indexed):
    /// `min(initial * 2^restart_count, max)`. Deterministic so the schedule
    /// is observable and non-decreasing up to the cap.
    pub fn backoff_delay(&self, restart_count: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(2u64.saturating_pow(restart_count));
        Duration::from_millis(exp_ms.min(self.max_delay.as_millis() as u64))
    }
}

/// Everything the supervisor needs to know about its surroundings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: DeployMode,
    /// Source checkout root (development mode).
    pub app_root: PathBuf,
    /// Packaged resource root (deployed mode).
    pub resources_dir: PathBuf,
    /// User-data directory passed to every service and used for database
    /// storage in development.
    pub data_dir: PathBuf,
    /// Lite/full capability flag forwarded to every service.
    pub lite: bool,
    pub probe: ProbeSettings,
    pub restart: RestartPolicy,
}

impl Settings {
    pub fn development(app_root: PathBuf) -> Self {
        Self {
            mode: DeployMode::Development,
            resources_dir: app_root.join("resources"),
            app_root,
            data_dir: default_data_dir(),
            lite: false,
            probe: ProbeSettings::default(),
            restart: RestartPolicy::default(),
        }
    }

    pub fn deployed(resources_dir: PathBuf) -> Self {
        Self {
            mode: DeployMode::Deployed,
            app_root: resources_dir.clone(),
            resources_dir,
            data_dir: default_data_dir(),
            lite: false,
            probe: ProbeSettings::default(),
            restart: RestartPolicy::default(),
        }
    }

    /// Location of the ports file: the single source of truth mapping
    /// service name to TCP port.
    pub fn ports_path(&self) -> PathBuf {
        match self.mode {
            DeployMode::Development => self.app_root.join("ports.json"),
            DeployMode::Deployed => self.resources_dir.join("ports.json"),
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sidekick")
}
