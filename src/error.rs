use std::path::PathBuf;
use thiserror::Error;

/// Failure taxonomy for the supervisor.
///
/// Transient process-level failures (a single crash) are recovered inside
/// the restart loop and never surface here. These are the structural
/// conditions the host application has to decide about.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The ports file never assigned this service a port; a service is
    /// never spawned while its port is unresolved.
    #[error("service '{0}' has no resolved port")]
    PortUnresolved(String),

    /// The executable was missing or unlaunchable. Distinct from a crash:
    /// no process ever existed, so no restart is scheduled.
    #[error("failed to spawn service '{service}': {source}")]
    SpawnFailure {
        service: String,
        #[source]
        source: std::io::Error,
    },

    /// The process spawned but never answered the health endpoint within
    /// the poll budget.
    #[error("service '{0}' did not become healthy within the poll budget")]
    HealthTimeout(String),

    /// The restart budget was exhausted inside the stability window. The
    /// service is never spawned again for this supervisor's lifetime.
    #[error("service '{0}' exceeded its restart budget and was given up")]
    GivenUp(String),

    /// The ports file exists but could not be parsed. Resolution degrades
    /// to whatever ports are already known rather than aborting startup.
    #[error("failed to load ports config from {path}: {reason}")]
    ConfigLoadFailure { path: PathBuf, reason: String },

    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("supervisor has already been started")]
    AlreadyStarted,

    #[error("supervisor is shutting down")]
    ShuttingDown,

    /// One or more sibling services failed to reach readiness. The others
    /// were not cancelled; this aggregates what went wrong.
    #[error("startup failed for {} service(s): {}", .0.len(), .0.join("; "))]
    StartupFailed(Vec<String>),
}
