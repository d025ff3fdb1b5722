//! Supervisor for the local sidecar processes the host application depends
//! on: a graph/vector database, a memory/orchestration server, and the
//! speech-to-text and text-to-speech servers.
//!
//! Each service is a black box with two observable surfaces: a TCP listener
//! on its configured port and an HTTP `/health` endpoint. The supervisor
//! decides whether a service is already running (attach), launches it if
//! not, confirms it becomes healthy, recovers from crashes with exponential
//! backoff, and tears everything down on shutdown.

pub mod cli;
pub mod config;
pub mod error;
pub mod launcher;
pub mod ports;
pub mod probe;
pub mod registry;
pub mod supervisor;

pub use config::{DeployMode, ProbeSettings, RestartPolicy, Settings};
pub use error::SupervisorError;
pub use launcher::{LaunchPlan, LaunchPlanner};
pub use probe::Liveness;
pub use registry::{ServicePhase, ServiceStatus};
pub use supervisor::Supervisor;
