use std::io::ErrorKind;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::ProbeSettings;
use crate::error::SupervisorError;

/// Result of an HTTP health probe.
///
/// Any HTTP response counts as alive: this is a liveness check (is the
/// process reachable at all), deliberately not a readiness check. A service
/// answering 500s forever still shows up as `Responding`, which keeps the
/// ambiguity visible in the type instead of hidden in a boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Network-level failure: connection refused or timed out.
    Unreachable,
    /// Responded with a 2xx status.
    Healthy,
    /// Responded with a non-2xx status: alive but unverified.
    Responding,
}

impl Liveness {
    pub fn is_alive(self) -> bool {
        !matches!(self, Liveness::Unreachable)
    }
}

/// Raw TCP reachability check.
///
/// A timeout is treated as closed (assume nothing is listening rather than
/// block), a refused connection is closed, and any other connection error
/// is treated as occupied so we never contend for a port we cannot
/// positively rule out.
pub async fn is_port_open(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => true,
        Err(_elapsed) => false,
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => false,
        Ok(Err(e)) => {
            debug!(port, error = %e, "connect failed without refusal; treating port as occupied");
            true
        }
    }
}

/// Single HTTP GET against the service's `/health` endpoint.
pub async fn check_health(host: &str, port: u16, timeout: Duration) -> Liveness {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            debug!(error = %e, "building HTTP client failed");
            return Liveness::Unreachable;
        }
    };
    let url = format!("http://{host}:{port}/health");
    match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => Liveness::Healthy,
        Ok(response) => {
            debug!(port, status = %response.status(), "health endpoint answered with an error status");
            Liveness::Responding
        }
        Err(e) => {
            debug!(port, error = %e, "health endpoint unreachable");
            Liveness::Unreachable
        }
    }
}

/// Polls the health endpoint at a fixed cadence until the service is alive.
///
/// Exhausting the retry budget is a hard failure reported to the caller.
pub async fn wait_for_ready(
    service: &str,
    host: &str,
    port: u16,
    probe: &ProbeSettings,
) -> Result<(), SupervisorError> {
    let attempt = || async {
        match check_health(host, port, probe.health_timeout).await {
            Liveness::Unreachable => Err(anyhow::anyhow!("not reachable")),
            alive => Ok(alive),
        }
    };

    let result = attempt
        .retry(
            ConstantBuilder::default()
                .with_delay(probe.ready_interval)
                .with_max_times(probe.ready_max_retries),
        )
        .notify(|_err: &anyhow::Error, dur: Duration| {
            debug!(service, port, "not ready yet, retrying in {:?}", dur);
        })
        .await;

    match result {
        Ok(Liveness::Responding) => {
            debug!(service, port, "health endpoint answers with an error status; treating as alive");
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(_) => Err(SupervisorError::HealthTimeout(service.to_string())),
    }
}
