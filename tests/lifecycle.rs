//! End-to-end supervisor scenarios.
//!
//! Managed services are stood in for by in-process TCP/HTTP stubs (for the
//! attach and conflict paths) and by a fake launch planner driving
//! short-lived `sh` processes (for the crash/backoff paths), so no real
//! service tree is required.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use sidekick::config::{ProbeSettings, RestartPolicy, Settings};
use sidekick::error::SupervisorError;
use sidekick::launcher::{LaunchPlan, LaunchPlanner};
use sidekick::registry::{ServiceDescriptor, ServicePhase, ServiceStatus};
use sidekick::supervisor::Supervisor;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Minimal HTTP server answering every request with the given status line.
async fn http_stub(status_line: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                let _ = sock.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = sock.write_all(response.as_bytes()).await;
            });
        }
    });
    port
}

/// A listener that accepts connections but never speaks HTTP: the port is
/// open, but health checks fail.
async fn silent_stub() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                break;
            };
            held.push(sock);
        }
    });
    port
}

/// A port nothing listens on.
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn write_ports_file(root: &Path, ports: &[(&str, u16)]) {
    let map: BTreeMap<String, u16> = ports
        .iter()
        .map(|(name, port)| (format!("{name}_port"), *port))
        .collect();
    std::fs::write(
        root.join("ports.json"),
        serde_json::to_string_pretty(&map).unwrap(),
    )
    .unwrap();
}

/// Development-mode settings with probe and restart timings fast enough for
/// tests.
fn fast_settings(root: &Path) -> Settings {
    let mut settings = Settings::development(root.to_path_buf());
    settings.data_dir = root.join("data");
    settings.probe = ProbeSettings {
        connect_timeout: Duration::from_millis(200),
        health_timeout: Duration::from_millis(300),
        ready_max_retries: 2,
        ready_interval: Duration::from_millis(20),
    };
    settings.restart = RestartPolicy {
        max_restarts: 2,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        stable_window: Duration::from_secs(60),
    };
    settings
}

/// Launch planner that counts resolutions and hands every service the same
/// throwaway shell command.
struct FakePlanner {
    program: PathBuf,
    args: Vec<String>,
    resolves: AtomicUsize,
}

impl FakePlanner {
    fn shell(script: &str) -> Arc<Self> {
        Arc::new(Self {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            resolves: AtomicUsize::new(0),
        })
    }

    fn broken() -> Arc<Self> {
        Arc::new(Self {
            program: PathBuf::from("/nonexistent/sidekick-test-binary"),
            args: Vec::new(),
            resolves: AtomicUsize::new(0),
        })
    }

    fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

impl LaunchPlanner for FakePlanner {
    fn resolve(&self, _svc: &ServiceDescriptor) -> Result<LaunchPlan, SupervisorError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        Ok(LaunchPlan {
            program: self.program.clone(),
            args: self.args.clone(),
            cwd: None,
            env: BTreeMap::new(),
        })
    }
}

/// Polls a service's status until the predicate holds.
async fn wait_for_status(
    supervisor: &Supervisor,
    service: &str,
    timeout: Duration,
    pred: impl Fn(&ServiceStatus) -> bool,
) -> ServiceStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = supervisor.service_status(service).await.unwrap();
        if pred(&status) {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {service}; last status: {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ---------------------------------------------------------------------------
// Attach / conflict paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn attaches_to_already_running_healthy_services() {
    let dir = tempfile::tempdir().unwrap();
    let surreal = http_stub("200 OK").await;
    let memory = http_stub("200 OK").await;
    let stt = http_stub("200 OK").await;
    let tts = http_stub("200 OK").await;
    write_ports_file(
        dir.path(),
        &[
            ("surreal", surreal),
            ("memory", memory),
            ("stt", stt),
            ("tts", tts),
        ],
    );

    let planner = FakePlanner::shell("exit 1");
    let mut supervisor = Supervisor::with_planner(fast_settings(dir.path()), planner.clone());
    supervisor.start().await.expect("start should attach");

    for service in ["surreal", "memory", "stt", "tts"] {
        let status = supervisor.service_status(service).await.unwrap();
        assert!(status.ready, "{service} should be ready");
        assert_eq!(status.phase, ServicePhase::Ready);
        // Attach semantics: no process of our own.
        assert_eq!(status.pid, None);
    }
    // Nothing was ever resolved, let alone spawned.
    assert_eq!(planner.resolves(), 0);

    assert_eq!(
        supervisor.websocket_url().as_deref(),
        Some(format!("ws://127.0.0.1:{stt}").as_str())
    );
    assert_eq!(supervisor.service_ports().get("memory"), Some(&memory));

    supervisor.stop();
    supervisor.wait_stopped().await;
}

#[tokio::test]
async fn responding_with_errors_still_counts_as_alive() {
    // Loose liveness: any HTTP response means something owns the port.
    let dir = tempfile::tempdir().unwrap();
    let ports = [
        ("surreal", http_stub("503 Service Unavailable").await),
        ("memory", http_stub("200 OK").await),
        ("stt", http_stub("200 OK").await),
        ("tts", http_stub("200 OK").await),
    ];
    write_ports_file(dir.path(), &ports);

    let planner = FakePlanner::shell("exit 1");
    let mut supervisor = Supervisor::with_planner(fast_settings(dir.path()), planner.clone());
    supervisor.start().await.expect("start should attach");

    let status = supervisor.service_status("surreal").await.unwrap();
    assert!(status.ready);
    assert_eq!(planner.resolves(), 0);

    supervisor.stop();
    supervisor.wait_stopped().await;
}

#[tokio::test]
async fn refuses_to_contend_for_an_occupied_unresponsive_port() {
    let dir = tempfile::tempdir().unwrap();
    write_ports_file(
        dir.path(),
        &[
            ("surreal", http_stub("200 OK").await),
            ("memory", http_stub("200 OK").await),
            ("stt", http_stub("200 OK").await),
            ("tts", silent_stub().await),
        ],
    );

    let planner = FakePlanner::shell("exit 1");
    let mut supervisor = Supervisor::with_planner(fast_settings(dir.path()), planner.clone());
    // A port conflict is observable, not a startup error.
    supervisor.start().await.expect("start should succeed");

    let status = supervisor.service_status("tts").await.unwrap();
    assert!(!status.ready);
    assert_eq!(status.pid, None);
    assert_eq!(status.phase, ServicePhase::Stopped);
    assert_eq!(planner.resolves(), 0);

    supervisor.stop();
    supervisor.wait_stopped().await;
}

// ---------------------------------------------------------------------------
// Port resolution failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_ports_file_leaves_services_unspawnable() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ports.json"), "{ not json").unwrap();

    let planner = FakePlanner::shell("exit 1");
    let mut supervisor = Supervisor::with_planner(fast_settings(dir.path()), planner.clone());

    // Resolution degrades to an empty mapping; every port stays 0 and a
    // service is never spawned while its port is unresolved.
    let err = supervisor.start().await.unwrap_err();
    assert!(
        matches!(err, SupervisorError::PortUnresolved(_)),
        "unexpected error: {err}"
    );
    assert_eq!(planner.resolves(), 0);
    assert_eq!(supervisor.websocket_url(), None);

    supervisor.stop();
    supervisor.wait_stopped().await;
}

// ---------------------------------------------------------------------------
// Crash loop / backoff / give-up
// ---------------------------------------------------------------------------

/// Ports file pointing every service at a port nothing listens on, so every
/// start goes down the spawn path.
fn closed_ports_file(root: &Path) {
    write_ports_file(
        root,
        &[
            ("surreal", closed_port()),
            ("memory", closed_port()),
            ("stt", closed_port()),
            ("tts", closed_port()),
        ],
    );
}

#[tokio::test]
async fn crash_loop_exhausts_budget_and_gives_up() {
    let dir = tempfile::tempdir().unwrap();
    closed_ports_file(dir.path());

    let planner = FakePlanner::shell("exit 1");
    let mut supervisor = Supervisor::with_planner(fast_settings(dir.path()), planner.clone());

    // The foundational service never becomes healthy, so start() fails; the
    // crash-loop machinery keeps running in the background regardless.
    let err = supervisor.start().await.unwrap_err();
    assert!(
        matches!(err, SupervisorError::HealthTimeout(_)),
        "unexpected error: {err}"
    );

    let status = wait_for_status(&supervisor, "surreal", Duration::from_secs(10), |s| {
        s.phase == ServicePhase::GivenUp
    })
    .await;
    // Budget of 2: crash 3 pushes the counter past it.
    assert_eq!(status.restart_count, 3);
    let resolves = planner.resolves();
    assert_eq!(resolves, 3);

    // Terminal: no further spawn attempts for the supervisor's lifetime.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(planner.resolves(), resolves);
    let status = supervisor.service_status("surreal").await.unwrap();
    assert_eq!(status.phase, ServicePhase::GivenUp);

    supervisor.stop();
    supervisor.wait_stopped().await;
}

#[tokio::test]
async fn repeated_crashes_within_budget_keep_restarting() {
    let dir = tempfile::tempdir().unwrap();
    closed_ports_file(dir.path());

    let planner = FakePlanner::shell("exit 1");
    let mut settings = fast_settings(dir.path());
    settings.restart.max_restarts = 5;
    let mut supervisor = Supervisor::with_planner(settings, planner.clone());

    let _ = supervisor.start().await;

    let status = wait_for_status(&supervisor, "surreal", Duration::from_secs(10), |s| {
        s.restart_count >= 3
    })
    .await;
    assert_ne!(status.phase, ServicePhase::GivenUp);

    supervisor.stop();
    supervisor.wait_stopped().await;
}

#[tokio::test]
async fn stable_window_resets_the_restart_counter() {
    let dir = tempfile::tempdir().unwrap();
    closed_ports_file(dir.path());

    let planner = FakePlanner::shell("exit 1");
    let mut settings = fast_settings(dir.path());
    // Every crash lands outside the (tiny) stability window, so the counter
    // resets each time and the budget of 1 is never exceeded.
    settings.restart = RestartPolicy {
        max_restarts: 1,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(80),
        stable_window: Duration::from_millis(1),
    };
    let mut supervisor = Supervisor::with_planner(settings, planner.clone());

    let _ = supervisor.start().await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let status = supervisor.service_status("surreal").await.unwrap();
    assert_ne!(status.phase, ServicePhase::GivenUp);
    assert_eq!(status.restart_count, 1);
    assert!(planner.resolves() > 2, "should keep restarting");

    supervisor.stop();
    supervisor.wait_stopped().await;
}

#[tokio::test]
async fn clean_exit_is_not_restarted() {
    let dir = tempfile::tempdir().unwrap();
    closed_ports_file(dir.path());

    let planner = FakePlanner::shell("exit 0");
    let mut supervisor = Supervisor::with_planner(fast_settings(dir.path()), planner.clone());

    let _ = supervisor.start().await;

    let status = wait_for_status(&supervisor, "surreal", Duration::from_secs(5), |s| {
        s.phase == ServicePhase::Stopped
    })
    .await;
    assert_eq!(status.restart_count, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(planner.resolves(), 1);

    supervisor.stop();
    supervisor.wait_stopped().await;
}

#[tokio::test]
async fn running_but_never_healthy_service_is_reported_unresponsive() {
    let dir = tempfile::tempdir().unwrap();
    closed_ports_file(dir.path());

    // Spawns fine, keeps running, never serves /health.
    let planner = FakePlanner::shell("sleep 5");
    let mut supervisor = Supervisor::with_planner(fast_settings(dir.path()), planner.clone());

    let err = supervisor.start().await.unwrap_err();
    assert!(
        matches!(err, SupervisorError::HealthTimeout(_)),
        "unexpected error: {err}"
    );

    // Observable as unresponsive rather than stuck in a starting state.
    let status = wait_for_status(&supervisor, "surreal", Duration::from_secs(5), |s| {
        s.phase == ServicePhase::Unresponsive
    })
    .await;
    assert!(!status.ready);
    assert!(status.pid.is_some(), "the process is still tracked");

    supervisor.stop();
    supervisor.wait_stopped().await;
}

#[tokio::test]
async fn spawn_failure_schedules_no_retry() {
    let dir = tempfile::tempdir().unwrap();
    closed_ports_file(dir.path());

    let planner = FakePlanner::broken();
    let mut supervisor = Supervisor::with_planner(fast_settings(dir.path()), planner.clone());

    let err = supervisor.start().await.unwrap_err();
    assert!(
        matches!(err, SupervisorError::SpawnFailure { .. }),
        "unexpected error: {err}"
    );

    let status = supervisor.service_status("surreal").await.unwrap();
    assert_eq!(status.phase, ServicePhase::SpawnFailed);
    assert!(!status.ready);

    // A spawn failure is a broken install, not a crash: no backoff timer.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(planner.resolves(), 1);

    supervisor.stop();
    supervisor.wait_stopped().await;
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_suppresses_a_pending_restart_timer() {
    let dir = tempfile::tempdir().unwrap();
    closed_ports_file(dir.path());

    let planner = FakePlanner::shell("exit 1");
    let mut settings = fast_settings(dir.path());
    // Long enough backoff that stop() lands while the timer is pending.
    settings.restart.initial_delay = Duration::from_millis(400);
    settings.restart.max_delay = Duration::from_secs(2);
    let mut supervisor = Supervisor::with_planner(settings, planner.clone());

    let _ = supervisor.start().await;

    wait_for_status(&supervisor, "surreal", Duration::from_secs(5), |s| {
        matches!(s.phase, ServicePhase::Backoff { .. })
    })
    .await;
    let resolves_before = planner.resolves();

    supervisor.stop();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The timer fired (or was cancelled) but spawned nothing.
    assert_eq!(planner.resolves(), resolves_before);
    // Ports stay answerable after shutdown.
    assert!(supervisor.service_ports().get("surreal").copied().unwrap_or(0) != 0);

    supervisor.wait_stopped().await;
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ports = [
        ("surreal", http_stub("200 OK").await),
        ("memory", http_stub("200 OK").await),
        ("stt", http_stub("200 OK").await),
        ("tts", http_stub("200 OK").await),
    ];
    write_ports_file(dir.path(), &ports);

    let planner = FakePlanner::shell("exit 1");
    let mut supervisor = Supervisor::with_planner(fast_settings(dir.path()), planner);
    supervisor.start().await.unwrap();

    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyStarted));

    supervisor.stop();
    supervisor.wait_stopped().await;
}
