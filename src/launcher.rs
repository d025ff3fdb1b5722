use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::{DeployMode, Settings};
use crate::error::SupervisorError;
use crate::registry::{ServiceDescriptor, ServiceKind};

/// Interpreter override for development-mode sibling services.
pub const PYTHON_OVERRIDE_ENV: &str = "SIDEKICK_PYTHON";

/// Environment passed to every spawned service.
pub const ENV_LITE: &str = "SIDEKICK_LITE";
pub const ENV_DATA_DIR: &str = "SIDEKICK_DATA_DIR";
pub const ENV_NAME: &str = "SIDEKICK_ENV";

const DB_USER: &str = "root";
const DB_PASS: &str = "root";
const DB_LOG_LEVEL: &str = "info";
const DB_STORAGE_FILE: &str = "surreal.db";

/// Everything needed to start one service process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// Seam between the supervisor and launch-parameter resolution, so tests can
/// substitute throwaway processes for the real service tree.
pub trait LaunchPlanner: Send + Sync {
    fn resolve(&self, svc: &ServiceDescriptor) -> Result<LaunchPlan, SupervisorError>;
}

/// Computes executable path, arguments, working directory, and environment
/// for a service under the configured deployment mode. Pure apart from
/// reading the interpreter override variable.
pub struct ProcessLauncher {
    settings: Settings,
}

impl ProcessLauncher {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn base_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            ENV_LITE.to_string(),
            if self.settings.lite { "1" } else { "0" }.to_string(),
        );
        env.insert(
            ENV_DATA_DIR.to_string(),
            self.settings.data_dir.display().to_string(),
        );
        env.insert(
            ENV_NAME.to_string(),
            self.settings.mode.env_name().to_string(),
        );
        env
    }

    fn bin_dir(&self) -> PathBuf {
        match self.settings.mode {
            DeployMode::Development => self.settings.app_root.join("bin"),
            DeployMode::Deployed => self.settings.resources_dir.join("bin"),
        }
    }

    /// The database has its own launch template: bind address, credential
    /// pair, log verbosity, and a storage file under the user-data dir
    /// (development) or the install tree (deployed).
    fn database_plan(&self, svc: &ServiceDescriptor) -> LaunchPlan {
        let storage = match self.settings.mode {
            DeployMode::Development => self.settings.data_dir.join(DB_STORAGE_FILE),
            DeployMode::Deployed => self.settings.resources_dir.join(DB_STORAGE_FILE),
        };
        LaunchPlan {
            program: self.bin_dir().join(exe(FOUNDATIONAL_BIN)),
            args: vec![
                "start".to_string(),
                "--bind".to_string(),
                format!("127.0.0.1:{}", svc.port),
                "--user".to_string(),
                DB_USER.to_string(),
                "--pass".to_string(),
                DB_PASS.to_string(),
                "--log".to_string(),
                DB_LOG_LEVEL.to_string(),
                format!("file:{}", storage.display()),
            ],
            cwd: None,
            env: self.base_env(),
        }
    }

    /// Siblings share one launcher: a compiled binary when deployed, the
    /// interpreted entry-point script in development. The service name is
    /// the sole argument either way.
    fn sibling_plan(&self, svc: &ServiceDescriptor) -> LaunchPlan {
        match self.settings.mode {
            DeployMode::Deployed => LaunchPlan {
                program: self.bin_dir().join(exe(SIBLING_BIN)),
                args: vec![svc.name.to_string()],
                cwd: Some(self.settings.resources_dir.clone()),
                env: self.base_env(),
            },
            DeployMode::Development => {
                let entry = self
                    .settings
                    .app_root
                    .join("services")
                    .join("main.py");
                LaunchPlan {
                    program: PathBuf::from(dev_interpreter()),
                    args: vec![entry.display().to_string(), svc.name.to_string()],
                    cwd: Some(self.settings.app_root.clone()),
                    env: self.base_env(),
                }
            }
        }
    }
}

const FOUNDATIONAL_BIN: &str = "surreal";
const SIBLING_BIN: &str = "services";

impl LaunchPlanner for ProcessLauncher {
    fn resolve(&self, svc: &ServiceDescriptor) -> Result<LaunchPlan, SupervisorError> {
        match svc.kind {
            ServiceKind::NativeBinary => Ok(self.database_plan(svc)),
            ServiceKind::InterpretedService => Ok(self.sibling_plan(svc)),
        }
    }
}

/// Interpreter for development-mode siblings: the override variable if set,
/// otherwise the system default.
fn dev_interpreter() -> String {
    std::env::var(PYTHON_OVERRIDE_ENV).unwrap_or_else(|_| "python3".to_string())
}

#[cfg(windows)]
fn exe(name: &str) -> String {
    format!("{name}.exe")
}

#[cfg(not(windows))]
fn exe(name: &str) -> String {
    name.to_string()
}
