use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SupervisorError;

/// Fallback ports written to a fresh ports file. The file, not these
/// constants, is the single source of truth once it exists.
pub const DEFAULT_PORTS: [(&str, u16); 4] = [
    ("surreal_port", 8001),
    ("memory_port", 8010),
    ("stt_port", 8765),
    ("tts_port", 8766),
];

/// Flat `"<service>_port" -> port` mapping persisted as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortsConfig(pub BTreeMap<String, u16>);

impl PortsConfig {
    pub fn defaults() -> Self {
        Self(
            DEFAULT_PORTS
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        )
    }

    /// Port for a service, looked up by its registry name.
    pub fn get(&self, service: &str) -> Option<u16> {
        self.0.get(&format!("{service}_port")).copied()
    }
}

/// Loads (or on first run, generates) the ports file.
pub struct PortResolver {
    path: PathBuf,
}

impl PortResolver {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Idempotent load. A missing file is synthesized with the documented
    /// defaults and persisted; a malformed file is logged and resolution
    /// proceeds with an empty mapping, leaving prior port values (possibly
    /// unresolved) untouched downstream.
    pub fn load(&self) -> PortsConfig {
        match self.read() {
            Ok(Some(config)) => config,
            Ok(None) => self.initialize(),
            Err(e) => {
                warn!(error = %e, "continuing with unresolved ports");
                PortsConfig::default()
            }
        }
    }

    fn read(&self) -> Result<Option<PortsConfig>, SupervisorError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SupervisorError::ConfigLoadFailure {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };
        let config =
            serde_json::from_str(&content).map_err(|e| SupervisorError::ConfigLoadFailure {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        Ok(Some(config))
    }

    fn initialize(&self) -> PortsConfig {
        let config = PortsConfig::defaults();
        match self.persist(&config) {
            Ok(()) => info!(path = %self.path.display(), "wrote default ports file"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to persist default ports"),
        }
        config
    }

    fn persist(&self, config: &PortsConfig) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        // Atomic write: write to tmp file then rename
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
