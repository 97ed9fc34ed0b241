//! Orchestrator configuration, loaded from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use conductor_engine::ExecutorConfig;
use conductor_types::{ConductorError, Result};

/// Shell commands for the validation phase. A missing command skips its check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckCommands {
    pub lint: Option<String>,
    pub test: Option<String>,
    pub build: Option<String>,
}

impl CheckCommands {
    /// `(name, command)` pairs in the order the checks are registered.
    pub fn entries(&self) -> [(&'static str, Option<&str>); 3] {
        [
            ("lint", self.lint.as_deref()),
            ("test", self.test.as_deref()),
            ("build", self.build.as_deref()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Where generated artifacts and the report are written.
    pub output_dir: PathBuf,
    /// Root of the file checkpoint store.
    pub checkpoint_dir: PathBuf,
    /// Directory the check commands run in.
    pub working_dir: PathBuf,
    pub executor: ExecutorConfig,
    pub checks: CheckCommands,
    pub command_timeout_ms: u64,
    /// Extra attempts for a check command that timed out.
    pub check_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("conductor-out"),
            checkpoint_dir: PathBuf::from(".conductor/checkpoints"),
            working_dir: PathBuf::from("."),
            executor: ExecutorConfig::default(),
            checks: CheckCommands::default(),
            command_timeout_ms: 300_000,
            check_retries: 1,
        }
    }
}

impl OrchestratorConfig {
    /// Read a JSON config file. Missing fields fall back to their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Other(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
