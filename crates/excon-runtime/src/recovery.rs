//! Containers that were running before the agent restarted.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use excon_protocol::ContainerId;
use serde::{Deserialize, Serialize};

use crate::error::ContainerizerError;
use crate::registry::Sandbox;

/// Prior state persisted by the agent.
///
/// ```json
/// { "runs": [ { "container_id": "c1", "directory": "/var/lib/excon/c1", "user": "nobody" } ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryState {
    #[serde(default)]
    pub runs: Vec<RunState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub container_id: ContainerId,
    pub directory: PathBuf,
    #[serde(default)]
    pub user: Option<String>,
    /// Runs whose executor already terminated are not recovered.
    #[serde(default)]
    pub completed: bool,
}

impl RunState {
    pub fn sandbox(&self) -> Sandbox {
        Sandbox::new(&self.directory, self.user.clone())
    }
}

impl RecoveryState {
    /// Read state from `path`. A missing file means there is nothing to
    /// recover.
    pub fn load(path: &Path) -> Result<Option<Self>, ContainerizerError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ContainerizerError::StateCorrupt(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| ContainerizerError::StateCorrupt(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Runs that still need a container, after checking the whole state is
    /// well formed.
    pub fn live_runs(&self) -> Result<Vec<&RunState>, ContainerizerError> {
        let mut seen = HashSet::new();
        for run in &self.runs {
            if run.container_id.is_empty() {
                return Err(ContainerizerError::StateCorrupt(
                    "run with an empty container id".into(),
                ));
            }
            if !seen.insert(&run.container_id) {
                return Err(ContainerizerError::StateCorrupt(format!(
                    "container {} appears more than once",
                    run.container_id
                )));
            }
            if !run.directory.is_absolute() {
                return Err(ContainerizerError::StateCorrupt(format!(
                    "container {} has a relative sandbox directory {}",
                    run.container_id,
                    run.directory.display()
                )));
            }
        }
        Ok(self.runs.iter().filter(|run| !run.completed).collect())
    }
}
