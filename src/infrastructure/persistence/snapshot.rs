use crate::domain::{dispatch::DispatchEngine, dispatch::EngineState, types::*};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Snapshot layout version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Versioned copy of every engine table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Layout version
    pub version: u32,
    /// When the snapshot was taken
    pub saved_at: Timestamp,
    /// Tables
    pub state: EngineState,
}

impl StateSnapshot {
    /// Captures the current engine state
    pub fn capture(engine: &DispatchEngine) -> DispatchResult<Self> {
        Ok(Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            state: engine.export_state()?,
        })
    }

    /// Writes the snapshot through a temporary file so a crash never leaves
    /// a truncated snapshot behind
    pub fn save(&self, path: &Path) -> DispatchResult<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = temp_path(path);
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        info!(
            "Saved snapshot to {} ({} orders, {} deliveries)",
            path.display(),
            self.state.orders.len(),
            self.state.deliveries.len()
        );
        Ok(())
    }

    /// Reads a snapshot, rejecting unknown layout versions
    pub fn load(path: &Path) -> DispatchResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let snapshot: StateSnapshot = serde_json::from_str(&content)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(DispatchError::ParseError(format!(
                "Unsupported snapshot version {} in {}",
                snapshot.version,
                path.display()
            )));
        }
        Ok(snapshot)
    }

    /// Loads the tables into an empty engine
    pub fn restore_into(self, engine: &DispatchEngine) -> DispatchResult<()> {
        info!("Restoring snapshot taken at {}", self.saved_at);
        engine.restore_state(self.state)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
