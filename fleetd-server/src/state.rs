use anyhow::{Context, Result};
use directories::ProjectDirs;
use fleetd_core::state::FleetState;
use std::path::PathBuf;
use tokio::fs;
use tracing::info;

/// Persists the descriptor set and port table across daemon restarts.
///
/// `running` flags are meaningless after a restart; [`FleetState`] loads are
/// consumed with every flag seeded false and the liveness monitor reconciles
/// against the persisted pids.
pub struct StateManager {
    state_path: PathBuf,
}

impl StateManager {
    pub fn new() -> Result<Self> {
        let dirs = ProjectDirs::from("dev", "fleetd", "fleetd")
            .context("could not determine project directories")?;
        let data_dir = dirs.data_dir();

        // Startup-only, sync is fine here.
        std::fs::create_dir_all(data_dir)?;

        let state_path = data_dir.join("state.json");
        info!("state file location: {:?}", state_path);
        Ok(Self { state_path })
    }

    /// Store the state at an explicit path. Used by tests and by configs
    /// that relocate the data dir.
    pub fn with_path(state_path: PathBuf) -> Self {
        Self { state_path }
    }

    pub async fn load(&self) -> Result<FleetState> {
        if !self.state_path.exists() {
            return Ok(FleetState::default());
        }
        let content = fs::read_to_string(&self.state_path).await?;
        let state: FleetState =
            serde_json::from_str(&content).context("failed to parse state file")?;
        Ok(state)
    }

    /// Saves the state, keeping the previous file as a `.bak` copy.
    pub async fn save(&self, state: &FleetState) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if self.state_path.exists() {
            let backup = self.state_path.with_extension("json.bak");
            let _ = fs::copy(&self.state_path, &backup).await;
        }
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&self.state_path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_of_missing_file_is_empty_state() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = StateManager::with_path(tmp.path().join("state.json"));
        let state = manager.load().await.unwrap();
        assert!(state.projects.is_empty());
    }

    #[tokio::test]
    async fn save_keeps_a_backup_of_the_previous_state() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let manager = StateManager::with_path(path.clone());

        manager.save(&FleetState::default()).await.unwrap();
        manager.save(&FleetState::default()).await.unwrap();

        assert!(path.exists());
        assert!(tmp.path().join("state.json.bak").exists());
    }
}
