use async_trait::async_trait;
use dpl_core::{FetchError, Project};
use dpl_sync::SnapshotFetcher;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::debug;

/// Serves project snapshots from a JSON file, re-read on every fetch so
/// edits show up on the next refresh.
pub struct FileSnapshotFetcher {
    path: PathBuf,
}

impl FileSnapshotFetcher {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn load(&self) -> Result<Project, FetchError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                FetchError::Transport(format!("snapshot file missing: {}", self.path.display()))
            } else {
                FetchError::Transport(format!("read {}: {err}", self.path.display()))
            }
        })?;
        serde_json::from_slice::<Project>(&raw).map_err(|err| {
            FetchError::Transport(format!("parse {}: {err}", self.path.display()))
        })
    }
}

#[async_trait]
impl SnapshotFetcher for FileSnapshotFetcher {
    async fn fetch_snapshot(&self, project_id: &str) -> Result<Project, FetchError> {
        let project = self.load().await?;
        if project.id != project_id {
            debug!(
                event = "snapshot_project_mismatch",
                requested = %project_id,
                found = %project.id,
            );
            return Err(FetchError::NotFound {
                project_id: project_id.to_string(),
            });
        }
        Ok(project)
    }
}
