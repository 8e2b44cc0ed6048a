//! In-flight command markers.
//!
//! Before executing a command the poller drops a marker file named by the
//! deployment id whose contents are the host command identifier. On a clean
//! completion the marker is removed; markers found at startup therefore
//! identify commands that died with the process and must be failed back to
//! the service.

use anyhow::{Context, Result};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct FileTracker {
    dir: PathBuf,
}

/// A command that was in flight when the agent previously stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OngoingDeployment {
    pub deployment_id: String,
    pub host_command_identifier: String,
}

impl FileTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn mark(&self, deployment_id: &str, host_command_identifier: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create tracking directory {:?}", self.dir))?;
        let path = self.dir.join(deployment_id);
        std::fs::write(&path, host_command_identifier)
            .with_context(|| format!("Failed to write in-flight marker {path:?}"))?;
        Ok(())
    }

    pub fn clear(&self, deployment_id: &str) {
        let path = self.dir.join(deployment_id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove in-flight marker {:?}: {}", path, e);
            }
        }
    }

    /// Markers left behind by a previous process, oldest first.
    pub fn list(&self) -> Result<Vec<OngoingDeployment>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read tracking directory {:?}", self.dir))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let deployment_id = entry.file_name().to_string_lossy().into_owned();
            let host_command_identifier = std::fs::read_to_string(entry.path())
                .unwrap_or_default()
                .trim()
                .to_string();
            found.push(OngoingDeployment {
                deployment_id,
                host_command_identifier,
            });
        }
        found.sort_by(|a, b| a.deployment_id.cmp(&b.deployment_id));
        Ok(found)
    }
}
