//! Path algebra for everything the agent touches on disk.
//!
//! All per-deployment state lives under `<root>/<group-id>/<deployment-id>/`
//! and all group-scoped state under shared directories next to the groups.
//! Every path the agent reads or writes is derived here; nothing else in the
//! agent joins path segments by hand.

use std::path::{Path, PathBuf};

pub const ARCHIVE_DIR_NAME: &str = "deployment-archive";
pub const BUNDLE_FILE_NAME: &str = "bundle.tar";
pub const LOGS_DIR_NAME: &str = "logs";
pub const SCRIPTS_LOG_NAME: &str = "scripts.log";
pub const INSTRUCTIONS_DIR_NAME: &str = "deployment-instructions";
pub const DEPLOYMENT_LOGS_DIR_NAME: &str = "deployment-logs";
pub const DEPLOYMENT_LOG_FILE_NAME: &str = "deployments.log";
pub const ONGOING_DIR_NAME: &str = "ongoing-deployment";

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn group_dir(&self, group_id: &str) -> PathBuf {
        self.root.join(group_id)
    }

    pub fn deployment_dir(&self, group_id: &str, deployment_id: &str) -> PathBuf {
        self.group_dir(group_id).join(deployment_id)
    }

    /// The unpacked revision bundle.
    pub fn archive_dir(&self, group_id: &str, deployment_id: &str) -> PathBuf {
        self.deployment_dir(group_id, deployment_id)
            .join(ARCHIVE_DIR_NAME)
    }

    /// The downloaded (or symlinked) bundle file before unpacking.
    pub fn bundle_path(&self, group_id: &str, deployment_id: &str) -> PathBuf {
        self.deployment_dir(group_id, deployment_id)
            .join(BUNDLE_FILE_NAME)
    }

    pub fn logs_dir(&self, group_id: &str, deployment_id: &str) -> PathBuf {
        self.deployment_dir(group_id, deployment_id)
            .join(LOGS_DIR_NAME)
    }

    /// Accumulated hook script output for one deployment.
    pub fn scripts_log_path(&self, group_id: &str, deployment_id: &str) -> PathBuf {
        self.logs_dir(group_id, deployment_id).join(SCRIPTS_LOG_NAME)
    }

    /// Group-scoped pointer and instruction files.
    pub fn instructions_dir(&self) -> PathBuf {
        self.root.join(INSTRUCTIONS_DIR_NAME)
    }

    /// The inverse record of the group's previous install, replayed and
    /// deleted by the next one.
    pub fn cleanup_file(&self, group_id: &str) -> PathBuf {
        self.instructions_dir().join(format!("{group_id}-cleanup"))
    }

    pub fn install_file(&self, group_id: &str) -> PathBuf {
        self.instructions_dir()
            .join(format!("{group_id}-install.json"))
    }

    pub fn last_successful_file(&self, group_id: &str) -> PathBuf {
        self.instructions_dir()
            .join(format!("{group_id}_last_successful_install"))
    }

    pub fn most_recent_file(&self, group_id: &str) -> PathBuf {
        self.instructions_dir()
            .join(format!("{group_id}_most_recent_install"))
    }

    pub fn deployment_logs_dir(&self) -> PathBuf {
        self.root.join(DEPLOYMENT_LOGS_DIR_NAME)
    }

    /// Shared append-only record of every deployment seen by this host.
    pub fn deployment_log_path(&self) -> PathBuf {
        self.deployment_logs_dir().join(DEPLOYMENT_LOG_FILE_NAME)
    }

    /// In-flight command markers for crash recovery.
    pub fn ongoing_dir(&self) -> PathBuf {
        self.root.join(ONGOING_DIR_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_deployment_paths() {
        let l = Layout::new("/srv/deploy");
        assert_eq!(
            l.archive_dir("g1", "d-1"),
            PathBuf::from("/srv/deploy/g1/d-1/deployment-archive")
        );
        assert_eq!(
            l.bundle_path("g1", "d-1"),
            PathBuf::from("/srv/deploy/g1/d-1/bundle.tar")
        );
        assert_eq!(
            l.scripts_log_path("g1", "d-1"),
            PathBuf::from("/srv/deploy/g1/d-1/logs/scripts.log")
        );
    }

    #[test]
    fn test_group_scoped_paths() {
        let l = Layout::new("/srv/deploy");
        assert_eq!(
            l.cleanup_file("g1"),
            PathBuf::from("/srv/deploy/deployment-instructions/g1-cleanup")
        );
        assert_eq!(
            l.last_successful_file("g1"),
            PathBuf::from("/srv/deploy/deployment-instructions/g1_last_successful_install")
        );
        assert_eq!(
            l.most_recent_file("g1"),
            PathBuf::from("/srv/deploy/deployment-instructions/g1_most_recent_install")
        );
        assert_eq!(
            l.deployment_log_path(),
            PathBuf::from("/srv/deploy/deployment-logs/deployments.log")
        );
        assert_eq!(
            l.ongoing_dir(),
            PathBuf::from("/srv/deploy/ongoing-deployment")
        );
    }
}
