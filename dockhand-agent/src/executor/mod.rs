//! Command execution: routes each host command to download, install or a
//! lifecycle hook, maintains the group's pointer files, and prunes old
//! deployment archives after successful installs.

use crate::archive::{CodecError, Unpacker};
use crate::download::{DownloadError, Downloader};
use crate::fsops::{FileOps, atomic_write};
use crate::hooks::{HookArgs, HookOutcome, HookRunner};
use crate::installer::{InstallError, Installer};
use crate::layout::Layout;
use anyhow::Context;
use dockhand_shared::appspec::{self, AppSpec, AppSpecError};
use dockhand_shared::deployment::{DeploymentSpec, RevisionSource};
use dockhand_shared::lifecycle::events_for_command;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CMD_DOWNLOAD_BUNDLE: &str = "DownloadBundle";
pub const CMD_INSTALL: &str = "Install";

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("script {script} failed: {reason}")]
    HookFailed {
        script: String,
        reason: String,
        /// Formatted script output accumulated before the failure.
        log: String,
    },
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    AppSpec(#[from] AppSpecError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecError {
    /// Short stable identifier for the diagnostic envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            ExecError::HookFailed { .. } => "ScriptFailed",
            ExecError::Download(_) => "DownloadFailed",
            ExecError::Codec(_) => "BundleUnpackFailed",
            ExecError::Install(_) => "InstallFailed",
            ExecError::AppSpec(_) => "InvalidAppSpec",
            ExecError::Other(_) => "InternalError",
        }
    }
}

pub struct Executor {
    layout: Layout,
    downloader: Arc<dyn Downloader>,
    unpacker: Arc<dyn Unpacker>,
    hook_runner: HookRunner,
    fileops: Arc<dyn FileOps>,
    retention: usize,
}

impl Executor {
    pub fn new(
        layout: Layout,
        downloader: Arc<dyn Downloader>,
        unpacker: Arc<dyn Unpacker>,
        fileops: Arc<dyn FileOps>,
        retention: usize,
    ) -> Self {
        Self {
            layout,
            downloader,
            unpacker,
            hook_runner: HookRunner,
            fileops,
            retention: retention.max(1),
        }
    }

    /// Execute one command, returning the formatted script log to ship in
    /// the completion diagnostics. Hook failures still carry their log.
    pub async fn execute(
        &self,
        command_name: &str,
        spec: &DeploymentSpec,
        cancel: &CancellationToken,
    ) -> Result<String, ExecError> {
        match command_name {
            CMD_DOWNLOAD_BUNDLE => {
                self.download_bundle(spec, cancel).await?;
                Ok(String::new())
            }
            CMD_INSTALL => {
                self.install(spec)?;
                Ok(String::new())
            }
            other => self.run_hooks(other, spec, cancel).await,
        }
    }

    /// True when executing the command would do no work. Infrastructure
    /// commands always run; unknown commands are successful no-ops.
    pub fn is_noop(&self, command_name: &str, spec: &DeploymentSpec) -> bool {
        match command_name {
            CMD_DOWNLOAD_BUNDLE | CMD_INSTALL => false,
            other => match events_for_command(other) {
                None => true,
                Some(events) => events
                    .iter()
                    .all(|event| self.hook_runner.is_noop(&self.hook_args(event.as_str(), spec))),
            },
        }
    }

    async fn download_bundle(
        &self,
        spec: &DeploymentSpec,
        cancel: &CancellationToken,
    ) -> Result<(), ExecError> {
        let group = &spec.deployment_group_id;
        let deployment = &spec.deployment_id;

        let deployment_dir = self.layout.deployment_dir(group, deployment);
        let archive_dir = self.layout.archive_dir(group, deployment);
        let bundle_path = self.layout.bundle_path(group, deployment);
        self.fileops
            .mkdir_all(&deployment_dir)
            .context("create deployment directory")?;
        self.fileops
            .mkdir_all(&self.layout.logs_dir(group, deployment))
            .context("create deployment logs directory")?;
        self.record_deployment(deployment)?;

        match &spec.revision {
            RevisionSource::S3 { bundle_type, .. } => {
                self.downloader
                    .fetch(&spec.revision, &bundle_path, cancel)
                    .await?;
                self.unpacker.unpack(&bundle_path, *bundle_type, &archive_dir)?;
            }
            RevisionSource::GitHub { bundle_type, .. } => {
                self.downloader
                    .fetch(&spec.revision, &bundle_path, cancel)
                    .await?;
                self.unpacker.unpack(&bundle_path, *bundle_type, &archive_dir)?;
            }
            RevisionSource::LocalFile { path, bundle_type } => {
                self.fileops.remove(&bundle_path).context("clear old bundle")?;
                #[cfg(unix)]
                std::os::unix::fs::symlink(path, &bundle_path)
                    .with_context(|| format!("link bundle to {path}"))?;
                #[cfg(not(unix))]
                std::fs::copy(path, &bundle_path)
                    .with_context(|| format!("copy bundle from {path}"))?;
                self.unpacker.unpack(&bundle_path, *bundle_type, &archive_dir)?;
            }
            RevisionSource::LocalDirectory { path } => {
                self.fileops
                    .mkdir_all(&archive_dir)
                    .context("create archive directory")?;
                self.copy_tree(Path::new(path), &archive_dir)?;
            }
        }

        // the pointer only moves once the archive is fully on disk
        atomic_write(
            &self.layout.most_recent_file(group),
            deployment_dir.display().to_string().as_bytes(),
        )?;
        info!("bundle for {deployment} ready at {}", archive_dir.display());
        Ok(())
    }

    /// Append one line per downloaded deployment to the shared host log.
    fn record_deployment(&self, deployment_id: &str) -> Result<(), ExecError> {
        self.fileops
            .mkdir_all(&self.layout.deployment_logs_dir())
            .context("create deployment-logs directory")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.deployment_log_path())
            .context("open deployment log")?;
        writeln!(file, "{deployment_id}").context("append deployment log")?;
        Ok(())
    }

    /// Regular files only; symlinks inside a local directory revision are
    /// not carried onto the host.
    fn copy_tree(&self, source: &Path, destination: &Path) -> Result<(), ExecError> {
        let mut entries: Vec<_> = std::fs::read_dir(source)
            .with_context(|| format!("read local revision {}", source.display()))?
            .collect::<Result<_, _>>()
            .context("read local revision entry")?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let from = entry.path();
            let to = destination.join(entry.file_name());
            let file_type = entry.file_type().context("stat local revision entry")?;
            if file_type.is_dir() {
                self.fileops.mkdir_all(&to).context("create archive subdirectory")?;
                self.copy_tree(&from, &to)?;
            } else if file_type.is_file() {
                self.fileops.copy(&from, &to)?;
            }
        }
        Ok(())
    }

    fn install(&self, spec: &DeploymentSpec) -> Result<(), ExecError> {
        let group = &spec.deployment_group_id;
        let archive_dir = self.layout.archive_dir(group, &spec.deployment_id);

        let appspec_path = appspec::find(&archive_dir, spec.appspec_filename.as_deref())?;
        let bytes = std::fs::read(&appspec_path)
            .with_context(|| format!("read {}", appspec_path.display()))?;
        let appspec = AppSpec::parse(&bytes)?;

        Installer::new(&*self.fileops).install(
            group,
            &archive_dir,
            &self.layout.instructions_dir(),
            &appspec,
            spec.file_exists_behavior,
        )?;

        atomic_write(
            &self.layout.last_successful_file(group),
            self.layout
                .deployment_dir(group, &spec.deployment_id)
                .display()
                .to_string()
                .as_bytes(),
        )?;

        if let Err(e) = self.prune_archives(group, &spec.deployment_id) {
            // retention is housekeeping; a failed prune must not fail the install
            warn!("archive pruning for group {group} failed: {e:#}");
        }
        Ok(())
    }

    async fn run_hooks(
        &self,
        command_name: &str,
        spec: &DeploymentSpec,
        cancel: &CancellationToken,
    ) -> Result<String, ExecError> {
        let Some(events) = events_for_command(command_name) else {
            info!("unknown command {command_name}, treating as a no-op");
            return Ok(String::new());
        };

        let mut diag_log = String::new();
        for event in events {
            let args = self.hook_args(event.as_str(), spec);
            let report = self.hook_runner.execute(&args, cancel).await?;

            if !report.log.is_empty() {
                self.append_script_log(spec, &report.log)?;
            }
            diag_log.push_str(&report.diag_log);

            if let HookOutcome::Failed { script, reason } = report.outcome {
                return Err(ExecError::HookFailed {
                    script,
                    reason,
                    log: diag_log,
                });
            }
        }
        Ok(diag_log)
    }

    fn hook_args<'a>(&self, event: &'a str, spec: &'a DeploymentSpec) -> HookArgs<'a> {
        let group = &spec.deployment_group_id;
        HookArgs {
            event,
            spec,
            current_archive: self.layout.archive_dir(group, &spec.deployment_id),
            last_successful_dir: read_pointer(&self.layout.last_successful_file(group)),
            most_recent_dir: read_pointer(&self.layout.most_recent_file(group)),
        }
    }

    fn append_script_log(&self, spec: &DeploymentSpec, log: &str) -> Result<(), ExecError> {
        let path = self
            .layout
            .scripts_log_path(&spec.deployment_group_id, &spec.deployment_id);
        if let Some(parent) = path.parent() {
            self.fileops
                .mkdir_all(parent)
                .context("create script log directory")?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(log.as_bytes()).context("append script log")?;
        Ok(())
    }

    /// Bounded retention per group: with N configured, keep the current
    /// deployment, the last-successful one, and the newest remainder.
    fn prune_archives(&self, group: &str, current_deployment_id: &str) -> anyhow::Result<()> {
        let group_dir = self.layout.group_dir(group);
        let last_successful = read_pointer(&self.layout.last_successful_file(group));

        let mut total = 0usize;
        let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&group_dir).context("read group directory")? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            total += 1;
            let path = entry.path();
            if entry.file_name().to_string_lossy() == current_deployment_id {
                continue;
            }
            if last_successful.as_deref() == Some(path.as_path()) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            candidates.push((modified, path));
        }

        let extra = (total + 1).saturating_sub(self.retention);
        if extra == 0 {
            return Ok(());
        }
        candidates.sort();
        for (_, path) in candidates.into_iter().take(extra) {
            info!("pruning old deployment archive {}", path.display());
            self.fileops.remove_all(&path)?;
        }
        Ok(())
    }
}

/// Pointer files hold a single path; empty or missing means unset.
fn read_pointer(path: &Path) -> Option<PathBuf> {
    let contents = std::fs::read_to_string(path).ok()?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::archive::BundleCodec;
    use crate::fsops::DiskFileOps;
    use async_trait::async_trait;
    use dockhand_shared::deployment::{BundleType, DeploymentType, FileExistsBehavior};
    use dockhand_shared::lifecycle::ORDERED_EVENTS;
    use std::os::unix::fs::PermissionsExt;

    /// Serves a pre-built tar from disk instead of the network.
    struct StubDownloader {
        bundle: PathBuf,
    }

    #[async_trait]
    impl Downloader for StubDownloader {
        async fn fetch(
            &self,
            _revision: &RevisionSource,
            bundle_path: &Path,
            _cancel: &CancellationToken,
        ) -> Result<(), DownloadError> {
            std::fs::copy(&self.bundle, bundle_path)?;
            Ok(())
        }
    }

    fn s3_spec(deployment_id: &str, group: &str) -> DeploymentSpec {
        DeploymentSpec {
            deployment_id: deployment_id.to_string(),
            deployment_group_id: group.to_string(),
            deployment_group_name: "prod".to_string(),
            application_name: "web".to_string(),
            creator: "user".to_string(),
            deployment_type: DeploymentType::InPlace,
            appspec_filename: None,
            file_exists_behavior: FileExistsBehavior::Overwrite,
            all_possible_lifecycle_events: ORDERED_EVENTS
                .iter()
                .map(|e| e.as_str().to_string())
                .collect(),
            revision: RevisionSource::S3 {
                bucket: "b".to_string(),
                key: "k".to_string(),
                version: Some("v1".to_string()),
                etag: Some("e1".to_string()),
                bundle_type: BundleType::Tar,
            },
        }
    }

    fn build_bundle(dir: &Path, dest: &Path) -> PathBuf {
        let mut builder = tar::Builder::new(Vec::new());
        let appspec = format!(
            r#"version: 0.0
os: linux
files:
  - source: /
    destination: {}
hooks:
  BeforeInstall:
    - location: scripts/hook.sh
      timeout: 60
"#,
            dest.display()
        );
        let mut add = |path: &str, contents: &str, mode: u32| {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(mode);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        };
        add("appspec.yml", &appspec, 0o644);
        add("scripts/hook.sh", "#!/bin/sh\necho ok\n", 0o755);
        add("index.html", "<html/>\n", 0o644);
        drop(add);
        let bundle = dir.join("prepared.tar");
        std::fs::write(&bundle, builder.into_inner().unwrap()).unwrap();
        bundle
    }

    fn executor(root: &Path, bundle: PathBuf, retention: usize) -> Executor {
        Executor::new(
            Layout::new(root),
            Arc::new(StubDownloader { bundle }),
            Arc::new(BundleCodec),
            Arc::new(DiskFileOps),
            retention,
        )
    }

    #[tokio::test]
    async fn test_full_lifecycle_first_deployment() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("deployment-root");
        let dest = tmp.path().join("opt/app");
        let bundle = build_bundle(tmp.path(), &dest);
        let executor = executor(&root, bundle, 5);
        let layout = Layout::new(&root);
        let spec = s3_spec("d-1", "g1");
        let cancel = CancellationToken::new();

        for command in [
            "DownloadBundle",
            "BeforeInstall",
            "Install",
            "ApplicationStart",
            "ValidateService",
        ] {
            executor.execute(command, &spec, &cancel).await.unwrap();
        }

        // bundle contents installed
        assert_eq!(
            std::fs::read_to_string(dest.join("index.html")).unwrap(),
            "<html/>\n"
        );
        // script log captured verbatim
        assert_eq!(
            std::fs::read_to_string(layout.scripts_log_path("g1", "d-1")).unwrap(),
            "Script - scripts/hook.sh\nok\n"
        );
        // pointers advanced
        assert_eq!(
            read_pointer(&layout.most_recent_file("g1")).unwrap(),
            layout.deployment_dir("g1", "d-1")
        );
        assert_eq!(
            read_pointer(&layout.last_successful_file("g1")).unwrap(),
            layout.deployment_dir("g1", "d-1")
        );
        // shared deployment log records the id
        assert_eq!(
            std::fs::read_to_string(layout.deployment_log_path()).unwrap(),
            "d-1\n"
        );
    }

    #[tokio::test]
    async fn test_application_stop_noop_on_first_deployment() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("deployment-root");
        std::fs::create_dir_all(&root).unwrap();
        let bundle = tmp.path().join("unused.tar");
        std::fs::write(&bundle, b"").unwrap();
        let executor = executor(&root, bundle, 5);
        let spec = s3_spec("d-1", "g1");

        assert!(executor.is_noop("ApplicationStop", &spec));
        let log = executor
            .execute("ApplicationStop", &spec, &CancellationToken::new())
            .await
            .unwrap();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_second_deployment_stop_runs_from_last_successful() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("deployment-root");
        let dest = tmp.path().join("opt/app");
        let bundle = build_bundle(tmp.path(), &dest);
        let layout = Layout::new(&root);
        let executor = executor(&root, bundle, 5);
        let cancel = CancellationToken::new();

        // first deployment installs; give d-1 an ApplicationStop hook
        let first = s3_spec("d-1", "g1");
        executor.execute("DownloadBundle", &first, &cancel).await.unwrap();
        executor.execute("Install", &first, &cancel).await.unwrap();
        let archive = layout.archive_dir("g1", "d-1");
        std::fs::write(
            archive.join("appspec.yml"),
            "version: 0.0\nos: linux\nhooks:\n  ApplicationStop:\n    - location: scripts/stop.sh\n",
        )
        .unwrap();
        let stop = archive.join("scripts/stop.sh");
        std::fs::write(&stop, "#!/bin/sh\necho stopping-d-1\n").unwrap();
        std::fs::set_permissions(&stop, std::fs::Permissions::from_mode(0o755)).unwrap();

        // second deployment's stop runs d-1's script
        let second = s3_spec("d-2", "g1");
        assert!(!executor.is_noop("ApplicationStop", &second));
        executor
            .execute("ApplicationStop", &second, &cancel)
            .await
            .unwrap();
        let log = std::fs::read_to_string(layout.scripts_log_path("g1", "d-2")).unwrap();
        assert!(log.contains("stopping-d-1"));
    }

    #[tokio::test]
    async fn test_hook_failure_carries_formatted_log() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("deployment-root");
        let layout = Layout::new(&root);
        let archive = layout.archive_dir("g1", "d-1");
        std::fs::create_dir_all(archive.join("scripts")).unwrap();
        std::fs::write(
            archive.join("appspec.yml"),
            "version: 0.0\nos: linux\nhooks:\n  ValidateService:\n    - location: scripts/check.sh\n",
        )
        .unwrap();
        let check = archive.join("scripts/check.sh");
        std::fs::write(&check, "#!/bin/sh\necho probing\necho bad >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&check, std::fs::Permissions::from_mode(0o755)).unwrap();

        let bundle = tmp.path().join("unused.tar");
        std::fs::write(&bundle, b"").unwrap();
        let executor = executor(&root, bundle, 5);
        let spec = s3_spec("d-1", "g1");

        let err = executor
            .execute("ValidateService", &spec, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ExecError::HookFailed { script, reason, log } => {
                assert_eq!(script, "scripts/check.sh");
                assert_eq!(reason, "exit code 1");
                assert!(log.contains("[stdout]probing"));
                assert!(log.contains("[stderr]bad"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_command_is_successful_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("deployment-root");
        std::fs::create_dir_all(&root).unwrap();
        let bundle = tmp.path().join("unused.tar");
        std::fs::write(&bundle, b"").unwrap();
        let executor = executor(&root, bundle, 5);
        let spec = s3_spec("d-1", "g1");

        assert!(executor.is_noop("BrandNewCommand", &spec));
        let log = executor
            .execute("BrandNewCommand", &spec, &CancellationToken::new())
            .await
            .unwrap();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_local_directory_revision_copies_regular_files_only() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("deployment-root");
        let layout = Layout::new(&root);
        let source = tmp.path().join("checkout");
        std::fs::create_dir_all(source.join("sub")).unwrap();
        std::fs::write(source.join("appspec.yml"), "version: 0.0\nos: linux\n").unwrap();
        std::fs::write(source.join("sub/data.txt"), "d\n").unwrap();
        std::os::unix::fs::symlink("appspec.yml", source.join("link.yml")).unwrap();

        let bundle = tmp.path().join("unused.tar");
        std::fs::write(&bundle, b"").unwrap();
        let executor = executor(&root, bundle, 5);
        let mut spec = s3_spec("d-1", "g1");
        spec.revision = RevisionSource::LocalDirectory {
            path: source.display().to_string(),
        };

        executor
            .execute("DownloadBundle", &spec, &CancellationToken::new())
            .await
            .unwrap();

        let archive = layout.archive_dir("g1", "d-1");
        assert!(archive.join("appspec.yml").is_file());
        assert!(archive.join("sub/data.txt").is_file());
        assert!(!archive.join("link.yml").exists());
    }

    #[tokio::test]
    async fn test_local_file_revision_is_symlinked_and_unpacked() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("deployment-root");
        let dest = tmp.path().join("opt/app");
        let prepared = build_bundle(tmp.path(), &dest);
        let layout = Layout::new(&root);

        let executor = executor(&root, tmp.path().join("unused.tar"), 5);
        std::fs::write(tmp.path().join("unused.tar"), b"").unwrap();
        let mut spec = s3_spec("d-1", "g1");
        spec.revision = RevisionSource::LocalFile {
            path: prepared.display().to_string(),
            bundle_type: BundleType::Tar,
        };

        executor
            .execute("DownloadBundle", &spec, &CancellationToken::new())
            .await
            .unwrap();

        let bundle_path = layout.bundle_path("g1", "d-1");
        assert!(std::fs::symlink_metadata(&bundle_path)
            .unwrap()
            .file_type()
            .is_symlink());
        assert!(layout.archive_dir("g1", "d-1").join("appspec.yml").is_file());
    }

    fn seed_group(layout: &Layout, ids: &[&str]) {
        for (i, id) in ids.iter().enumerate() {
            let dir = layout.deployment_dir("g1", id);
            std::fs::create_dir_all(&dir).unwrap();
            filetime::set_file_mtime(
                &dir,
                filetime::FileTime::from_unix_time(1_700_000_000 + i as i64 * 60, 0),
            )
            .unwrap();
        }
    }

    fn group_contents(layout: &Layout) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(layout.group_dir("g1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_retention_keeps_current_and_last_successful() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("deployment-root");
        let layout = Layout::new(&root);
        let bundle = tmp.path().join("unused.tar");
        std::fs::write(&bundle, b"").unwrap();
        let executor = executor(&root, bundle, 3);

        // six deployments by ascending mtime; pointer protects d-b
        seed_group(&layout, &["d-a", "d-b", "d-c", "d-d", "d-e", "d-f"]);
        atomic_write(
            &layout.last_successful_file("g1"),
            layout.deployment_dir("g1", "d-b").display().to_string().as_bytes(),
        )
        .unwrap();

        executor.prune_archives("g1", "d-f").unwrap();

        assert_eq!(group_contents(&layout), vec!["d-b", "d-f"]);
        // the pointer still resolves after pruning
        assert!(read_pointer(&layout.last_successful_file("g1"))
            .unwrap()
            .is_dir());
    }

    #[tokio::test]
    async fn test_retention_under_bound_prunes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("deployment-root");
        let layout = Layout::new(&root);
        let bundle = tmp.path().join("unused.tar");
        std::fs::write(&bundle, b"").unwrap();
        let executor = executor(&root, bundle, 5);

        seed_group(&layout, &["d-1", "d-2"]);
        executor.prune_archives("g1", "d-2").unwrap();
        assert_eq!(group_contents(&layout), vec!["d-1", "d-2"]);
    }

    #[tokio::test]
    async fn test_install_prunes_after_moving_the_pointer() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("deployment-root");
        let dest = tmp.path().join("opt/app");
        let bundle = build_bundle(tmp.path(), &dest);
        let layout = Layout::new(&root);
        let executor = executor(&root, bundle, 3);
        let cancel = CancellationToken::new();

        seed_group(&layout, &["d-a", "d-b", "d-c", "d-d", "d-e"]);

        let spec = s3_spec("d-f", "g1");
        executor.execute("DownloadBundle", &spec, &cancel).await.unwrap();
        executor.execute("Install", &spec, &cancel).await.unwrap();

        // pointer moved to d-f before pruning, so the newest survivor is kept
        let remaining = group_contents(&layout);
        assert!(remaining.contains(&"d-f".to_string()));
        assert!(remaining.len() <= 3, "{remaining:?}");
        assert_eq!(
            read_pointer(&layout.last_successful_file("g1")).unwrap(),
            layout.deployment_dir("g1", "d-f")
        );
    }
}
