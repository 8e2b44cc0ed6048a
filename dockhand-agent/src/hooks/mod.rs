//! Lifecycle hook execution.
//!
//! For an event the runner picks which on-disk archive supplies scripts
//! (current / last-successful / most-recent, see the lifecycle mapping),
//! loads that archive's appspec, and runs the event's scripts in order
//! through the process runner, stopping at the first failure.

use crate::layout::ARCHIVE_DIR_NAME;
use crate::util::command::{Invocation, RunError, RunRequest, run_script};
use anyhow::Result;
use dockhand_shared::appspec::{self, AppSpec, AppSpecError, HookScript};
use dockhand_shared::deployment::{DeploymentSpec, RevisionSource};
use dockhand_shared::lifecycle::{ArchiveRoot, archive_root_for_name};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Everything the runner needs to resolve and execute one event.
#[derive(Debug, Clone)]
pub struct HookArgs<'a> {
    pub event: &'a str,
    pub spec: &'a DeploymentSpec,
    /// `deployment-archive` of the deployment currently executing.
    pub current_archive: PathBuf,
    /// Deployment directory named by the group's last-successful pointer.
    pub last_successful_dir: Option<PathBuf>,
    /// Deployment directory named by the group's most-recent pointer.
    pub most_recent_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// Nothing to run: no archive, no appspec, or no scripts for the event.
    Noop,
    Completed,
    Failed { script: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct HookReport {
    pub outcome: HookOutcome,
    /// Raw per-script log, appended to the deployment's scripts.log.
    pub log: String,
    /// Same output with `[stdout]`/`[stderr]` line prefixes for diagnostics.
    pub diag_log: String,
}

impl HookReport {
    fn noop() -> Self {
        Self {
            outcome: HookOutcome::Noop,
            log: String::new(),
            diag_log: String::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HookRunner;

impl HookRunner {
    /// Directory holding scripts for this event, or None when the event
    /// resolves to nothing runnable (which is a successful no-op).
    fn resolve_archive(&self, args: &HookArgs<'_>) -> Option<PathBuf> {
        let selected = archive_root_for_name(args.event, args.spec.is_rollback());
        let pointer_dir = match selected {
            ArchiveRoot::Current => None,
            ArchiveRoot::LastSuccessful => args.last_successful_dir.as_deref(),
            ArchiveRoot::MostRecent => args.most_recent_dir.as_deref(),
        };

        // a pointer only counts if its archive actually exists on disk
        if let Some(dir) = pointer_dir {
            let archive = dir.join(ARCHIVE_DIR_NAME);
            if archive.is_dir() {
                return Some(archive);
            }
            debug!(
                "pointer archive {} missing, falling back to current deployment",
                archive.display()
            );
        }

        if args.current_archive.is_dir() {
            Some(args.current_archive.clone())
        } else {
            None
        }
    }

    fn load_appspec(&self, archive: &Path, args: &HookArgs<'_>) -> Result<Option<AppSpec>> {
        let path = match appspec::find(archive, args.spec.appspec_filename.as_deref()) {
            Ok(p) => p,
            Err(AppSpecError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let bytes = std::fs::read(&path)?;
        Ok(Some(AppSpec::parse(&bytes)?))
    }

    fn environment(&self, args: &HookArgs<'_>) -> BTreeMap<String, String> {
        let spec = args.spec;
        let mut env = BTreeMap::from([
            ("LIFECYCLE_EVENT".to_string(), args.event.to_string()),
            ("DEPLOYMENT_ID".to_string(), spec.deployment_id.clone()),
            (
                "APPLICATION_NAME".to_string(),
                spec.application_name.clone(),
            ),
            (
                "DEPLOYMENT_GROUP_NAME".to_string(),
                spec.deployment_group_name.clone(),
            ),
            (
                "DEPLOYMENT_GROUP_ID".to_string(),
                spec.deployment_group_id.clone(),
            ),
        ]);
        if let RevisionSource::GitHub { commit_id, .. } = &spec.revision {
            env.insert("BUNDLE_COMMIT".to_string(), commit_id.clone());
        }
        env
    }

    /// True when executing this event would do nothing.
    pub fn is_noop(&self, args: &HookArgs<'_>) -> bool {
        let Some(archive) = self.resolve_archive(args) else {
            return true;
        };
        match self.load_appspec(&archive, args) {
            Ok(Some(spec)) => spec.scripts_for(args.event).is_empty(),
            Ok(None) => true,
            // a broken appspec is not a no-op; execution surfaces the error
            Err(_) => false,
        }
    }

    pub async fn execute(
        &self,
        args: &HookArgs<'_>,
        cancel: &CancellationToken,
    ) -> Result<HookReport> {
        let Some(archive) = self.resolve_archive(args) else {
            info!("{}: no archive to run against, skipping", args.event);
            return Ok(HookReport::noop());
        };
        let Some(spec) = self.load_appspec(&archive, args)? else {
            info!("{}: bundle carries no appspec, skipping", args.event);
            return Ok(HookReport::noop());
        };
        let scripts = spec.scripts_for(args.event);
        if scripts.is_empty() {
            return Ok(HookReport::noop());
        }

        let env = self.environment(args);
        let mut log = String::new();
        let mut diag_log = String::new();

        for script in scripts {
            info!("{}: running {}", args.event, script.location);
            let script_path = archive.join(&script.location);
            let request = RunRequest {
                script: &script_path,
                cwd: &archive,
                env: &env,
                timeout: Duration::from_secs(script.timeout_secs()),
                invocation: invocation_for(script),
            };

            let result = match run_script(request, cancel).await {
                Ok(r) => r,
                Err(e @ (RunError::MissingScript(_) | RunError::Spawn { .. })) => {
                    return Err(e.into());
                }
                Err(RunError::Cancelled) => return Err(RunError::Cancelled.into()),
                Err(RunError::Other(e)) => return Err(e),
            };

            log.push_str(&format!(
                "Script - {}\n{}{}",
                script.location, result.stdout, result.stderr
            ));
            diag_log.push_str(&format!(
                "Script - {}\n{}",
                script.location,
                prefixed(&result.stdout, &result.stderr)
            ));

            if result.timed_out {
                return Ok(HookReport {
                    outcome: HookOutcome::Failed {
                        script: script.location.clone(),
                        reason: format!("timed out after {} seconds", script.timeout_secs()),
                    },
                    log,
                    diag_log,
                });
            }
            match result.exit_code {
                Some(0) => {}
                code => {
                    return Ok(HookReport {
                        outcome: HookOutcome::Failed {
                            script: script.location.clone(),
                            reason: format!("exit code {}", code.unwrap_or(-1)),
                        },
                        log,
                        diag_log,
                    });
                }
            }
        }

        Ok(HookReport {
            outcome: HookOutcome::Completed,
            log,
            diag_log,
        })
    }
}

fn invocation_for(script: &HookScript) -> Invocation {
    if let Some(user) = &script.runas {
        Invocation::RunAs(user.clone())
    } else if script.sudo {
        Invocation::Sudo
    } else {
        Invocation::Direct
    }
}

/// Interleave captured output with `[stdout]`/`[stderr]` line prefixes.
fn prefixed(stdout: &str, stderr: &str) -> String {
    let mut out = String::new();
    for line in stdout.lines() {
        out.push_str("[stdout]");
        out.push_str(line);
        out.push('\n');
    }
    for line in stderr.lines() {
        out.push_str("[stderr]");
        out.push_str(line);
        out.push('\n');
    }
    out
}
