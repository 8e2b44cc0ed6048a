//! Install execution: turn an appspec into an ordered instruction list, run
//! it against the filesystem, and record the inverse cleanup log that the
//! group's next install replays before writing anything.

use crate::fsops::{FileOps, atomic_write};
use anyhow::Context;
use dockhand_shared::appspec::{AppSpec, AppSpecError, Permission, TargetType};
use dockhand_shared::deployment::FileExistsBehavior;
use dockhand_shared::instruction::{
    CleanupEntry, Instruction, InstructionBuilder, InstructionError, parse_cleanup_log,
};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("file already exists at {0}")]
    FileExists(PathBuf),
    #[error(transparent)]
    Instruction(#[from] InstructionError),
    #[error(transparent)]
    AppSpec(#[from] AppSpecError),
    #[error("invalid permission pattern {pattern}: {reason}")]
    BadPattern { pattern: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct Installer<'a> {
    fileops: &'a dyn FileOps,
}

impl<'a> Installer<'a> {
    pub fn new(fileops: &'a dyn FileOps) -> Self {
        Self { fileops }
    }

    /// Run one install for a deployment group.
    ///
    /// `archive_dir` is the unpacked bundle, `instructions_dir` holds the
    /// group's install/cleanup files, and `fallback` is the deployment
    /// spec's file-exists-behavior, overridden by the appspec's own.
    pub fn install(
        &self,
        group_id: &str,
        archive_dir: &Path,
        instructions_dir: &Path,
        appspec: &AppSpec,
        fallback: FileExistsBehavior,
    ) -> Result<(), InstallError> {
        self.fileops
            .mkdir_all(instructions_dir)
            .context("create instructions directory")?;

        let cleanup_path = instructions_dir.join(format!("{group_id}-cleanup"));
        self.replay_cleanup(&cleanup_path)?;

        let behavior = appspec.file_exists_behavior.unwrap_or(fallback);
        let mut builder = InstructionBuilder::new();
        self.generate_file_instructions(&mut builder, archive_dir, appspec, behavior)?;
        self.attach_permissions(&mut builder, appspec)?;

        let commands = builder.into_commands();
        let install_path = instructions_dir.join(format!("{group_id}-install.json"));
        atomic_write(
            &install_path,
            &serde_json::to_vec_pretty(&commands).context("encode install instructions")?,
        )?;

        info!(
            "executing {} install commands for group {group_id}",
            commands.len()
        );
        self.execute(&commands, &cleanup_path)
    }

    /// Undo the group's previous install. Individual removals are best
    /// effort; the log entries arrive files-first so directories empty out
    /// before their own removal is attempted.
    fn replay_cleanup(&self, cleanup_path: &Path) -> Result<(), InstallError> {
        if !cleanup_path.exists() {
            return Ok(());
        }
        let contents = std::fs::read_to_string(cleanup_path)
            .with_context(|| format!("read cleanup log {}", cleanup_path.display()))?;

        for entry in parse_cleanup_log(&contents) {
            match &entry {
                CleanupEntry::Context(path) => self.fileops.remove_context(path),
                CleanupEntry::Path(path) => {
                    if let Err(e) = self.fileops.remove(path) {
                        warn!("cleanup of {} failed: {e:#}", path.display());
                    }
                }
            }
        }

        std::fs::remove_file(cleanup_path)
            .with_context(|| format!("delete cleanup log {}", cleanup_path.display()))?;
        Ok(())
    }

    fn generate_file_instructions(
        &self,
        builder: &mut InstructionBuilder,
        archive_dir: &Path,
        appspec: &AppSpec,
        behavior: FileExistsBehavior,
    ) -> Result<(), InstallError> {
        for mapping in &appspec.files {
            let source = archive_dir.join(mapping.source.trim_start_matches('/'));
            let destination = PathBuf::from(&mapping.destination);

            if source.is_dir() {
                self.fill_missing_dirs(builder, &destination, true)?;
                self.add_directory(builder, &source, &destination, behavior)?;
            } else {
                let name = source
                    .file_name()
                    .with_context(|| format!("source {} has no file name", source.display()))?;
                let destination = destination.join(name);
                self.fill_missing_dirs(builder, &destination, false)?;
                self.add_file(builder, &source, &destination, behavior)?;
            }
        }
        Ok(())
    }

    /// Mkdir every missing ancestor, shallowest first so each creation has
    /// a parent. With `include_self` the path itself is created too.
    fn fill_missing_dirs(
        &self,
        builder: &mut InstructionBuilder,
        path: &Path,
        include_self: bool,
    ) -> Result<(), InstallError> {
        let mut missing: Vec<&Path> = Vec::new();
        let start = if include_self {
            Some(path)
        } else {
            path.parent()
        };
        let mut cursor = start;
        while let Some(dir) = cursor {
            if dir.as_os_str().is_empty() || dir.exists() {
                break;
            }
            missing.push(dir);
            cursor = dir.parent();
        }
        for dir in missing.into_iter().rev() {
            builder.mkdir(dir)?;
        }
        Ok(())
    }

    fn add_directory(
        &self,
        builder: &mut InstructionBuilder,
        source: &Path,
        destination: &Path,
        behavior: FileExistsBehavior,
    ) -> Result<(), InstallError> {
        let mut entries: Vec<_> = std::fs::read_dir(source)
            .with_context(|| format!("read bundle directory {}", source.display()))?
            .collect::<Result<_, _>>()
            .context("read bundle directory entry")?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let child_source = entry.path();
            let child_destination = destination.join(entry.file_name());
            let file_type = entry.file_type().context("stat bundle entry")?;

            if file_type.is_dir() {
                if !child_destination.is_dir() {
                    builder.mkdir(&child_destination)?;
                }
                self.add_directory(builder, &child_source, &child_destination, behavior)?;
            } else {
                self.add_file(builder, &child_source, &child_destination, behavior)?;
            }
        }
        Ok(())
    }

    fn add_file(
        &self,
        builder: &mut InstructionBuilder,
        source: &Path,
        destination: &Path,
        behavior: FileExistsBehavior,
    ) -> Result<(), InstallError> {
        if !destination.exists() {
            builder.copy(source, destination)?;
            return Ok(());
        }
        match behavior {
            FileExistsBehavior::Disallow => {
                Err(InstallError::FileExists(destination.to_path_buf()))
            }
            FileExistsBehavior::Overwrite => {
                builder.copy(source, destination)?;
                Ok(())
            }
            FileExistsBehavior::Retain => Ok(()),
        }
    }

    fn attach_permissions(
        &self,
        builder: &mut InstructionBuilder,
        appspec: &AppSpec,
    ) -> Result<(), InstallError> {
        for permission in &appspec.permissions {
            let object = Path::new(&permission.object);

            if builder.is_copy_target(object) && permission.applies_to(TargetType::File) {
                permission.validate_as_file()?;
                builder.mark_permission(object)?;
                emit_permission(builder, object, permission);
                continue;
            }

            if builder.is_mkdir_target(object) || object.is_dir() {
                let matches = matching_targets(builder, object, permission)?;
                for target in matches {
                    builder.mark_permission(&target)?;
                    emit_permission(builder, &target, permission);
                }
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        commands: &[Instruction],
        cleanup_path: &Path,
    ) -> Result<(), InstallError> {
        let file = std::fs::File::create(cleanup_path)
            .with_context(|| format!("create cleanup log {}", cleanup_path.display()))?;
        let mut log = BufWriter::new(file);

        let result = self.execute_inner(commands, &mut log);
        log.flush().context("flush cleanup log")?;
        result
    }

    fn execute_inner(
        &self,
        commands: &[Instruction],
        log: &mut impl Write,
    ) -> Result<(), InstallError> {
        for command in commands {
            match command {
                Instruction::Copy {
                    source,
                    destination,
                } => {
                    self.fileops.copy(source, destination)?;
                    write_entry(log, &CleanupEntry::Path(destination.clone()))?;
                }
                Instruction::Mkdir { directory } => {
                    self.fileops.mkdir(directory)?;
                    write_entry(log, &CleanupEntry::Path(directory.clone()))?;
                }
                Instruction::Chmod { path, mode } => {
                    let bits = u32::from_str_radix(mode, 8)
                        .with_context(|| format!("mode {mode} is not octal"))?;
                    self.fileops.chmod(path, bits)?;
                }
                Instruction::Chown { path, owner, group } => {
                    self.fileops.chown(path, owner, group.as_deref())?;
                }
                Instruction::Setfacl { path, acls } => {
                    self.fileops.setfacl(path, acls)?;
                }
                Instruction::Semanage { path, context } => {
                    self.fileops.set_context(path, context)?;
                    write_entry(log, &CleanupEntry::Context(path.clone()))?;
                }
            }
        }
        Ok(())
    }
}

fn write_entry(log: &mut impl Write, entry: &CleanupEntry) -> Result<(), InstallError> {
    log.write_all(entry.render().as_bytes())
        .context("append cleanup entry")?;
    Ok(())
}

/// Emission order for one permission entry.
fn emit_permission(builder: &mut InstructionBuilder, path: &Path, permission: &Permission) {
    if let Some(mode) = &permission.mode {
        builder.chmod(path, &mode.0);
    }
    if !permission.acls.is_empty() {
        builder.setfacl(path, &permission.acls);
    }
    if let Some(context) = &permission.context {
        builder.semanage(path, context);
    }
    if let Some(owner) = &permission.owner {
        builder.chown(path, owner, permission.group.as_deref());
    }
}

fn compile(pattern: &str) -> Result<glob::Pattern, InstallError> {
    glob::Pattern::new(pattern).map_err(|e| InstallError::BadPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Tracked targets under `object` whose relative path matches the pattern
/// and none of the excepts, filtered by the permission's type set.
fn matching_targets(
    builder: &InstructionBuilder,
    object: &Path,
    permission: &Permission,
) -> Result<Vec<PathBuf>, InstallError> {
    let pattern = compile(&permission.pattern)?;
    let excepts = permission
        .except
        .iter()
        .map(|e| compile(e))
        .collect::<Result<Vec<_>, _>>()?;

    let mut candidates: Vec<PathBuf> = Vec::new();
    if permission.applies_to(TargetType::File) {
        candidates.extend(builder.copy_targets().map(Path::to_path_buf));
    }
    if permission.applies_to(TargetType::Directory) {
        candidates.extend(builder.mkdir_targets().map(Path::to_path_buf));
    }

    let mut matches: Vec<PathBuf> = candidates
        .into_iter()
        .filter(|target| target != object)
        .filter(|target| {
            let Ok(rel) = target.strip_prefix(object) else {
                return false;
            };
            pattern.matches_path(rel) && !excepts.iter().any(|e| e.matches_path(rel))
        })
        .collect();
    matches.sort();
    Ok(matches)
}
