use crate::appspec::SeContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// One filesystem command emitted by the installer. Commands execute in the
/// order they were added to the builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Instruction {
    Copy {
        source: PathBuf,
        destination: PathBuf,
    },
    Mkdir {
        directory: PathBuf,
    },
    Chmod {
        path: PathBuf,
        mode: String,
    },
    Chown {
        path: PathBuf,
        owner: String,
        group: Option<String>,
    },
    Setfacl {
        path: PathBuf,
        acls: Vec<String>,
    },
    Semanage {
        path: PathBuf,
        context: SeContext,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstructionError {
    #[error("duplicate copy destination {0}")]
    DuplicateCopyDestination(PathBuf),
    #[error("{0} is both a copy and a mkdir target")]
    CopyMkdirConflict(PathBuf),
    #[error("permission already applied to {0}")]
    PermissionAlreadyApplied(PathBuf),
}

/// Accumulates the ordered instruction list while enforcing the uniqueness
/// invariants: one writer per destination, mkdir idempotent, at most one
/// permission application per path.
#[derive(Debug, Default)]
pub struct InstructionBuilder {
    commands: Vec<Instruction>,
    // destination -> source, for permission matching
    copy_targets: BTreeMap<PathBuf, PathBuf>,
    mkdir_targets: BTreeSet<PathBuf>,
    permission_marked: BTreeSet<PathBuf>,
}

impl InstructionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy(&mut self, source: &Path, destination: &Path) -> Result<(), InstructionError> {
        if self.copy_targets.contains_key(destination) {
            return Err(InstructionError::DuplicateCopyDestination(
                destination.to_path_buf(),
            ));
        }
        if self.mkdir_targets.contains(destination) {
            return Err(InstructionError::CopyMkdirConflict(
                destination.to_path_buf(),
            ));
        }
        self.copy_targets
            .insert(destination.to_path_buf(), source.to_path_buf());
        self.commands.push(Instruction::Copy {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
        });
        Ok(())
    }

    /// Repeated mkdir of the same path is a no-op; a path already claimed by
    /// a copy is a conflict.
    pub fn mkdir(&mut self, directory: &Path) -> Result<(), InstructionError> {
        if self.copy_targets.contains_key(directory) {
            return Err(InstructionError::CopyMkdirConflict(directory.to_path_buf()));
        }
        if !self.mkdir_targets.insert(directory.to_path_buf()) {
            return Ok(());
        }
        self.commands.push(Instruction::Mkdir {
            directory: directory.to_path_buf(),
        });
        Ok(())
    }

    pub fn chmod(&mut self, path: &Path, mode: &str) {
        self.commands.push(Instruction::Chmod {
            path: path.to_path_buf(),
            mode: mode.to_string(),
        });
    }

    pub fn chown(&mut self, path: &Path, owner: &str, group: Option<&str>) {
        self.commands.push(Instruction::Chown {
            path: path.to_path_buf(),
            owner: owner.to_string(),
            group: group.map(str::to_string),
        });
    }

    pub fn setfacl(&mut self, path: &Path, acls: &[String]) {
        self.commands.push(Instruction::Setfacl {
            path: path.to_path_buf(),
            acls: acls.to_vec(),
        });
    }

    pub fn semanage(&mut self, path: &Path, context: &SeContext) {
        self.commands.push(Instruction::Semanage {
            path: path.to_path_buf(),
            context: context.clone(),
        });
    }

    /// Claim a path for permission application; the second claim errors.
    pub fn mark_permission(&mut self, path: &Path) -> Result<(), InstructionError> {
        if !self.permission_marked.insert(path.to_path_buf()) {
            return Err(InstructionError::PermissionAlreadyApplied(
                path.to_path_buf(),
            ));
        }
        Ok(())
    }

    pub fn is_copy_target(&self, path: &Path) -> bool {
        self.copy_targets.contains_key(path)
    }

    pub fn is_mkdir_target(&self, path: &Path) -> bool {
        self.mkdir_targets.contains(path)
    }

    pub fn copy_targets(&self) -> impl Iterator<Item = &Path> {
        self.copy_targets.keys().map(PathBuf::as_path)
    }

    pub fn mkdir_targets(&self) -> impl Iterator<Item = &Path> {
        self.mkdir_targets.iter().map(PathBuf::as_path)
    }

    pub fn commands(&self) -> &[Instruction] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Instruction> {
        self.commands
    }
}

/// Prefix marking an SELinux context line in a cleanup log.
pub const SEMANAGE_PREFIX: &str = "semanage\0";

/// One entry of a cleanup log, the inverse record of an Install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupEntry {
    /// A file or directory the install created; removed by the next install.
    Path(PathBuf),
    /// An SELinux context the install attached; reset by the next install.
    Context(PathBuf),
}

impl CleanupEntry {
    pub fn path(&self) -> &Path {
        match self {
            CleanupEntry::Path(p) | CleanupEntry::Context(p) => p,
        }
    }

    /// Wire form, one line per entry, written as the install executes.
    pub fn render(&self) -> String {
        match self {
            CleanupEntry::Path(p) => format!("{}\n", p.display()),
            CleanupEntry::Context(p) => format!("{SEMANAGE_PREFIX}{}\n", p.display()),
        }
    }
}

/// Parse a cleanup log into entries, returned in reverse order of
/// appearance so files are removed before their parent directories.
///
/// The writer appends one line per created path while the install runs, so
/// a crash can leave a final line without its newline; that partial line is
/// discarded rather than risking removal of a truncated path.
pub fn parse_cleanup_log(input: &str) -> Vec<CleanupEntry> {
    let mut lines: Vec<&str> = input.split('\n').collect();
    if !input.ends_with('\n') {
        lines.pop();
    }

    let mut entries: Vec<CleanupEntry> = lines
        .into_iter()
        .filter(|line| !line.is_empty())
        .map(|line| match line.strip_prefix(SEMANAGE_PREFIX) {
            Some(path) => CleanupEntry::Context(PathBuf::from(path)),
            None => CleanupEntry::Path(PathBuf::from(line)),
        })
        .collect();
    entries.reverse();
    entries
}
