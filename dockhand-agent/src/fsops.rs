//! Filesystem primitives behind the file-operator contract.
//!
//! The installer and executor only see this trait; the disk implementation
//! carries the forgiving-remove and symlink-preservation semantics that the
//! cleanup log and bundle copies rely on.

use anyhow::{Context, Result, anyhow};
use dockhand_shared::appspec::SeContext;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;

pub trait FileOps: Send + Sync {
    /// Copy one file. Symlinks are recreated, never dereferenced.
    fn copy(&self, source: &Path, destination: &Path) -> Result<()>;

    /// Non-recursive; errors if the directory already exists.
    fn mkdir(&self, directory: &Path) -> Result<()>;

    fn mkdir_all(&self, directory: &Path) -> Result<()>;

    fn chmod(&self, path: &Path, mode: u32) -> Result<()>;

    /// Name-based ownership change.
    fn chown(&self, path: &Path, owner: &str, group: Option<&str>) -> Result<()>;

    fn setfacl(&self, path: &Path, acls: &[String]) -> Result<()>;

    /// Attach an SELinux context. Resolves symlinks first; absent SELinux
    /// tooling is a hard error.
    fn set_context(&self, path: &Path, context: &SeContext) -> Result<()>;

    /// Best effort; never fails.
    fn remove_context(&self, path: &Path);

    /// Forgiving remove: missing paths are a no-op, non-empty directories
    /// are silently skipped, symlinks remove the link itself.
    fn remove(&self, path: &Path) -> Result<()>;

    fn remove_all(&self, path: &Path) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiskFileOps;

impl FileOps for DiskFileOps {
    fn copy(&self, source: &Path, destination: &Path) -> Result<()> {
        let meta = std::fs::symlink_metadata(source)
            .with_context(|| format!("stat {}", source.display()))?;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(source)
                .with_context(|| format!("readlink {}", source.display()))?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, destination)
                .with_context(|| format!("symlink {}", destination.display()))?;
            #[cfg(not(unix))]
            return Err(anyhow!("symlink sources are not supported on this platform"));
        } else {
            std::fs::copy(source, destination).with_context(|| {
                format!("copy {} to {}", source.display(), destination.display())
            })?;
        }
        Ok(())
    }

    fn mkdir(&self, directory: &Path) -> Result<()> {
        std::fs::create_dir(directory).with_context(|| format!("mkdir {}", directory.display()))
    }

    fn mkdir_all(&self, directory: &Path) -> Result<()> {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("mkdir -p {}", directory.display()))
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .with_context(|| format!("chmod {:o} {}", mode, path.display()))
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
            Err(anyhow!("chmod is not supported on this platform"))
        }
    }

    fn chown(&self, path: &Path, owner: &str, group: Option<&str>) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::unistd::{Gid, Group, Uid, User, chown};

            let uid: Option<Uid> = Some(
                User::from_name(owner)
                    .with_context(|| format!("lookup user {owner}"))?
                    .ok_or_else(|| anyhow!("unknown user {owner}"))?
                    .uid,
            );
            let gid: Option<Gid> = match group {
                Some(g) => Some(
                    Group::from_name(g)
                        .with_context(|| format!("lookup group {g}"))?
                        .ok_or_else(|| anyhow!("unknown group {g}"))?
                        .gid,
                ),
                None => None,
            };
            chown(path, uid, gid).with_context(|| format!("chown {}", path.display()))
        }
        #[cfg(not(unix))]
        {
            let _ = (path, owner, group);
            Err(anyhow!("chown is not supported on this platform"))
        }
    }

    fn setfacl(&self, path: &Path, acls: &[String]) -> Result<()> {
        let output = Command::new("setfacl")
            .arg("-m")
            .arg(acls.join(","))
            .arg(path)
            .output()
            .context("run setfacl")?;
        if !output.status.success() {
            return Err(anyhow!(
                "setfacl on {} failed: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }

    fn set_context(&self, path: &Path, context: &SeContext) -> Result<()> {
        let resolved = std::fs::canonicalize(path)
            .with_context(|| format!("resolve {}", path.display()))?;

        let mut cmd = Command::new("chcon");
        if let Some(user) = &context.user {
            cmd.arg("-u").arg(user);
        }
        cmd.arg("-t").arg(&context.context_type);
        if let Some(range) = &context.range {
            cmd.arg("-l").arg(range);
        }
        cmd.arg(&resolved);

        let output = match cmd.output() {
            Ok(o) => o,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(anyhow!("SELinux tooling (chcon) is not installed"));
            }
            Err(e) => return Err(e).context("run chcon"),
        };
        if !output.status.success() {
            return Err(anyhow!(
                "chcon on {} failed: {}",
                resolved.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }

    fn remove_context(&self, path: &Path) {
        let resolved = match std::fs::canonicalize(path) {
            Ok(p) => p,
            Err(_) => return,
        };
        let _ = Command::new("restorecon").arg(&resolved).output();
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
        };

        if meta.is_dir() {
            match std::fs::remove_dir(path) {
                Ok(()) => Ok(()),
                // occupied directories are left in place
                Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => Ok(()),
                Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => Ok(()),
                Err(e) => Err(e).with_context(|| format!("rmdir {}", path.display())),
            }
        } else {
            match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("rm {}", path.display())),
            }
        }
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("rm -r {}", path.display())),
        }
    }
}

/// Write a file atomically: temp file in the same directory, then rename.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("rename temp file to {}", path.display()))?;
    Ok(())
}
