//! Tracing initialisation and the size-bounded rotating agent log.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

struct RotatingState {
    file: Option<File>,
    written: u64,
}

struct RotatingInner {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    state: Mutex<RotatingState>,
}

/// A log writer that rotates when the next write would exceed the size
/// bound, keeping at most `max_files` numbered backups (newest `.1`).
/// Writes serialise under the internal mutex; clones share one file.
#[derive(Clone)]
pub struct RotatingWriter(Arc<RotatingInner>);

impl RotatingWriter {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, max_files: usize) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {parent:?}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {path:?}"))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self(Arc::new(RotatingInner {
            path,
            max_bytes,
            max_files,
            state: Mutex::new(RotatingState {
                file: Some(file),
                written,
            }),
        })))
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        let mut os = self.0.path.clone().into_os_string();
        os.push(format!(".{n}"));
        PathBuf::from(os)
    }

    fn rotate(&self, state: &mut RotatingState) -> std::io::Result<()> {
        state.file = None;

        if self.0.max_files == 0 {
            let _ = std::fs::remove_file(&self.0.path);
        } else {
            let _ = std::fs::remove_file(self.backup_path(self.0.max_files));
            for n in (1..self.0.max_files).rev() {
                let _ = std::fs::rename(self.backup_path(n), self.backup_path(n + 1));
            }
            let _ = std::fs::rename(&self.0.path, self.backup_path(1));
        }

        state.file = Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.0.path)?,
        );
        state.written = 0;
        Ok(())
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.0.state.lock().expect("log writer poisoned");
        if state.written > 0 && state.written + buf.len() as u64 > self.0.max_bytes {
            self.rotate(&mut state)?;
        }
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("log file closed"))?;
        let n = file.write(buf)?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut state = self.0.state.lock().expect("log writer poisoned");
        match state.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initialise global tracing: stdout fmt layer plus a rotating file layer.
pub fn init_tracing(log_path: &Path, max_bytes: u64, max_files: usize) -> Result<RotatingWriter> {
    let writer = RotatingWriter::new(log_path, max_bytes, max_files)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer.clone()),
        )
        .init();

    Ok(writer)
}

/// Stdout-only tracing for the one-shot subcommands.
pub fn init_tracing_stdout() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_keeps_bounded_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        let mut w = RotatingWriter::new(&path, 64, 2).unwrap();

        for i in 0..20 {
            writeln!(w, "line {i:04} padding padding padding").unwrap();
        }
        w.flush().unwrap();

        assert!(path.exists());
        assert!(dir.path().join("agent.log.1").exists());
        assert!(dir.path().join("agent.log.2").exists());
        assert!(!dir.path().join("agent.log.3").exists());
    }

    #[test]
    fn test_single_oversized_write_is_not_split() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        let mut w = RotatingWriter::new(&path, 16, 1).unwrap();

        // first write exceeds the bound on its own; it must still land whole
        w.write_all(b"0123456789abcdef0123456789abcdef").unwrap();
        w.flush().unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), 32);
    }

    #[test]
    fn test_resumes_existing_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, b"previous content\n").unwrap();

        let mut w = RotatingWriter::new(&path, 1024, 1).unwrap();
        w.write_all(b"more\n").unwrap();
        w.flush().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("previous content\n"));
        assert!(content.ends_with("more\n"));
    }
}
