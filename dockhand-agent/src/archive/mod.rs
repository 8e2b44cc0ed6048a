//! Revision bundle codecs: tar, tar+gzip and zip.
//!
//! Every codec applies the same three rules: entries that escape the
//! destination root are rejected; tar entries with mode 0 land as 0644;
//! and a single wrapping directory is stripped when it contains something
//! named like an appspec, so GitHub-style tarballs unpack to a usable root.

use dockhand_shared::deployment::BundleType;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("archive entry {0} escapes the extraction root")]
    PathTraversal(String),
    #[error("malformed archive: {0}")]
    BadArchive(String),
    #[error("io error during extraction: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Unpacker: Send + Sync {
    fn unpack(&self, bundle: &Path, bundle_type: BundleType, dest: &Path) -> Result<(), CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BundleCodec;

impl Unpacker for BundleCodec {
    fn unpack(&self, bundle: &Path, bundle_type: BundleType, dest: &Path) -> Result<(), CodecError> {
        std::fs::create_dir_all(dest)?;
        match bundle_type {
            BundleType::Tar => unpack_tar(File::open(bundle)?, dest)?,
            BundleType::Tgz => unpack_tar(GzDecoder::new(File::open(bundle)?), dest)?,
            BundleType::Zip => unpack_zip(File::open(bundle)?, dest)?,
        }
        strip_wrapper_dir(dest)?;
        Ok(())
    }
}

/// Relative, dot-free form of an entry path; anything else is a traversal.
fn sanitize_entry_path(raw: &Path) -> Result<PathBuf, CodecError> {
    let mut clean = PathBuf::new();
    for comp in raw.components() {
        match comp {
            Component::Normal(seg) => clean.push(seg),
            Component::CurDir => {}
            _ => {
                return Err(CodecError::PathTraversal(raw.display().to_string()));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(CodecError::BadArchive("empty entry path".to_string()));
    }
    Ok(clean)
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<(), CodecError> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive
        .entries()
        .map_err(|e| CodecError::BadArchive(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| CodecError::BadArchive(e.to_string()))?;
        let raw = entry
            .path()
            .map_err(|e| CodecError::BadArchive(e.to_string()))?
            .into_owned();
        let rel = sanitize_entry_path(&raw)?;
        let out = dest.join(&rel);

        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&out)
            .map_err(|e| CodecError::BadArchive(format!("{}: {e}", rel.display())))?;

        // some producers emit files with no mode bits at all
        #[cfg(unix)]
        if entry.header().entry_type().is_file()
            && entry.header().mode().unwrap_or(0o644) == 0
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out, std::fs::Permissions::from_mode(0o644))?;
        }
    }
    Ok(())
}

fn unpack_zip<R: Read + std::io::Seek>(reader: R, dest: &Path) -> Result<(), CodecError> {
    let mut archive =
        zip::ZipArchive::new(reader).map_err(|e| CodecError::BadArchive(e.to_string()))?;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| CodecError::BadArchive(e.to_string()))?;
        let rel = match file.enclosed_name() {
            Some(p) => sanitize_entry_path(&p)?,
            None => return Err(CodecError::PathTraversal(file.name().to_string())),
        };
        let out = dest.join(&rel);

        if file.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = File::create(&out)?;
        std::io::copy(&mut file, &mut writer)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = match file.unix_mode() {
                Some(m) if m & 0o7777 != 0 => m & 0o7777,
                _ => 0o644,
            };
            std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

/// GitHub tarballs wrap the repository in `<account>-<repo>-<sha>/`. If the
/// destination holds exactly one directory and that directory contains a
/// name matching `appspec` (case-insensitive), hoist its contents up.
fn strip_wrapper_dir(dest: &Path) -> Result<(), CodecError> {
    let entries: Vec<_> = std::fs::read_dir(dest)?.collect::<Result<_, _>>()?;
    let [only] = entries.as_slice() else {
        return Ok(());
    };
    let wrapper = only.path();
    if !wrapper.is_dir() {
        return Ok(());
    }

    let mut has_appspec = false;
    for child in std::fs::read_dir(&wrapper)? {
        let name = child?.file_name().to_string_lossy().to_lowercase();
        if name.contains("appspec") {
            has_appspec = true;
            break;
        }
    }
    if !has_appspec {
        return Ok(());
    }

    for child in std::fs::read_dir(&wrapper)?.collect::<Result<Vec<_>, _>>()? {
        let from = child.path();
        let to = dest.join(child.file_name());
        std::fs::rename(&from, &to)?;
    }
    std::fs::remove_dir(&wrapper)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tar_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            // Write the path into the raw header bytes directly so traversal
            // paths (`..`) can be exercised in tests; `append_data` rejects
            // them before the archive is even built.
            let name_bytes = path.as_bytes();
            header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
            header.set_cksum();
            builder.append(&header, contents.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn write_bundle(dir: &Path, bytes: &[u8]) -> PathBuf {
        let bundle = dir.join("bundle.tar");
        std::fs::write(&bundle, bytes).unwrap();
        bundle
    }

    #[test]
    fn test_unpack_tar() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(
            dir.path(),
            &tar_bytes(&[("appspec.yml", "version: 0.0\n"), ("bin/run.sh", "echo hi\n")]),
        );
        let dest = dir.path().join("out");

        BundleCodec.unpack(&bundle, BundleType::Tar, &dest).unwrap();
        assert!(dest.join("appspec.yml").is_file());
        assert_eq!(
            std::fs::read_to_string(dest.join("bin/run.sh")).unwrap(),
            "echo hi\n"
        );
    }

    #[test]
    fn test_unpack_tgz() {
        let dir = tempfile::tempdir().unwrap();
        let tar = tar_bytes(&[("appspec.yml", "version: 0.0\n")]);
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar).unwrap();
        let bundle = write_bundle(dir.path(), &encoder.finish().unwrap());
        let dest = dir.path().join("out");

        BundleCodec.unpack(&bundle, BundleType::Tgz, &dest).unwrap();
        assert!(dest.join("appspec.yml").is_file());
    }

    #[test]
    fn test_unpack_zip() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("appspec.yml", options).unwrap();
        writer.write_all(b"version: 0.0\n").unwrap();
        writer.add_directory("scripts", options).unwrap();
        writer.start_file("scripts/run.sh", options).unwrap();
        writer.write_all(b"echo hi\n").unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        let bundle = write_bundle(dir.path(), &bytes);
        let dest = dir.path().join("out");

        BundleCodec.unpack(&bundle, BundleType::Zip, &dest).unwrap();
        assert!(dest.join("scripts/run.sh").is_file());
    }

    #[test]
    fn test_traversal_entry_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(
            dir.path(),
            &tar_bytes(&[("../../../etc/evil.txt", "pwned\n")]),
        );
        let dest = dir.path().join("out");

        let err = BundleCodec
            .unpack(&bundle, BundleType::Tar, &dest)
            .unwrap_err();
        assert!(matches!(err, CodecError::PathTraversal(_)));
        assert!(!dir.path().join("etc/evil.txt").exists());
        assert!(!dest.join("etc/evil.txt").exists());
    }

    #[test]
    fn test_zero_mode_files_become_0644() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0);
        header.set_cksum();
        builder.append_data(&mut header, "appspec.yml", &b"ok\n"[..]).unwrap();
        let bundle = write_bundle(dir.path(), &builder.into_inner().unwrap());
        let dest = dir.path().join("out");

        BundleCodec.unpack(&bundle, BundleType::Tar, &dest).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dest.join("appspec.yml"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o7777, 0o644);
        }
    }

    #[test]
    fn test_wrapper_with_appspec_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(
            dir.path(),
            &tar_bytes(&[
                ("octo-app-abc123/appspec.yml", "version: 0.0\n"),
                ("octo-app-abc123/bin/run.sh", "echo hi\n"),
            ]),
        );
        let dest = dir.path().join("out");

        BundleCodec.unpack(&bundle, BundleType::Tar, &dest).unwrap();
        assert!(dest.join("appspec.yml").is_file());
        assert!(dest.join("bin/run.sh").is_file());
        assert!(!dest.join("octo-app-abc123").exists());
    }

    #[test]
    fn test_wrapper_without_appspec_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(
            dir.path(),
            &tar_bytes(&[("wrapper/readme.md", "docs\n")]),
        );
        let dest = dir.path().join("out");

        BundleCodec.unpack(&bundle, BundleType::Tar, &dest).unwrap();
        assert!(dest.join("wrapper/readme.md").is_file());
    }

    #[test]
    fn test_appspec_substring_triggers_strip() {
        // inherited heuristic: substring match, case-insensitive
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(
            dir.path(),
            &tar_bytes(&[("wrapper/AppSpec-template.txt", "x\n")]),
        );
        let dest = dir.path().join("out");

        BundleCodec.unpack(&bundle, BundleType::Tar, &dest).unwrap();
        assert!(dest.join("AppSpec-template.txt").is_file());
        assert!(!dest.join("wrapper").exists());
    }
}
