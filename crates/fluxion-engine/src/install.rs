//! Module archive installation.
//!
//! Operators upload `.tar`, `.tar.gz`, or `.tgz` archives. A nested archive
//! (everything under a single top-level directory) installs as that
//! directory; a flat archive installs under a directory named after the
//! archive file. Zip archives and empty archives are rejected outright, and
//! entry paths are checked against traversal before anything is written.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),
    #[error("archive is empty")]
    EmptyArchive,
    #[error("archive entry escapes the module root: {0}")]
    UnsafeEntry(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub module: String,
    pub files: usize,
}

enum ArchiveKind {
    Plain,
    Gzipped,
}

/// Install an uploaded archive into the dynamic directory.
pub fn install_archive(root: &Path, archive: &Path) -> Result<InstallReport, InstallError> {
    let file_name = archive
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let (kind, base_name) = classify(file_name)?;

    // First pass: collect and sanitize entry paths to pick the layout.
    let entries = list_file_entries(archive, &kind)?;
    if entries.is_empty() {
        return Err(InstallError::EmptyArchive);
    }

    let nested_dir = nested_top_level(&entries);
    let module = nested_dir.clone().unwrap_or_else(|| base_name.clone());

    // Second pass: extract. Flat archives gain a directory named after the
    // archive file; nested archives already carry theirs.
    let mut unpacked = 0usize;
    let mut tar = open_archive(archive, &kind)?;
    for entry in tar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let rel = sanitized(&entry.path()?)?;
        let target = match &nested_dir {
            Some(_) => root.join(&rel),
            None => root.join(&module).join(&rel),
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
        unpacked += 1;
    }

    tracing::info!("installed module {} ({} files)", module, unpacked);

    Ok(InstallReport {
        module,
        files: unpacked,
    })
}

fn classify(file_name: &str) -> Result<(ArchiveKind, String), InstallError> {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") {
        return Ok((ArchiveKind::Gzipped, file_name[..file_name.len() - 7].to_string()));
    }
    if lower.ends_with(".tgz") {
        return Ok((ArchiveKind::Gzipped, file_name[..file_name.len() - 4].to_string()));
    }
    if lower.ends_with(".tar") {
        return Ok((ArchiveKind::Plain, file_name[..file_name.len() - 4].to_string()));
    }
    if lower.ends_with(".zip") {
        return Err(InstallError::UnsupportedFormat(
            "zip archives are not supported, use tar or tar.gz".to_string(),
        ));
    }
    Err(InstallError::UnsupportedFormat(file_name.to_string()))
}

fn open_archive(path: &Path, kind: &ArchiveKind) -> Result<tar::Archive<Box<dyn Read>>, InstallError> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = match kind {
        ArchiveKind::Plain => Box::new(file),
        ArchiveKind::Gzipped => Box::new(GzDecoder::new(file)),
    };
    Ok(tar::Archive::new(reader))
}

fn list_file_entries(path: &Path, kind: &ArchiveKind) -> Result<Vec<PathBuf>, InstallError> {
    let mut tar = open_archive(path, kind)?;
    let mut files = Vec::new();
    for entry in tar.entries()? {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        files.push(sanitized(&entry.path()?)?);
    }
    Ok(files)
}

/// Reject absolute paths and traversal components; returns the normalized
/// relative path.
fn sanitized(path: &Path) -> Result<PathBuf, InstallError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(InstallError::UnsafeEntry(
                    path.to_string_lossy().into_owned(),
                ))
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(InstallError::UnsafeEntry(
            path.to_string_lossy().into_owned(),
        ));
    }
    Ok(out)
}

/// `Some(name)` when every file sits under the same single top-level
/// directory.
fn nested_top_level(entries: &[PathBuf]) -> Option<String> {
    let mut top: Option<String> = None;
    for entry in entries {
        let mut components = entry.components();
        let first = components.next()?.as_os_str().to_str()?.to_string();
        // A top-level file means the layout is flat.
        components.next()?;
        match &top {
            None => top = Some(first),
            Some(existing) if *existing == first => {}
            Some(_) => return None,
        }
    }
    top
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tar(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            let name_bytes = name.as_bytes();
            header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
            header.set_cksum();
            builder.append(&header, contents.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
    }

    fn write_tgz(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
    }

    #[test]
    fn nested_archive_installs_under_its_own_directory() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("upload.tar");
        write_tar(
            &archive,
            &[("blog/index.mjs", "export default () => {};"), ("blog/style.css", "body{}")],
        );

        let root = tempfile::tempdir().unwrap();
        let report = install_archive(root.path(), &archive).unwrap();
        assert_eq!(report.module, "blog");
        assert_eq!(report.files, 2);
        assert!(root.path().join("blog/index.mjs").is_file());
        assert!(root.path().join("blog/style.css").is_file());
    }

    #[test]
    fn flat_archive_takes_its_name_from_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("shop.tar");
        write_tar(&archive, &[("index.mjs", "export default () => {};")]);

        let root = tempfile::tempdir().unwrap();
        let report = install_archive(root.path(), &archive).unwrap();
        assert_eq!(report.module, "shop");
        assert!(root.path().join("shop/index.mjs").is_file());
    }

    #[test]
    fn gzipped_archives_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("site.tgz");
        write_tgz(&archive, &[("site/index.mjs", "export default () => {};")]);

        let root = tempfile::tempdir().unwrap();
        let report = install_archive(root.path(), &archive).unwrap();
        assert_eq!(report.module, "site");
        assert!(root.path().join("site/index.mjs").is_file());
    }

    #[test]
    fn zip_archives_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("mod.zip");
        std::fs::write(&archive, b"PK\x03\x04").unwrap();

        let root = tempfile::tempdir().unwrap();
        let err = install_archive(root.path(), &archive).unwrap_err();
        assert!(matches!(err, InstallError::UnsupportedFormat(_)));
    }

    #[test]
    fn empty_archives_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("empty.tar");
        write_tar(&archive, &[]);

        let root = tempfile::tempdir().unwrap();
        let err = install_archive(root.path(), &archive).unwrap_err();
        assert!(matches!(err, InstallError::EmptyArchive));
    }

    #[test]
    fn traversal_entries_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.tar");
        write_tar(&archive, &[("../outside.mjs", "export default 1;")]);

        let root = tempfile::tempdir().unwrap();
        let err = install_archive(root.path(), &archive).unwrap_err();
        assert!(matches!(err, InstallError::UnsafeEntry(_)));
    }

    #[test]
    fn mixed_top_levels_install_flat() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.tar");
        write_tar(
            &archive,
            &[("a/index.mjs", "export default 1;"), ("b.txt", "hi")],
        );

        let root = tempfile::tempdir().unwrap();
        let report = install_archive(root.path(), &archive).unwrap();
        assert_eq!(report.module, "bundle");
        assert!(root.path().join("bundle/a/index.mjs").is_file());
        assert!(root.path().join("bundle/b.txt").is_file());
    }
}
