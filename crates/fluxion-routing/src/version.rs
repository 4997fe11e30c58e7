//! File version tokens.
//!
//! A version is the string `"<mtime-ms>:<size-bytes>"`. Version equality is
//! the only cache-validity signal in the system: callers map versions to
//! loaded artifacts, this layer never caches anything itself.

use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Derive the version token for a regular file.
///
/// `Ok(None)` means the path is missing or not a regular file; real I/O
/// failures (permissions, hardware) propagate.
pub fn file_version(path: &Path) -> io::Result<Option<String>> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if absent(&err) => return Ok(None),
        Err(err) => return Err(err),
    };
    if !metadata.is_file() {
        return Ok(None);
    }
    let mtime_ms = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    Ok(Some(format!("{}:{}", mtime_ms, metadata.len())))
}

/// ENOENT and ENOTDIR both mean "no such file here", not failure.
pub(crate) fn absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn regular_file_gets_mtime_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"hello").unwrap();

        let version = file_version(&file).unwrap().unwrap();
        let (mtime, size) = version.split_once(':').unwrap();
        assert!(mtime.parse::<u128>().unwrap() > 0);
        assert_eq!(size, "5");
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(file_version(&dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn path_through_a_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();
        assert_eq!(file_version(&file.join("below")).unwrap(), None);
    }

    #[test]
    fn directory_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(file_version(dir.path()).unwrap(), None);
    }

    #[test]
    fn content_change_produces_new_version() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"one").unwrap();
        let v1 = file_version(&file).unwrap().unwrap();
        fs::write(&file, b"longer content").unwrap();
        let v2 = file_version(&file).unwrap().unwrap();
        assert_ne!(v1, v2);
    }
}
