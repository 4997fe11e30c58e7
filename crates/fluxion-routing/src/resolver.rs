//! Handler candidate resolution.
//!
//! Segments map to at most two candidate files: the directory's `index.mjs`
//! and the sibling `<name>.mjs`, in that order. The first candidate that
//! exists (carries a version) wins. Candidates are re-verified to sit under
//! the canonical root after resolution; segments that passed parsing can
//! still point outside the tree through symlinks.

use std::io;
use std::path::{Path, PathBuf};

use crate::path::ParsedPath;
use crate::version::{absent, file_version};

/// A handler file picked for a request, with its current version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHandler {
    pub file_path: PathBuf,
    pub version: String,
}

/// Resolves parsed request paths to handler files under one root.
#[derive(Debug, Clone)]
pub struct HandlerResolver {
    root: PathBuf,
}

impl HandlerResolver {
    /// `root` must exist; it is canonicalized once so later containment
    /// checks compare canonical paths.
    pub fn new(root: &Path) -> io::Result<Self> {
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a request to a handler file, or `Ok(None)` on a clean miss.
    pub fn resolve(&self, parsed: &ParsedPath) -> io::Result<Option<ResolvedHandler>> {
        // Module source is never served as a dynamic route via its literal
        // name.
        if parsed.pathname.ends_with(".mjs") {
            return Ok(None);
        }

        for candidate in self.candidates(&parsed.segments) {
            let canonical = match candidate.canonicalize() {
                Ok(path) => path,
                Err(err) if absent(&err) => continue,
                Err(err) => return Err(err),
            };
            if !canonical.starts_with(&self.root) {
                tracing::warn!(
                    "handler candidate {} resolves outside the dynamic directory, skipping",
                    candidate.display()
                );
                continue;
            }
            if let Some(version) = file_version(&canonical)? {
                return Ok(Some(ResolvedHandler {
                    file_path: canonical,
                    version,
                }));
            }
        }
        Ok(None)
    }

    fn candidates(&self, segments: &[String]) -> Vec<PathBuf> {
        if segments.is_empty() {
            return vec![self.root.join("index.mjs")];
        }
        let mut dir = self.root.clone();
        for segment in segments {
            dir.push(segment);
        }
        let index = dir.join("index.mjs");
        let mut named = dir.into_os_string();
        named.push(".mjs");
        vec![index, PathBuf::from(named)]
    }
}
