//! Static file serving on handler miss.
//!
//! Only GET and HEAD reach the filesystem; everything else is a no-match so
//! the boundary can answer 404 uniformly. Content type comes from the
//! extension table; unknown extensions fall back to raw bytes.

use std::io;
use std::path::{Path, PathBuf};

use crate::path::ParsedPath;
use crate::version::absent;

/// A static file ready to be written to the socket. `body` is `None` for
/// HEAD responses; `content_length` always reflects the file size.
#[derive(Debug, Clone)]
pub struct StaticFileResponse {
    pub content_type: &'static str,
    pub content_length: u64,
    pub body: Option<Vec<u8>>,
}

/// Serves non-`.mjs` files from the dynamic directory.
#[derive(Debug, Clone)]
pub struct StaticResponder {
    root: PathBuf,
}

impl StaticResponder {
    pub fn new(root: &Path) -> io::Result<Self> {
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    /// Serve a file for the parsed path, or `Ok(None)` on a clean miss.
    pub fn respond(
        &self,
        method: &str,
        parsed: &ParsedPath,
    ) -> io::Result<Option<StaticFileResponse>> {
        let head = match method {
            "GET" => false,
            "HEAD" => true,
            _ => return Ok(None),
        };
        // No bare directory listings, and module source stays private.
        if parsed.segments.is_empty() || parsed.pathname.ends_with(".mjs") {
            return Ok(None);
        }

        let mut candidate = self.root.clone();
        for segment in &parsed.segments {
            candidate.push(segment);
        }
        if candidate.extension().map(|ext| ext == "mjs").unwrap_or(false) {
            return Ok(None);
        }

        let canonical = match candidate.canonicalize() {
            Ok(path) => path,
            Err(err) if absent(&err) => return Ok(None),
            Err(err) => return Err(err),
        };
        if !canonical.starts_with(&self.root) {
            return Ok(None);
        }

        let metadata = match std::fs::metadata(&canonical) {
            Ok(metadata) => metadata,
            Err(err) if absent(&err) => return Ok(None),
            Err(err) => return Err(err),
        };
        if !metadata.is_file() {
            return Ok(None);
        }

        let body = if head {
            None
        } else {
            Some(std::fs::read(&canonical)?)
        };

        Ok(Some(StaticFileResponse {
            content_type: content_type_for(&canonical),
            content_length: metadata.len(),
            body,
        }))
    }
}

/// Content type by file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("css") => "text/css; charset=utf-8",
        Some("html") => "text/html; charset=utf-8",
        Some("ico") => "image/x-icon",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        Some("map") => "application/json; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain; charset=utf-8",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
