//! Point-in-time route listings.
//!
//! The walker visits the whole tree on every call; the result is a value the
//! caller owns outright. Underscore-prefixed entries are skipped wholesale,
//! matching what the request path parser will ever let through.

use std::io;
use std::path::Path;

use serde::Serialize;

use crate::statics::content_type_for;
use crate::version::file_version;

/// One routable handler file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerRouteEntry {
    pub route: String,
    pub file_path: String,
    pub version: String,
}

/// One routable static file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticRouteEntry {
    pub route: String,
    pub file_path: String,
    pub size: u64,
    pub content_type: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSnapshot {
    pub handlers: Vec<HandlerRouteEntry>,
    pub static_files: Vec<StaticRouteEntry>,
}

/// Walk the dynamic directory and list every routable entry, sorted by
/// route. When a directory's `index.mjs` and a sibling `<dir>.mjs` project
/// to the same route, the index entry wins.
pub fn route_snapshot(root: &Path) -> io::Result<RouteSnapshot> {
    let root = root.canonicalize()?;
    let mut handlers: Vec<(u8, HandlerRouteEntry)> = Vec::new();
    let mut static_files = Vec::new();
    walk(&root, &root, &mut handlers, &mut static_files)?;

    // Priority 0 (index.mjs) beats priority 1 (named module) per route.
    handlers.sort_by(|a, b| a.1.route.cmp(&b.1.route).then(a.0.cmp(&b.0)));
    let mut deduped: Vec<HandlerRouteEntry> = Vec::with_capacity(handlers.len());
    for (_, entry) in handlers {
        if deduped
            .last()
            .map(|last| last.route == entry.route)
            .unwrap_or(false)
        {
            continue;
        }
        deduped.push(entry);
    }

    static_files.sort_by(|a: &StaticRouteEntry, b: &StaticRouteEntry| a.route.cmp(&b.route));

    Ok(RouteSnapshot {
        handlers: deduped,
        static_files,
    })
}

fn walk(
    root: &Path,
    dir: &Path,
    handlers: &mut Vec<(u8, HandlerRouteEntry)>,
    static_files: &mut Vec<StaticRouteEntry>,
) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with('_') {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, handlers, static_files)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let relative = relative_path(root, &path);
        if name.ends_with(".mjs") {
            let Some(version) = file_version(&path)? else {
                continue;
            };
            let (route, priority) = handler_route(&relative);
            handlers.push((
                priority,
                HandlerRouteEntry {
                    route,
                    file_path: relative,
                    version,
                },
            ));
        } else {
            let metadata = entry.metadata()?;
            static_files.push(StaticRouteEntry {
                route: format!("/{}", relative),
                file_path: relative,
                size: metadata.len(),
                content_type: content_type_for(&path),
            });
        }
    }
    Ok(())
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Project a handler's relative path to its route. `index.mjs` routes to
/// its directory (priority 0); `name.mjs` routes to the stripped name
/// (priority 1).
fn handler_route(relative: &str) -> (String, u8) {
    let stem = relative.trim_end_matches(".mjs");
    if stem == "index" {
        return ("/".to_string(), 0);
    }
    if let Some(dir) = stem.strip_suffix("/index") {
        return (format!("/{}", dir), 0);
    }
    (format!("/{}", stem), 1)
}
