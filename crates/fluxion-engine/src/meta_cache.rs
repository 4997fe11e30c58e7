//! Dispatcher-side mirror of worker handler metadata.
//!
//! Worker selection needs a handler's declared database set before any
//! worker has run it. The first resolution pays for an inspect round-trip;
//! afterwards the `(path, version)` pair answers from here. A new version
//! simply replaces the old entry, so stale versions never accumulate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fluxion_protocol::HandlerMeta;

#[derive(Default)]
pub struct HandlerMetaCache {
    entries: Mutex<HashMap<PathBuf, (String, HandlerMeta)>>,
}

impl HandlerMetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path, version: &str) -> Option<HandlerMeta> {
        let entries = self.entries.lock().expect("meta cache lock poisoned");
        entries
            .get(path)
            .filter(|(cached, _)| cached == version)
            .map(|(_, meta)| meta.clone())
    }

    pub fn insert(&self, path: &Path, version: &str, meta: HandlerMeta) {
        let mut entries = self.entries.lock().expect("meta cache lock poisoned");
        entries.insert(path.to_path_buf(), (version.to_string(), meta));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("meta cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
