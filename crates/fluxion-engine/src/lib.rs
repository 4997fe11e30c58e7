//! The file runtime: composition root for routing and worker pools.
//!
//! A `FileRuntime` owns the resolver, the static responder, the worker
//! bindings, and the dispatcher-side caches. The HTTP boundary hands it a
//! buffered request and gets back a value describing what to write to the
//! socket; nothing in here touches sockets directly.

pub mod config;
pub mod install;
pub mod meta_cache;
pub mod runtime;

pub use config::{load_config, validate_config, ConfigError, FluxionConfig};
pub use install::{install_archive, InstallError, InstallReport};
pub use runtime::{
    DispatchError, FileRuntime, RuntimeInitError, RuntimeRequest, RuntimeResponse, WorkerSnapshot,
};
