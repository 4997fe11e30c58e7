//! Request dispatch and snapshots.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use fluxion_pool::{
    PoolError, StrategyError, WorkerPool, WorkerStatusSnapshot,
};
use fluxion_protocol::{ExecutePayload, InspectPayload, WorkerErrorCode};
use fluxion_routing::{
    parse_request_path, route_snapshot, HandlerResolver, ResolvedHandler, RouteSnapshot,
    StaticFileResponse, StaticResponder,
};

use crate::config::FluxionConfig;
use crate::meta_cache::HandlerMetaCache;

/// A buffered request handed in by the HTTP boundary. The body has already
/// been read once (bodies are single-consumer) and capped.
#[derive(Debug, Clone)]
pub struct RuntimeRequest {
    pub method: String,
    pub url: String,
    /// Pathname only, no query string.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub ip: String,
}

/// What the boundary should write back.
#[derive(Debug)]
pub enum RuntimeResponse {
    Handler {
        status: u16,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    },
    Static(StaticFileResponse),
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Worker(#[from] PoolError),
    #[error("i/o failure during dispatch: {0}")]
    Io(#[from] io::Error),
}

impl DispatchError {
    pub fn code(&self) -> Option<WorkerErrorCode> {
        match self {
            DispatchError::Worker(err) => err.code(),
            DispatchError::Io(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeInitError {
    #[error("failed to open dynamic directory: {0}")]
    Io(#[from] io::Error),
    #[error("invalid worker strategy: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Strategy(Vec<StrategyError>),
}

/// Top-level orchestrator: owns the pool, the caches, and the directory.
pub struct FileRuntime {
    resolver: HandlerResolver,
    statics: StaticResponder,
    pool: WorkerPool,
    meta_cache: HandlerMetaCache,
    /// Last version dispatched per handler, for load/reload logging.
    loaded: Mutex<HashMap<PathBuf, String>>,
    root: PathBuf,
}

impl FileRuntime {
    pub fn new(config: &FluxionConfig) -> Result<Arc<Self>, RuntimeInitError> {
        let resolver = HandlerResolver::new(&config.dir)?;
        let statics = StaticResponder::new(&config.dir)?;
        let pool = WorkerPool::build(
            &config.databases,
            &config.worker_strategy,
            &config.worker_options,
        )
        .map_err(RuntimeInitError::Strategy)?;
        let root = resolver.root().to_path_buf();

        tracing::info!(
            "file runtime ready: dir {}, {} worker binding(s)",
            root.display(),
            pool.bindings().len()
        );

        Ok(Arc::new(Self {
            resolver,
            statics,
            pool,
            meta_cache: HandlerMetaCache::new(),
            loaded: Mutex::new(HashMap::new()),
            root,
        }))
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Route one request: handler first, static on miss, not-found last.
    pub async fn dispatch(&self, request: RuntimeRequest) -> Result<RuntimeResponse, DispatchError> {
        let Some(parsed) = parse_request_path(&request.path) else {
            return Ok(RuntimeResponse::NotFound);
        };

        if let Some(handler) = self.resolver.resolve(&parsed)? {
            return self.dispatch_handler(handler, request).await;
        }

        if let Some(response) = self.statics.respond(&request.method, &parsed)? {
            return Ok(RuntimeResponse::Static(response));
        }

        Ok(RuntimeResponse::NotFound)
    }

    async fn dispatch_handler(
        &self,
        handler: ResolvedHandler,
        request: RuntimeRequest,
    ) -> Result<RuntimeResponse, DispatchError> {
        let meta = match self.meta_cache.get(&handler.file_path, &handler.version) {
            Some(meta) => meta,
            None => {
                let binding = self.pool.inspect_binding();
                let meta = binding
                    .supervisor
                    .inspect(InspectPayload {
                        file_path: handler.file_path.clone(),
                        version: handler.version.clone(),
                    })
                    .await?;
                self.meta_cache
                    .insert(&handler.file_path, &handler.version, meta.clone());
                meta
            }
        };

        self.log_version_transition(&handler);

        let binding = self.pool.select(&meta.db);
        let payload = ExecutePayload {
            file_path: handler.file_path.clone(),
            version: handler.version.clone(),
            method: request.method,
            url: request.url,
            headers: request.headers,
            body: request.body,
            ip: request.ip,
        };

        let success = match binding.supervisor.execute(payload.clone()).await {
            // The file changed between our resolve and the worker's cache
            // lookup. Rotate the worker and retry exactly once.
            Err(PoolError::Handler(err))
                if err.has_code(WorkerErrorCode::VersionMismatch) =>
            {
                tracing::debug!(
                    "version race on {}, retrying after restart",
                    handler.file_path.display()
                );
                binding
                    .supervisor
                    .restart("handler version changed during dispatch")
                    .await;
                binding.supervisor.execute(payload).await?
            }
            other => other?,
        };

        self.meta_cache
            .insert(&handler.file_path, &handler.version, success.reply.meta.clone());

        tracing::debug!(
            "handler {} served in {}ms (heap {} bytes)",
            handler.file_path.display(),
            success.elapsed_ms,
            success.heap_used
        );

        Ok(RuntimeResponse::Handler {
            status: success.reply.response.status,
            headers: success.reply.response.headers,
            body: success.reply.response.body,
        })
    }

    fn log_version_transition(&self, handler: &ResolvedHandler) {
        let mut loaded = self.loaded.lock().expect("loaded lock poisoned");
        match loaded.insert(handler.file_path.clone(), handler.version.clone()) {
            None => {
                tracing::info!(
                    "handler loaded: {} ({})",
                    handler.file_path.display(),
                    handler.version
                );
            }
            Some(previous) if previous != handler.version => {
                tracing::info!(
                    "handler reloaded: {} ({} -> {})",
                    handler.file_path.display(),
                    previous,
                    handler.version
                );
            }
            Some(_) => {}
        }
    }

    /// Current route listing, straight off the tree.
    pub fn route_snapshot(&self) -> io::Result<RouteSnapshot> {
        route_snapshot(&self.root)
    }

    /// Per-binding status for the meta API.
    pub async fn worker_snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots = Vec::with_capacity(self.pool.bindings().len());
        for binding in self.pool.bindings() {
            snapshots.push(WorkerSnapshot {
                id: binding.id.clone(),
                status: binding.supervisor.snapshot().await,
                db_set: binding.db_set.clone(),
                is_fallback_all_db: binding.is_fallback_all_db,
            });
        }
        snapshots
    }

    /// Shut every worker down; idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// One worker binding as shown by `/_fluxion/workers`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: String,
    #[serde(flatten)]
    pub status: WorkerStatusSnapshot,
    pub db_set: Vec<String>,
    pub is_fallback_all_db: bool,
}
