//! Dispatcher-side ownership of one worker.
//!
//! The supervisor holds the only reference to its worker's channels, the
//! version table, and the in-flight request map. State machine:
//!
//! ```text
//! stopped → running     first execute/inspect or explicit start
//! running → restarting  memory hard limit | soft limit while idle |
//!                       request timeout | worker exit | version change |
//!                       clear_cache
//! restarting → running  fresh worker spawned
//! any → closed          close(); terminal
//! ```
//!
//! Restarts are serialized by the state lock: whoever triggers one finishes
//! it before anyone else can observe the supervisor mid-rotation. Every
//! outstanding request is rejected with the restart reason; their timers die
//! with the oneshot channels.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};

use fluxion_protocol::{
    CorrelationId, ExecutePayload, ExecuteReply, HandlerMeta, InspectPayload, MemorySample,
    WorkerCommand, WorkerEvent,
};

use crate::error::PoolError;
use crate::limits::{ExecutorOptions, MB};
use crate::worker::{spawn_worker, WorkerBootstrap, WorkerHandle};

/// A completed execute with its worker-side statistics.
#[derive(Debug)]
pub struct ExecuteSuccess {
    pub reply: ExecuteReply,
    pub elapsed_ms: u64,
    pub heap_used: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Running,
    Restarting,
    Closed,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Running => "running",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Closed => "closed",
        }
    }
}

enum InflightEntry {
    Execute(oneshot::Sender<Result<ExecuteSuccess, PoolError>>),
    Inspect(oneshot::Sender<Result<HandlerMeta, PoolError>>),
}

impl InflightEntry {
    fn reject(self, err: PoolError) {
        match self {
            InflightEntry::Execute(tx) => {
                let _ = tx.send(Err(err));
            }
            InflightEntry::Inspect(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// Tables the event pump touches without the state lock.
struct Shared {
    inflight: StdMutex<HashMap<CorrelationId, InflightEntry>>,
    inflight_count: AtomicUsize,
    memory: StdMutex<Option<MemoryReading>>,
}

#[derive(Clone, Copy)]
struct MemoryReading {
    sample: MemorySample,
    sampled_at: u64,
}

struct Inner {
    state: SupervisorState,
    worker: Option<WorkerHandle>,
    pump: Option<tokio::task::JoinHandle<()>>,
    /// Bumped on every spawn; stale pumps and memory checks compare against
    /// it before acting.
    generation: u64,
    versions: HashMap<PathBuf, String>,
    next_id: CorrelationId,
    restart_count: u64,
    last_restart_reason: Option<String>,
    last_restart_at: Option<u64>,
}

/// Owns one worker and its request lifecycle.
pub struct WorkerSupervisor {
    id: String,
    db_set: Vec<String>,
    options: ExecutorOptions,
    shared: Arc<Shared>,
    inner: Mutex<Inner>,
}

impl WorkerSupervisor {
    pub fn new(id: String, db_set: Vec<String>, options: ExecutorOptions) -> Arc<Self> {
        Arc::new(Self {
            id,
            db_set,
            options,
            shared: Arc::new(Shared {
                inflight: StdMutex::new(HashMap::new()),
                inflight_count: AtomicUsize::new(0),
                memory: StdMutex::new(None),
            }),
            inner: Mutex::new(Inner {
                state: SupervisorState::Stopped,
                worker: None,
                pump: None,
                generation: 0,
                versions: HashMap::new(),
                next_id: 1,
                restart_count: 0,
                last_restart_reason: None,
                last_restart_at: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn db_set(&self) -> &[String] {
        &self.db_set
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn inflight_count(&self) -> usize {
        self.shared.inflight_count.load(Ordering::Relaxed)
    }

    /// Spin the worker up without dispatching anything.
    pub async fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().await;
        self.ensure_worker(&mut inner)
    }

    /// Dispatch one handler invocation and await its result.
    pub async fn execute(
        self: &Arc<Self>,
        payload: ExecutePayload,
    ) -> Result<ExecuteSuccess, PoolError> {
        let (id, rx) = {
            let mut inner = self.inner.lock().await;
            if inner.state == SupervisorState::Closed {
                return Err(PoolError::Closed);
            }
            let inflight = self.inflight_count();
            if inflight >= self.options.max_inflight {
                return Err(PoolError::Overloaded {
                    inflight,
                    limit: self.options.max_inflight,
                });
            }
            // The cache-eviction contract: a version change rotates the
            // isolate before the new version becomes servable.
            let version_changed = inner
                .versions
                .get(&payload.file_path)
                .map(|known| *known != payload.version)
                .unwrap_or(false);
            if version_changed {
                self.restart_locked(
                    &mut inner,
                    &format!("handler version changed: {}", payload.file_path.display()),
                );
            }
            self.ensure_worker(&mut inner)?;
            inner
                .versions
                .insert(payload.file_path.clone(), payload.version.clone());

            let id = inner.next_id;
            inner.next_id += 1;
            let (tx, rx) = oneshot::channel();
            self.insert_inflight(id, InflightEntry::Execute(tx));

            let command = WorkerCommand::Execute { id, payload };
            if self.post(&inner, command).is_err() {
                self.take_inflight(id);
                self.restart_locked(&mut inner, "worker channel closed");
                return Err(PoolError::Restarted("worker channel closed".to_string()));
            }
            (id, rx)
        };

        self.await_reply(id, rx).await
    }

    /// Load a handler for its metadata only.
    pub async fn inspect(
        self: &Arc<Self>,
        payload: InspectPayload,
    ) -> Result<HandlerMeta, PoolError> {
        let (id, rx) = {
            let mut inner = self.inner.lock().await;
            if inner.state == SupervisorState::Closed {
                return Err(PoolError::Closed);
            }
            let inflight = self.inflight_count();
            if inflight >= self.options.max_inflight {
                return Err(PoolError::Overloaded {
                    inflight,
                    limit: self.options.max_inflight,
                });
            }
            let version_changed = inner
                .versions
                .get(&payload.file_path)
                .map(|known| *known != payload.version)
                .unwrap_or(false);
            if version_changed {
                self.restart_locked(
                    &mut inner,
                    &format!("handler version changed: {}", payload.file_path.display()),
                );
            }
            self.ensure_worker(&mut inner)?;
            inner
                .versions
                .insert(payload.file_path.clone(), payload.version.clone());

            let id = inner.next_id;
            inner.next_id += 1;
            let (tx, rx) = oneshot::channel();
            self.insert_inflight(id, InflightEntry::Inspect(tx));

            let command = WorkerCommand::Inspect { id, payload };
            if self.post(&inner, command).is_err() {
                self.take_inflight(id);
                self.restart_locked(&mut inner, "worker channel closed");
                return Err(PoolError::Restarted("worker channel closed".to_string()));
            }
            (id, rx)
        };

        self.await_reply(id, rx).await
    }

    /// Force a restart. Used by the dispatcher for the one-retry contract
    /// and by `clear_cache`.
    pub async fn restart(self: &Arc<Self>, reason: &str) {
        let mut inner = self.inner.lock().await;
        if inner.state == SupervisorState::Closed {
            return;
        }
        self.restart_locked(&mut inner, reason);
    }

    /// Drop every cached module by rotating the worker.
    pub async fn clear_cache(self: &Arc<Self>) {
        self.restart("cache cleared").await;
    }

    /// Terminal shutdown; idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SupervisorState::Closed {
            return;
        }
        inner.state = SupervisorState::Closed;
        self.reject_all_inflight(|| PoolError::Closed);
        inner.versions.clear();
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        if let Some(worker) = inner.worker.take() {
            worker.terminate();
        }
        tracing::info!("worker {} closed", self.id);
    }

    pub async fn state(&self) -> SupervisorState {
        self.inner.lock().await.state
    }

    pub async fn restart_count(&self) -> u64 {
        self.inner.lock().await.restart_count
    }

    /// Value-typed view for the meta API.
    pub async fn snapshot(&self) -> WorkerStatusSnapshot {
        let inner = self.inner.lock().await;
        let mut handlers: Vec<TrackedHandler> = inner
            .versions
            .iter()
            .map(|(path, version)| TrackedHandler {
                file_path: path.to_string_lossy().into_owned(),
                version: version.clone(),
            })
            .collect();
        handlers.sort_by(|a, b| a.file_path.cmp(&b.file_path));

        let reading = *self.shared.memory.lock().expect("memory lock poisoned");
        let memory = reading.map(|reading| MemorySnapshot {
            heap_used: reading.sample.heap_used,
            rss: reading.sample.rss,
            external: reading.sample.external,
            array_buffers: reading.sample.array_buffers,
            sampled_at: reading.sampled_at,
        });

        WorkerStatusSnapshot {
            status: inner.state.as_str(),
            thread_id: inner.worker.as_ref().map(|_| inner.generation),
            inflight: self.inflight_count(),
            tracked_handlers: handlers.len(),
            handlers,
            restart_count: inner.restart_count,
            last_restart_reason: inner.last_restart_reason.clone(),
            last_restart_at: inner.last_restart_at,
            limits: self.options.clone(),
            memory,
        }
    }

    // ----- internals -----

    async fn await_reply<T>(
        self: &Arc<Self>,
        id: CorrelationId,
        rx: oneshot::Receiver<Result<T, PoolError>>,
    ) -> Result<T, PoolError> {
        let timeout = Duration::from_millis(self.options.request_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::Restarted("worker terminated".to_string())),
            Err(_) => {
                // The worker may be stuck; rotating it is the only
                // guaranteed cancellation.
                if let Some(entry) = self.take_inflight(id) {
                    drop(entry);
                }
                self.restart("request timeout").await;
                Err(PoolError::Timeout {
                    timeout_ms: self.options.request_timeout_ms,
                })
            }
        }
    }

    fn post(&self, inner: &Inner, command: WorkerCommand) -> Result<(), ()> {
        let Some(worker) = inner.worker.as_ref() else {
            return Err(());
        };
        worker.command_tx.send(command).map_err(|_| ())
    }

    fn ensure_worker(self: &Arc<Self>, inner: &mut Inner) -> Result<(), PoolError> {
        match inner.state {
            SupervisorState::Closed => Err(PoolError::Closed),
            SupervisorState::Running | SupervisorState::Restarting if inner.worker.is_some() => {
                Ok(())
            }
            _ => {
                self.spawn_locked(inner)
                    .map_err(|err| PoolError::Spawn(err.to_string()))?;
                inner.state = SupervisorState::Running;
                Ok(())
            }
        }
    }

    fn spawn_locked(self: &Arc<Self>, inner: &mut Inner) -> std::io::Result<()> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let bootstrap = WorkerBootstrap {
            worker_id: self.id.clone(),
            db_set: self.db_set.clone(),
            options: self.options.clone(),
        };
        let worker = spawn_worker(bootstrap, event_tx)?;
        inner.generation += 1;
        let pump = tokio::spawn(pump_events(
            Arc::downgrade(self),
            Arc::clone(&self.shared),
            event_rx,
            inner.generation,
        ));
        inner.worker = Some(worker);
        inner.pump = Some(pump);
        Ok(())
    }

    fn restart_locked(self: &Arc<Self>, inner: &mut Inner, reason: &str) {
        if inner.state == SupervisorState::Closed {
            return;
        }
        inner.state = SupervisorState::Restarting;
        tracing::warn!("worker {} restarting: {}", self.id, reason);

        self.reject_all_inflight(|| {
            PoolError::Restarted(format!("runtime worker restarted: {}", reason))
        });
        inner.versions.clear();
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        if let Some(worker) = inner.worker.take() {
            worker.terminate();
        }
        *self.shared.memory.lock().expect("memory lock poisoned") = None;

        inner.restart_count += 1;
        inner.last_restart_reason = Some(reason.to_string());
        inner.last_restart_at = Some(now_millis());

        match self.spawn_locked(inner) {
            Ok(()) => inner.state = SupervisorState::Running,
            Err(err) => {
                // The next execute retries the spawn from Stopped.
                tracing::error!("worker {} failed to respawn: {}", self.id, err);
                inner.state = SupervisorState::Stopped;
            }
        }
    }

    fn insert_inflight(&self, id: CorrelationId, entry: InflightEntry) {
        self.shared
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .insert(id, entry);
        self.shared.inflight_count.fetch_add(1, Ordering::Relaxed);
    }

    fn take_inflight(&self, id: CorrelationId) -> Option<InflightEntry> {
        let entry = self
            .shared
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(&id);
        if entry.is_some() {
            self.shared.inflight_count.fetch_sub(1, Ordering::Relaxed);
        }
        entry
    }

    fn reject_all_inflight(&self, err: impl Fn() -> PoolError) {
        let entries: Vec<InflightEntry> = {
            let mut inflight = self.shared.inflight.lock().expect("inflight lock poisoned");
            inflight.drain().map(|(_, entry)| entry).collect()
        };
        self.shared
            .inflight_count
            .fetch_sub(entries.len(), Ordering::Relaxed);
        for entry in entries {
            entry.reject(err());
        }
    }

    async fn on_memory_sample(self: &Arc<Self>, sample: MemorySample, generation: u64) {
        let hard = self.options.memory_hard_limit_mb * MB;
        let soft = self.options.memory_soft_limit_mb * MB;
        let heap = sample.heap_used as u64;

        let reason = if hard > 0 && heap > hard {
            Some(format!(
                "memory hard limit exceeded: {} bytes > {} MB",
                heap, self.options.memory_hard_limit_mb
            ))
        } else if soft > 0
            && heap > soft
            && (self.inflight_count() == 0 || self.options.restart_on_soft_limit_when_busy)
        {
            Some(format!(
                "memory soft limit exceeded: {} bytes > {} MB",
                heap, self.options.memory_soft_limit_mb
            ))
        } else {
            None
        };

        if let Some(reason) = reason {
            let mut inner = self.inner.lock().await;
            if inner.generation == generation && inner.state == SupervisorState::Running {
                self.restart_locked(&mut inner, &reason);
            }
        }
    }

    async fn on_worker_exit(self: &Arc<Self>, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation == generation && inner.state == SupervisorState::Running {
            self.restart_locked(&mut inner, "worker exited unexpectedly");
        }
    }
}

/// Routes worker events back to their waiters. Samples are handled before
/// any id lookup; unknown ids (post-timeout, post-restart) are dropped.
async fn pump_events(
    supervisor: Weak<WorkerSupervisor>,
    shared: Arc<Shared>,
    mut event_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    generation: u64,
) {
    while let Some(event) = event_rx.recv().await {
        match event {
            WorkerEvent::MemorySample(sample) => {
                *shared.memory.lock().expect("memory lock poisoned") = Some(MemoryReading {
                    sample,
                    sampled_at: now_millis(),
                });
                if let Some(supervisor) = supervisor.upgrade() {
                    supervisor.on_memory_sample(sample, generation).await;
                }
            }
            WorkerEvent::ExecuteResult {
                id,
                elapsed_ms,
                heap_used,
                result,
            } => {
                let entry = {
                    let mut inflight = shared.inflight.lock().expect("inflight lock poisoned");
                    inflight.remove(&id)
                };
                let Some(entry) = entry else { continue };
                shared.inflight_count.fetch_sub(1, Ordering::Relaxed);
                match entry {
                    InflightEntry::Execute(tx) => {
                        let _ = tx.send(
                            result
                                .map(|reply| ExecuteSuccess {
                                    reply,
                                    elapsed_ms,
                                    heap_used,
                                })
                                .map_err(PoolError::Handler),
                        );
                    }
                    entry => entry.reject(PoolError::Restarted(
                        "mismatched result for inspect request".to_string(),
                    )),
                }
            }
            WorkerEvent::InspectResult { id, result } => {
                let entry = {
                    let mut inflight = shared.inflight.lock().expect("inflight lock poisoned");
                    inflight.remove(&id)
                };
                let Some(entry) = entry else { continue };
                shared.inflight_count.fetch_sub(1, Ordering::Relaxed);
                match entry {
                    InflightEntry::Inspect(tx) => {
                        let _ = tx.send(result.map_err(PoolError::Handler));
                    }
                    entry => entry.reject(PoolError::Restarted(
                        "mismatched result for execute request".to_string(),
                    )),
                }
            }
        }
    }

    if let Some(supervisor) = supervisor.upgrade() {
        supervisor.on_worker_exit(generation).await;
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ========== Snapshots ==========

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedHandler {
    pub file_path: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    pub heap_used: usize,
    pub rss: usize,
    pub external: usize,
    pub array_buffers: usize,
    pub sampled_at: u64,
}

/// Point-in-time view of one supervisor, safe to hand to the meta API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusSnapshot {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<u64>,
    pub inflight: usize,
    pub tracked_handlers: usize,
    pub handlers: Vec<TrackedHandler>,
    pub restart_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<u64>,
    pub limits: ExecutorOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySnapshot>,
}
