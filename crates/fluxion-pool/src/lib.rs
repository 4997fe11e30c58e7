//! Worker pool: isolated handler execution with supervision.
//!
//! Architecture:
//! - Each worker is a dedicated OS thread owning one `JsRuntime` (a
//!   `JsRuntime` is `!Send`, so isolates never migrate between threads).
//! - The supervisor lives on the dispatcher side and owns exactly one live
//!   worker at a time plus the in-flight request table. All interaction is
//!   message passing: an mpsc command channel into the worker, an mpsc event
//!   channel back out, and a oneshot per dispatched request.
//! - A version change for a loaded handler rotates the isolate. Module
//!   loaders pin loaded code for the life of the isolate, so tearing the
//!   isolate down is the only way to actually release a stale version.
//! - Bindings group workers by database capability; selection maps a
//!   handler's declared requirements to the smallest satisfying worker.

pub mod error;
pub mod limits;
pub mod select;
pub mod supervisor;
pub mod worker;

pub use error::PoolError;
pub use limits::{ExecutorOptions, ExecutorOverrides};
pub use select::{
    validate_strategy, StrategyError, WorkerBinding, WorkerPool, WorkerSpec, WorkerStrategy,
    FALLBACK_WORKER_ID,
};
pub use supervisor::{
    ExecuteSuccess, MemorySnapshot, SupervisorState, TrackedHandler, WorkerStatusSnapshot,
    WorkerSupervisor,
};
pub use worker::WorkerBootstrap;
