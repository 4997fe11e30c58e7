use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::CorrelationId;

/// Metadata a handler module declares about itself.
///
/// `db` is always sorted and deduplicated; an empty set means the handler
/// runs on any worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerMeta {
    #[serde(default)]
    pub db: Vec<String>,
}

impl HandlerMeta {
    pub fn normalized(mut db: Vec<String>) -> Self {
        db.sort();
        db.dedup();
        Self { db }
    }
}

/// Everything a worker needs to run one handler invocation.
///
/// The body buffer moves by ownership through the channel; it is never
/// copied between the dispatcher and the worker.
#[derive(Debug, Clone)]
pub struct ExecutePayload {
    pub file_path: PathBuf,
    pub version: String,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub ip: String,
}

/// Metadata-only load request. The worker loads the module (or reuses its
/// cached copy) and reports `HandlerMeta` without executing anything.
#[derive(Debug, Clone)]
pub struct InspectPayload {
    pub file_path: PathBuf,
    pub version: String,
}

/// The response a handler produced, captured by the worker-side sink.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// Successful execute result body.
#[derive(Debug)]
pub struct ExecuteReply {
    pub response: HandlerResponse,
    pub meta: HandlerMeta,
}

/// Dispatcher → worker.
#[derive(Debug)]
pub enum WorkerCommand {
    Execute {
        id: CorrelationId,
        payload: ExecutePayload,
    },
    Inspect {
        id: CorrelationId,
        payload: InspectPayload,
    },
}

/// Periodic, unsolicited memory report from a worker.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    pub heap_used: usize,
    pub rss: usize,
    pub external: usize,
    pub array_buffers: usize,
}

/// Worker → dispatcher. Routed on variant before correlation id: memory
/// samples interleave freely with results.
#[derive(Debug)]
pub enum WorkerEvent {
    ExecuteResult {
        id: CorrelationId,
        elapsed_ms: u64,
        heap_used: usize,
        result: Result<ExecuteReply, WorkerError>,
    },
    InspectResult {
        id: CorrelationId,
        result: Result<HandlerMeta, WorkerError>,
    },
    MemorySample(MemorySample),
}
