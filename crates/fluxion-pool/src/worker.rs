//! The worker host: one OS thread, one isolate, one command loop.
//!
//! The thread runs a current-thread tokio runtime because module loading and
//! the isolate event loop are async, while the `JsRuntime` itself can never
//! leave the thread. Commands are processed strictly in arrival order;
//! memory samples go out whenever the loop is idle long enough for the
//! interval to tick, which keeps sampling off the request path.

use std::path::Path;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use base64::Engine as _;
use deno_core::v8;
use deno_core::{
    FsModuleLoader, JsRuntime, ModuleCodeString, ModuleSpecifier, PollEventLoopOptions,
    RuntimeOptions,
};
use serde::Deserialize;
use tokio::sync::mpsc;

use fluxion_protocol::{
    ExecutePayload, ExecuteReply, HandlerMeta, HandlerResponse, InspectPayload, MemorySample,
    WorkerCommand, WorkerError, WorkerErrorCode, WorkerEvent,
};

use crate::limits::{ExecutorOptions, MB};

const PRELUDE: &str = include_str!("prelude.js");

/// Parameters a worker receives at spawn.
#[derive(Debug, Clone)]
pub struct WorkerBootstrap {
    pub worker_id: String,
    pub db_set: Vec<String>,
    pub options: ExecutorOptions,
}

/// Dispatcher-side handle to a spawned worker.
///
/// Dropping the command sender stops the loop; `terminate` additionally
/// interrupts any JS that is currently running so a stuck handler cannot
/// keep the thread alive.
pub(crate) struct WorkerHandle {
    pub command_tx: mpsc::UnboundedSender<WorkerCommand>,
    isolate: Arc<OnceLock<v8::IsolateHandle>>,
    _thread: std::thread::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn terminate(self) {
        if let Some(handle) = self.isolate.get() {
            handle.terminate_execution();
        }
        // command_tx drops here; the worker loop exits on channel close.
    }
}

/// Spawn a worker thread and wire its channels.
pub(crate) fn spawn_worker(
    bootstrap: WorkerBootstrap,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
) -> std::io::Result<WorkerHandle> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let isolate = Arc::new(OnceLock::new());
    let isolate_slot = Arc::clone(&isolate);
    let stack_size = (bootstrap.options.stack_size_mb * MB) as usize;
    let name = format!("fluxion-worker-{}", bootstrap.worker_id);

    let thread = std::thread::Builder::new()
        .name(name)
        .stack_size(stack_size)
        .spawn(move || worker_main(bootstrap, command_rx, event_tx, isolate_slot))?;

    Ok(WorkerHandle {
        command_tx,
        isolate,
        _thread: thread,
    })
}

fn worker_main(
    bootstrap: WorkerBootstrap,
    command_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    isolate_slot: Arc<OnceLock<v8::IsolateHandle>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(
                "worker {} failed to start its runtime: {}",
                bootstrap.worker_id,
                err
            );
            return;
        }
    };
    runtime.block_on(run_worker(bootstrap, command_rx, event_tx, isolate_slot));
}

async fn run_worker(
    bootstrap: WorkerBootstrap,
    mut command_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    isolate_slot: Arc<OnceLock<v8::IsolateHandle>>,
) {
    let worker_id = bootstrap.worker_id.clone();
    let instance = format!("isolate_{}", nanoid::nanoid!(10));
    let mut host = match WorkerHost::new(&bootstrap) {
        Ok(host) => host,
        Err(err) => {
            tracing::error!("worker {} failed to boot its isolate: {}", worker_id, err);
            return;
        }
    };
    let _ = isolate_slot.set(host.isolate_handle());

    let mut sample_interval = tokio::time::interval(Duration::from_millis(
        bootstrap.options.memory_sample_interval_ms.max(1),
    ));
    sample_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so samples are periodic.
    sample_interval.tick().await;

    tracing::debug!("worker {} online ({})", worker_id, instance);

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    WorkerCommand::Execute { id, payload } => {
                        let started = Instant::now();
                        let result = host.execute(&payload).await;
                        let event = WorkerEvent::ExecuteResult {
                            id,
                            elapsed_ms: started.elapsed().as_millis() as u64,
                            heap_used: host.heap_used(),
                            result,
                        };
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    WorkerCommand::Inspect { id, payload } => {
                        let result = host.inspect(&payload).await;
                        if event_tx
                            .send(WorkerEvent::InspectResult { id, result })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            _ = sample_interval.tick() => {
                if event_tx
                    .send(WorkerEvent::MemorySample(host.memory_sample()))
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    tracing::debug!("worker {} shutting down ({})", worker_id, instance);
}

// ========== Isolate host ==========

struct WorkerHost {
    runtime: JsRuntime,
}

impl WorkerHost {
    fn new(bootstrap: &WorkerBootstrap) -> Result<Self, WorkerError> {
        let create_params = v8::CreateParams::default().heap_limits(
            (bootstrap.options.max_young_generation_size_mb * MB) as usize,
            (bootstrap.options.max_old_generation_size_mb * MB) as usize,
        );
        let mut runtime = JsRuntime::new(RuntimeOptions {
            module_loader: Some(Rc::new(FsModuleLoader)),
            create_params: Some(create_params),
            ..Default::default()
        });

        let bootstrap_value = serde_json::json!({
            "workerId": bootstrap.worker_id,
            "dbSet": bootstrap.db_set,
            "maxResponseBytes": bootstrap.options.max_response_bytes,
        });
        set_global(&mut runtime, "__fluxionBootstrap", &bootstrap_value)?;

        runtime
            .execute_script("fluxion:prelude", ModuleCodeString::from(PRELUDE.to_string()))
            .map_err(|err| WorkerError::new("BootstrapError", err.to_string()))?;

        Ok(Self { runtime })
    }

    fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    fn heap_used(&mut self) -> usize {
        let mut stats = v8::HeapStatistics::default();
        self.runtime.v8_isolate().get_heap_statistics(&mut stats);
        stats.used_heap_size()
    }

    fn memory_sample(&mut self) -> MemorySample {
        let mut stats = v8::HeapStatistics::default();
        self.runtime.v8_isolate().get_heap_statistics(&mut stats);
        MemorySample {
            heap_used: stats.used_heap_size(),
            rss: stats.total_physical_size(),
            external: stats.external_memory() as usize,
            // Backing stores live in host allocations; malloced memory is
            // the closest per-isolate figure V8 reports for them.
            array_buffers: stats.malloced_memory(),
        }
    }

    async fn execute(&mut self, payload: &ExecutePayload) -> Result<ExecuteReply, WorkerError> {
        let request = serde_json::json!({
            "modulePath": payload.file_path.to_string_lossy(),
            "moduleUrl": module_url(&payload.file_path)?,
            "version": payload.version,
            "method": payload.method,
            "url": payload.url,
            "headers": headers_value(&payload.headers),
            "bodyBase64": payload
                .body
                .as_ref()
                .map(|body| base64::engine::general_purpose::STANDARD.encode(body)),
            "ip": payload.ip,
        });
        set_global(&mut self.runtime, "__fluxionPayload", &request)?;

        let value = self
            .invoke("globalThis.__fluxion.execute(globalThis.__fluxionPayload)")
            .await?;
        let result: JsExecuteResult = serde_json::from_value(value).map_err(|err| {
            WorkerError::new(
                "ProtocolError",
                format!("worker returned a malformed result: {}", err),
            )
        })?;
        result.into_reply()
    }

    async fn inspect(&mut self, payload: &InspectPayload) -> Result<HandlerMeta, WorkerError> {
        let request = serde_json::json!({
            "modulePath": payload.file_path.to_string_lossy(),
            "moduleUrl": module_url(&payload.file_path)?,
            "version": payload.version,
        });
        set_global(&mut self.runtime, "__fluxionPayload", &request)?;

        let value = self
            .invoke("globalThis.__fluxion.inspect(globalThis.__fluxionPayload)")
            .await?;
        let result: JsInspectResult = serde_json::from_value(value).map_err(|err| {
            WorkerError::new(
                "ProtocolError",
                format!("worker returned a malformed result: {}", err),
            )
        })?;
        Ok(HandlerMeta::normalized(result.meta.db))
    }

    /// Run an expression, drive the event loop until its promise settles,
    /// and decode the settled value.
    async fn invoke(&mut self, code: &'static str) -> Result<serde_json::Value, WorkerError> {
        let result = self
            .runtime
            .execute_script("fluxion:invoke", ModuleCodeString::from(code.to_string()))
            .map_err(|err| WorkerError::new("ExecutionError", err.to_string()))?;

        let mut pending = false;
        {
            let scope = &mut self.runtime.handle_scope();
            let local = v8::Local::new(scope, &result);
            if let Ok(promise) = v8::Local::<v8::Promise>::try_from(local) {
                pending = matches!(promise.state(), v8::PromiseState::Pending);
            }
        }

        let mut loop_error = None;
        if pending {
            if let Err(err) = self
                .runtime
                .run_event_loop(PollEventLoopOptions::default())
                .await
            {
                // The rejection usually reaches the promise as well; prefer
                // its structured form below when it did.
                loop_error = Some(err.to_string());
            }
        }

        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &result);
        let settled = if let Ok(promise) = v8::Local::<v8::Promise>::try_from(local) {
            match promise.state() {
                v8::PromiseState::Fulfilled => Ok(promise.result(scope)),
                v8::PromiseState::Rejected => {
                    let reason = promise.result(scope);
                    Err(worker_error_from_v8(scope, reason))
                }
                v8::PromiseState::Pending => Err(WorkerError::new(
                    "ExecutionError",
                    loop_error.unwrap_or_else(|| {
                        "handler promise still pending after event loop".to_string()
                    }),
                )),
            }
        } else {
            Ok(local)
        };
        let value = settled?;

        deno_core::serde_v8::from_v8::<serde_json::Value>(scope, value).map_err(|err| {
            WorkerError::new(
                "ProtocolError",
                format!("worker returned a non-serializable result: {}", err),
            )
        })
    }
}

fn module_url(path: &Path) -> Result<String, WorkerError> {
    ModuleSpecifier::from_file_path(path)
        .map(|url| url.to_string())
        .map_err(|_| {
            WorkerError::new(
                "ExecutionError",
                format!("handler path is not importable: {}", path.display()),
            )
        })
}

fn set_global(
    runtime: &mut JsRuntime,
    name: &str,
    value: &serde_json::Value,
) -> Result<(), WorkerError> {
    let scope = &mut runtime.handle_scope();
    let context = scope.get_current_context();
    let global = context.global(scope);
    let key = v8::String::new(scope, name)
        .ok_or_else(|| WorkerError::new("ExecutionError", "failed to allocate global key"))?;
    let v8_value = deno_core::serde_v8::to_v8(scope, value)
        .map_err(|err| WorkerError::new("ExecutionError", format!("payload to v8: {}", err)))?;
    global.set(scope, key.into(), v8_value);
    Ok(())
}

/// Repeated header names collapse into arrays, single names stay strings.
fn headers_value(headers: &[(String, String)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        match map.get_mut(&name) {
            None => {
                map.insert(name, serde_json::Value::String(value.clone()));
            }
            Some(serde_json::Value::String(existing)) => {
                let merged = serde_json::Value::Array(vec![
                    serde_json::Value::String(existing.clone()),
                    serde_json::Value::String(value.clone()),
                ]);
                map.insert(name, merged);
            }
            Some(serde_json::Value::Array(list)) => {
                list.push(serde_json::Value::String(value.clone()));
            }
            _ => {}
        }
    }
    serde_json::Value::Object(map)
}

fn worker_error_from_v8(
    scope: &mut v8::HandleScope<'_>,
    value: v8::Local<'_, v8::Value>,
) -> WorkerError {
    if value.is_object() {
        if let Some(obj) = value.to_object(scope) {
            let name = get_string_prop(scope, obj, "name");
            let message = get_string_prop(scope, obj, "message");
            if name.is_some() || message.is_some() {
                let code = get_string_prop(scope, obj, "code")
                    .as_deref()
                    .and_then(WorkerErrorCode::parse);
                return WorkerError {
                    name: name.unwrap_or_else(|| "Error".to_string()),
                    message: message.unwrap_or_default(),
                    stack: get_string_prop(scope, obj, "stack"),
                    code,
                };
            }
        }
    }
    WorkerError::new("Error", value.to_rust_string_lossy(scope))
}

fn get_string_prop(
    scope: &mut v8::HandleScope<'_>,
    obj: v8::Local<'_, v8::Object>,
    name: &str,
) -> Option<String> {
    let key = v8::String::new(scope, name)?;
    let value = obj.get(scope, key.into())?;
    if value.is_undefined() || value.is_null() {
        return None;
    }
    Some(value.to_rust_string_lossy(scope))
}

// ========== Result decoding ==========

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsExecuteResult {
    status: u16,
    #[serde(default)]
    headers: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    body_base64: Option<String>,
    #[serde(default)]
    meta: JsMeta,
}

#[derive(Default, Deserialize)]
struct JsMeta {
    #[serde(default)]
    db: Vec<String>,
}

#[derive(Deserialize)]
struct JsInspectResult {
    #[serde(default)]
    meta: JsMeta,
}

impl JsExecuteResult {
    fn into_reply(self) -> Result<ExecuteReply, WorkerError> {
        let mut headers = Vec::with_capacity(self.headers.len());
        for (name, value) in self.headers {
            match value {
                serde_json::Value::String(value) => headers.push((name, value)),
                other => headers.push((name, other.to_string())),
            }
        }
        let body = match self.body_base64 {
            None => None,
            Some(encoded) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|err| {
                        WorkerError::new(
                            "ProtocolError",
                            format!("worker returned an undecodable body: {}", err),
                        )
                    })?,
            ),
        };
        Ok(ExecuteReply {
            response: HandlerResponse {
                status: self.status,
                headers,
                body,
            },
            meta: HandlerMeta::normalized(self.meta.db),
        })
    }
}
