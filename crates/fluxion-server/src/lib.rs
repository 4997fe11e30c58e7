//! HTTP boundary.
//!
//! Everything the socket sees is assembled here: the fallback handler that
//! feeds the file runtime, the body-size cap, the JSON error shapes, and
//! the read-only meta API under `/_fluxion/`. The boundary catches every
//! dispatch failure; nothing a handler does can unwind past this layer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;

use fluxion_engine::{
    DispatchError, FileRuntime, FluxionConfig, RuntimeRequest, RuntimeResponse,
};
use fluxion_pool::PoolError;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<FileRuntime>,
    pub max_request_bytes: usize,
}

/// Build the full application router: meta API plus the dynamic fallback.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/_fluxion/routes", get(get_routes))
        .route("/_fluxion/healthz", get(get_healthz))
        .route("/_fluxion/workers", get(get_workers))
        .fallback(handle_request)
        .with_state(state)
}

/// Serve until the shutdown future resolves, then close the runtime.
pub async fn serve(
    runtime: Arc<FileRuntime>,
    config: &FluxionConfig,
    listener: TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let state = AppState {
        runtime: Arc::clone(&runtime),
        max_request_bytes: config.max_request_bytes.max(1) as usize,
    };
    let app = app_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr = listener.local_addr()?;
    tracing::info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    runtime.close().await;
    tracing::info!("server stopped");
    Ok(())
}

async fn handle_request(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let started = Instant::now();
    let method = request.method().as_str().to_string();
    let uri = request.uri().clone();
    let path = uri.path().to_string();

    let mut headers = Vec::with_capacity(request.headers().len());
    for (name, value) in request.headers() {
        headers.push((
            name.as_str().to_string(),
            value.to_str().unwrap_or("").to_string(),
        ));
    }

    let body = match axum::body::to_bytes(request.into_body(), state.max_request_bytes).await {
        Ok(bytes) if bytes.is_empty() => None,
        Ok(bytes) => Some(bytes.to_vec()),
        Err(_) => {
            let response = json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                serde_json::json!({
                    "message": format!(
                        "request body too large: limit is {} bytes",
                        state.max_request_bytes
                    ),
                }),
            );
            log_request(&method, &path, response.status(), started.elapsed());
            return response;
        }
    };

    let runtime_request = RuntimeRequest {
        method: method.clone(),
        url: uri.to_string(),
        path: path.clone(),
        headers,
        body,
        ip: addr.ip().to_string(),
    };

    let response = match state.runtime.dispatch(runtime_request).await {
        Ok(RuntimeResponse::Handler {
            status,
            headers,
            body,
        }) => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from(body.unwrap_or_default()))
                .unwrap_or_else(|_| internal_error())
        }
        Ok(RuntimeResponse::Static(file)) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, file.content_type)
            .header(CONTENT_LENGTH, file.content_length)
            .body(Body::from(file.body.unwrap_or_default()))
            .unwrap_or_else(|_| internal_error()),
        Ok(RuntimeResponse::NotFound) => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({
                "message": "Route not found",
                "method": method,
                "url": uri.to_string(),
            }),
        ),
        Err(err) => error_response(&method, &path, err),
    };

    log_request(&method, &path, response.status(), started.elapsed());
    response
}

/// Map a dispatch failure to its HTTP shape. Capacity failures describe the
/// limit; everything else is an opaque 500 with the detail in the log.
fn error_response(method: &str, path: &str, err: DispatchError) -> Response {
    match &err {
        DispatchError::Worker(PoolError::Overloaded { .. }) => json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "message": err.to_string() }),
        ),
        DispatchError::Worker(PoolError::Timeout { .. }) => json_response(
            StatusCode::GATEWAY_TIMEOUT,
            serde_json::json!({ "message": err.to_string() }),
        ),
        DispatchError::Worker(PoolError::Closed) => json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "message": err.to_string() }),
        ),
        DispatchError::Worker(PoolError::Handler(worker_err))
            if worker_err.code.is_some() =>
        {
            tracing::warn!("{} {} failed: {}", method, path, worker_err);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "message": worker_err.message }),
            )
        }
        _ => {
            tracing::error!("{} {} failed: {}", method, path, err);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "message": "Internal Server Error" }),
            )
        }
    }
}

fn log_request(method: &str, path: &str, status: StatusCode, elapsed: Duration) {
    tracing::info!(
        "{} {} {} {}ms",
        method,
        path,
        status.as_u16(),
        elapsed.as_millis()
    );
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response {
    (status, Json(value)).into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "message": "Internal Server Error" })),
    )
        .into_response()
}

// ========== Meta API ==========

async fn get_routes(State(state): State<AppState>) -> Response {
    match state.runtime.route_snapshot() {
        Ok(snapshot) => json_response(
            StatusCode::OK,
            serde_json::json!({ "routes": snapshot }),
        ),
        Err(err) => {
            tracing::error!("route snapshot failed: {}", err);
            internal_error()
        }
    }
}

async fn get_healthz() -> Response {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    json_response(StatusCode::OK, serde_json::json!({ "ok": true, "now": now }))
}

async fn get_workers(State(state): State<AppState>) -> Response {
    let workers = state.runtime.worker_snapshot().await;
    json_response(StatusCode::OK, serde_json::json!({ "workers": workers }))
}
