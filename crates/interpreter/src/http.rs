use std::sync::Arc;

use std::convert::Infallible;

use axum::extract::{DefaultBodyLimit, State};
use axum::response::Sse;
use axum::response::sse::{Event, KeepAlive};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{ServiceError, ServiceResult};
use crate::service::ExecutionService;
use crate::types::{ExecuteRequest, ExecuteResponse};

/// Request bodies carry inline files as base64.
const MAX_REQUEST_BYTES: usize = 64 * 1024 * 1024;

pub fn router(service: Arc<ExecutionService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/execute", post(execute))
        .route("/v1/execute/stream", post(execute_stream))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(service)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn execute(
    State(service): State<Arc<ExecutionService>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ServiceError> {
    service.execute(request).await.map(Json)
}

/// Rejections come back as ordinary JSON errors; only a request that passed
/// validation opens an event stream.
async fn execute_stream(
    State(service): State<Arc<ExecutionService>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServiceError> {
    let prepared = service.prepare(request).await?;
    let events = crate::stream::events(service, prepared);
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Serve until SIGTERM or SIGINT, then finish in-flight requests.
pub async fn serve(addr: &str, service: Arc<ExecutionService>) -> ServiceResult<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServiceError::Config(format!("bind {addr}: {e}")))?;
    info!(addr = %addr, "listening");

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => {
            info!("received SIGTERM, draining");
        }
        _ = recv_signal(&mut sigint) => {
            info!("received SIGINT, draining");
        }
    }
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
