use std::convert::Infallible;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::Error;
use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::*;

use crate::error::{AppError, AppResult};
use crate::events::Frame;
use crate::metadata;
use crate::registry::JobRegistry;

#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
}

#[derive(Debug, Serialize)]
struct Aspect {
    label: &'static str,
    w: u32,
    h: u32,
}

const ASPECTS: &[Aspect] = &[
    Aspect {
        label: "Vertical 9:16 (1080x1920)",
        w: 1080,
        h: 1920,
    },
    Aspect {
        label: "Square 1:1 (1080x1080)",
        w: 1080,
        h: 1080,
    },
    Aspect {
        label: "Landscape 16:9 (1920x1080)",
        w: 1920,
        h: 1080,
    },
    Aspect {
        label: "Portrait 4:5 (1080x1350)",
        w: 1080,
        h: 1350,
    },
    Aspect {
        label: "Landscape 5:4 (1350x1080)",
        w: 1350,
        h: 1080,
    },
    Aspect {
        label: "Cinema 21:9 (2520x1080)",
        w: 2520,
        h: 1080,
    },
    Aspect {
        label: "Wide 3:2 (1620x1080)",
        w: 1620,
        h: 1080,
    },
    Aspect {
        label: "Classic 2:3 (1080x1620)",
        w: 1080,
        h: 1620,
    },
];

pub fn router(state: AppState) -> Router {
    let outputs = ServeDir::new(state.registry.renderer().output_dir());
    Router::new()
        .route("/api/render", post(submit_render))
        .route("/api/render/{job_id}/stop", post(stop_render))
        .route("/api/events/{job_id}", get(stream_events))
        .route("/api/models", get(list_models))
        .route("/api/aspects", get(list_aspects))
        .route("/api/outputs", get(list_outputs))
        .route("/api/metadata/{filename}", get(image_metadata))
        .nest_service("/outputs", outputs)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    cancel_token: CancellationToken,
    addr: String,
    registry: Arc<JobRegistry>,
) -> Result<(), Error> {
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    let app = router(AppState { registry });
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel_token.cancelled().await })
        .await?;

    info!("Server stopped.");
    Ok(())
}

async fn submit_render(
    State(state): State<AppState>,
    Json(request): Json<Map<String, Value>>,
) -> Json<Value> {
    let job_id = state.registry.submit(request).await;
    Json(json!({ "job_id": job_id }))
}

async fn stop_render(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Value>> {
    state.registry.cancel(&job_id).await?;
    Ok(Json(json!({ "status": "stopping" })))
}

async fn stream_events(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let frames = state.registry.stream(&job_id).await?;
    Ok(Sse::new(frames.map(|frame| Ok(to_sse(&frame)))))
}

fn to_sse(frame: &Frame) -> SseEvent {
    match (frame.event_name(), frame.data()) {
        (Some(name), Some(data)) => SseEvent::default().event(name).data(data.to_string()),
        _ => SseEvent::default().comment("keep-alive"),
    }
}

async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let models = state.registry.renderer().list_models().await;
    Json(json!({ "models": models }))
}

async fn list_aspects() -> Json<Value> {
    Json(json!({ "aspects": ASPECTS }))
}

#[derive(Debug, Serialize)]
struct OutputItem {
    filename: String,
    url: String,
    mtime: f64,
    size: u64,
}

async fn list_outputs(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let dir = state.registry.renderer().output_dir().to_path_buf();
    let items = tokio::task::spawn_blocking(move || scan_outputs(&dir))
        .await
        .map_err(|err| AppError::Internal(err.to_string()))?;
    Ok(Json(json!({ "items": items })))
}

/// PNGs in `dir`, newest first. An unreadable directory lists as empty.
fn scan_outputs(dir: &FsPath) -> Vec<OutputItem> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut items: Vec<OutputItem> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let filename = entry.file_name().into_string().ok()?;
            if !filename.to_lowercase().ends_with(".png") {
                return None;
            }
            let meta = entry.metadata().ok()?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or_default();
            Some(OutputItem {
                url: format!("/outputs/{filename}"),
                filename,
                mtime,
                size: meta.len(),
            })
        })
        .collect();
    items.sort_by(|a, b| b.mtime.total_cmp(&a.mtime));
    items
}

async fn image_metadata(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> AppResult<Json<Value>> {
    let is_basename = FsPath::new(&filename)
        .file_name()
        .is_some_and(|name| name == filename.as_str());
    if !is_basename || filename.contains(['/', '\\']) {
        return Err(AppError::BadRequest("invalid filename".into()));
    }
    if !filename.to_lowercase().ends_with(".png") {
        return Err(AppError::BadRequest("only .png supported".into()));
    }

    let path = state.registry.renderer().output_dir().join(&filename);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(AppError::NotFound("file not found".into()));
    }

    let meta = tokio::task::spawn_blocking(move || metadata::read_metadata(&path))
        .await
        .map_err(|err| AppError::Internal(err.to_string()))?
        .map_err(|err| AppError::Internal(format!("read metadata failed: {err}")))?;

    Ok(Json(json!({ "filename": filename, "metadata": meta })))
}
