use crate::cli::ServeArgs;
use crate::error::PipelineError;
use crate::pipeline::finalize::export_detections;
use crate::pipeline::orchestrator::ProcessingCoordinator;
use crate::pipeline::types::StatusSnapshot;
use crate::run_context::{create_run, list_videos, open_video, VideoMetadata};
use crate::video::synthetic::SyntheticVideo;
use crate::video::VideoSource;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: ProcessingCoordinator,
    pub args: Arc<ServeArgs>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Pipeline(PipelineError::InvalidState(_)) => StatusCode::CONFLICT,
            ApiError::Pipeline(PipelineError::Configuration(_))
            | ApiError::Pipeline(PipelineError::UnsupportedMedia(_)) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Pipeline(_) | ApiError::Internal(_) => {
                tracing::error!("Request failed: {:#}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
pub struct VideoInfo {
    pub name: String,
    pub path: String,
}

pub async fn get_videos(State(state): State<AppState>) -> Json<Vec<VideoInfo>> {
    let video_root = state.args.video_root.clone();
    let videos = tokio::task::spawn_blocking(move || list_videos(&video_root))
        .await
        .unwrap_or_default();

    let info_list = videos
        .into_iter()
        .map(|video_path| {
            let name = video_path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string();
            let path = video_path
                .strip_prefix(&state.args.video_root)
                .unwrap_or(&video_path)
                .to_string_lossy()
                .to_string();
            VideoInfo { name, path }
        })
        .collect();

    Json(info_list)
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.coordinator.snapshot())
}

/// One `status` event per published snapshot.
pub async fn status_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = WatchStream::new(state.coordinator.subscribe()).map(|snapshot| {
        let event = Event::default()
            .event("status")
            .json_data(&snapshot)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
        Ok(event)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
pub struct StartRunRequest {
    /// Path relative to the video root
    pub video_path: Option<String>,
    #[serde(default)]
    pub synthetic: bool,
}

pub async fn start_run(
    State(state): State<AppState>,
    Json(payload): Json<StartRunRequest>,
) -> ApiResult<Json<VideoMetadata>> {
    let (video, metadata): (Box<dyn VideoSource>, VideoMetadata) = if payload.synthetic {
        let video = SyntheticVideo::demo();
        let metadata = VideoMetadata::from_stream("synthetic.mp4", 0, "video/mp4", video.info());
        (Box::new(video) as Box<dyn VideoSource>, metadata)
    } else {
        let relative = payload.video_path.ok_or_else(|| {
            PipelineError::Configuration("video_path is required".to_string())
        })?;
        let path = resolve_video_path(&state.args.video_root, &relative)?;
        let backend = state.args.pipeline.backend;
        tokio::task::spawn_blocking(move || open_video(&path, backend))
            .await
            .map_err(|e| anyhow::anyhow!("video probe task failed: {}", e))??
    };

    state.coordinator.start(video, metadata.clone())?;
    Ok(Json(metadata))
}

/// Resolves `relative` under `video_root`, refusing paths that escape it.
fn resolve_video_path(video_root: &Path, relative: &str) -> ApiResult<PathBuf> {
    let root = video_root
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("video root {:?} unavailable: {}", video_root, e))?;
    let path = root
        .join(relative)
        .canonicalize()
        .map_err(|_| ApiError::NotFound(format!("video not found: {}", relative)))?;
    if !path.starts_with(&root) {
        return Err(ApiError::NotFound(format!("video not found: {}", relative)));
    }
    Ok(path)
}

pub async fn pause_run(State(state): State<AppState>) -> ApiResult<Json<StatusSnapshot>> {
    state.coordinator.pause()?;
    Ok(Json(state.coordinator.snapshot()))
}

pub async fn resume_run(State(state): State<AppState>) -> ApiResult<Json<StatusSnapshot>> {
    state.coordinator.resume()?;
    Ok(Json(state.coordinator.snapshot()))
}

pub async fn cancel_run(State(state): State<AppState>) -> ApiResult<Json<StatusSnapshot>> {
    state.coordinator.cancel()?;
    Ok(Json(state.coordinator.snapshot()))
}

pub async fn clear_run(State(state): State<AppState>) -> Json<StatusSnapshot> {
    state.coordinator.clear();
    Json(state.coordinator.snapshot())
}

#[derive(Serialize)]
pub struct ExportInfo {
    pub run_id: String,
    pub csv: String,
    pub json: String,
}

pub async fn export_run(State(state): State<AppState>) -> ApiResult<Json<ExportInfo>> {
    let snapshot = state.coordinator.snapshot();
    let metadata = snapshot.metadata.clone().ok_or_else(|| {
        PipelineError::InvalidState("no video has been processed".to_string())
    })?;
    if snapshot.detections.is_empty() {
        return Err(PipelineError::InvalidState("no detections to export".to_string()).into());
    }

    let output_root = state.args.output_root.clone();
    let info = tokio::task::spawn_blocking(move || -> anyhow::Result<ExportInfo> {
        let record = create_run(&output_root, &metadata)?;
        let paths = export_detections(&record.output_dir, &snapshot)?;
        Ok(ExportInfo {
            run_id: record.run_id,
            csv: paths.csv.to_string_lossy().to_string(),
            json: paths.json.to_string_lossy().to_string(),
        })
    })
    .await
    .map_err(|e| anyhow::anyhow!("export task failed: {}", e))??;

    Ok(Json(info))
}
