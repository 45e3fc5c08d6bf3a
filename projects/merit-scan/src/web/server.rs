use crate::cli::ServeArgs;
use crate::pipeline::orchestrator::ProcessingCoordinator;
use crate::web::api::{
    cancel_run, clear_run, export_run, get_status, get_videos, pause_run, resume_run, start_run,
    status_stream, AppState,
};
use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/videos", get(get_videos))
        .route("/api/status", get(get_status))
        .route("/api/status/stream", get(status_stream))
        .route("/api/runs", post(start_run))
        .route("/api/runs/pause", post(pause_run))
        .route("/api/runs/resume", post(resume_run))
        .route("/api/runs/cancel", post(cancel_run))
        .route("/api/runs/clear", post(clear_run))
        .route("/api/runs/export", post(export_run))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(args: ServeArgs) -> Result<()> {
    let coordinator = ProcessingCoordinator::new(&args.pipeline.config())
        .context("Invalid pipeline configuration")?;

    let mut current_port = args.port;
    let listener = loop {
        let addr = SocketAddr::new(args.host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Tokio requires a non-blocking socket
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("No available ports found"))?;
            }
        }
    };

    let state = AppState {
        coordinator,
        args: Arc::new(args),
    };
    let app = router(state);

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "M.E.R.I.T. scan server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::PipelineArgs;
    use crate::pipeline::types::RunState;
    use crate::video::Backend;
    use std::time::Duration;

    fn serve_args(root: &std::path::Path) -> ServeArgs {
        ServeArgs {
            host: "127.0.0.1".parse().unwrap(),
            port: 0,
            video_root: root.to_path_buf(),
            output_root: root.join("out"),
            pipeline: PipelineArgs {
                sample_rate: 1.0,
                batch_size: None,
                classifier: crate::pipeline::config::ClassifierKind::Mock,
                api_key: None,
                endpoint: crate::pipeline::remote::DEFAULT_ENDPOINT.to_string(),
                backend: Backend::FfmpegCli,
            },
        }
    }

    async fn spawn_app(root: &std::path::Path) -> String {
        let args = serve_args(root);
        let coordinator = ProcessingCoordinator::new(&args.pipeline.config()).unwrap();
        let app = router(AppState {
            coordinator,
            args: Arc::new(args),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_run_lifecycle_over_http() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("flight.mp4"), b"").unwrap();
        let base = spawn_app(dir.path()).await;
        let client = reqwest::Client::new();

        let videos: serde_json::Value = client
            .get(format!("{}/api/videos", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(videos[0]["name"], "flight.mp4");

        let idle: serde_json::Value = client
            .get(format!("{}/api/status", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(idle["state"], "idle");

        let started = client
            .post(format!("{}/api/runs", base))
            .json(&serde_json::json!({ "synthetic": true }))
            .send()
            .await
            .unwrap();
        assert_eq!(started.status(), reqwest::StatusCode::OK);

        let again = client
            .post(format!("{}/api/runs", base))
            .json(&serde_json::json!({ "synthetic": true }))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), reqwest::StatusCode::CONFLICT);

        let resume = client
            .post(format!("{}/api/runs/resume", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resume.status(), reqwest::StatusCode::CONFLICT);

        let cancelled: StatusSnapshotView = client
            .post(format!("{}/api/runs/cancel", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(cancelled.state, RunState::Cancelled);
        assert!(!cancelled.status.is_processing);

        let cleared: serde_json::Value = client
            .post(format!("{}/api/runs/clear", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(cleared["state"], "idle");
        assert!(cleared["metadata"].is_null());
    }

    #[tokio::test]
    async fn test_status_stream_emits_events() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_app(dir.path()).await;

        let mut response = reqwest::get(format!("{}/api/status/stream", base))
            .await
            .unwrap();
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );

        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("event: status"));
        assert!(text.contains("\"state\":\"idle\""));
    }

    #[tokio::test]
    async fn test_unknown_video_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_app(dir.path()).await;

        let response = reqwest::Client::new()
            .post(format!("{}/api/runs", base))
            .json(&serde_json::json!({ "video_path": "nowhere.mp4" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let export = reqwest::Client::new()
            .post(format!("{}/api/runs/export", base))
            .send()
            .await
            .unwrap();
        assert_eq!(export.status(), reqwest::StatusCode::CONFLICT);
    }

    /// Just the parts of a snapshot the tests look at.
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct StatusSnapshotView {
        state: RunState,
        status: crate::pipeline::types::ProcessingStatus,
    }
}
