use crate::cli::ProcessArgs;
use crate::pipeline::finalize::{export_detections, ExportPaths};
use crate::pipeline::orchestrator::ProcessingCoordinator;
use crate::pipeline::types::RunState;
use crate::run_context::{create_run, open_video, VideoMetadata};
use crate::video::synthetic::SyntheticVideo;
use crate::video::VideoSource;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::{Duration, Instant};

pub struct ProcessingStats {
    pub state: RunState,
    pub processed_frames: u64,
    pub detected_frames: u64,
    pub errors: usize,
    pub duration: Duration,
    pub export: Option<ExportPaths>,
}

fn progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Drives one run to a terminal state, mirroring status onto a progress bar.
/// Ctrl-C cancels the run and keeps what was found so far.
pub async fn run_to_completion(
    coordinator: &ProcessingCoordinator,
    video: Box<dyn VideoSource>,
    metadata: VideoMetadata,
    output_root: &Path,
) -> Result<ProcessingStats> {
    let start_time = Instant::now();
    let pb = progress_bar()?;
    let mut rx = coordinator.subscribe();

    coordinator.start(video, metadata.clone())?;

    let snapshot = loop {
        let snapshot = rx.borrow_and_update().clone();
        pb.set_position(snapshot.status.progress.round() as u64);
        pb.set_message(format!(
            "{} frames, {} detections",
            snapshot.status.processed_frames, snapshot.status.detected_frames
        ));
        if snapshot.state.is_terminal() {
            break snapshot;
        }

        tokio::select! {
            changed = rx.changed() => {
                changed.context("Coordinator status channel closed")?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, cancelling run");
                coordinator.cancel()?;
            }
        }
    };

    pb.finish_with_message(format!("{:?}", snapshot.state));

    if snapshot.state == RunState::Failed {
        anyhow::bail!(
            "Processing {} failed: {}",
            metadata.name,
            snapshot.status.last_error().unwrap_or("unknown error")
        );
    }

    let export = if snapshot.detections.is_empty() {
        tracing::info!("No humans detected in {}", metadata.name);
        None
    } else {
        let record = create_run(output_root, &metadata)?;
        Some(export_detections(&record.output_dir, &snapshot)?)
    };

    Ok(ProcessingStats {
        state: snapshot.state,
        processed_frames: snapshot.status.processed_frames,
        detected_frames: snapshot.status.detected_frames,
        errors: snapshot.status.errors.len(),
        duration: start_time.elapsed(),
        export,
    })
}

pub async fn process_video(args: ProcessArgs) -> Result<ProcessingStats> {
    let coordinator = ProcessingCoordinator::new(&args.pipeline.config())
        .context("Invalid pipeline configuration")?;

    let (video, metadata): (Box<dyn VideoSource>, VideoMetadata) = if args.synthetic {
        let video = SyntheticVideo::new(10.0, 30.0, 640, 360);
        let name = args
            .video
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("synthetic.mp4")
            .to_string();
        let metadata = VideoMetadata::from_stream(&name, 0, "video/mp4", video.info());
        (Box::new(video) as Box<dyn VideoSource>, metadata)
    } else {
        let path = args.video.clone();
        let backend = args.pipeline.backend;
        tokio::task::spawn_blocking(move || open_video(&path, backend))
            .await?
            .with_context(|| format!("Failed to open video at: {:?}", args.video))?
    };

    let stats = run_to_completion(&coordinator, video, metadata, &args.output_root).await?;

    tracing::info!(
        "{:?} after {:.1}s: {} frames sampled, {} detections, {} detection errors",
        stats.state,
        stats.duration.as_secs_f64(),
        stats.processed_frames,
        stats.detected_frames,
        stats.errors
    );
    if let Some(export) = &stats.export {
        tracing::info!("Report written to {:?} and {:?}", export.csv, export.json);
    }

    Ok(stats)
}
