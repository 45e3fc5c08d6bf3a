use crate::error::{PipelineError, PipelineResult};
use crate::video::{self, Backend, StreamInfo, VideoSource};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Immutable description of a loaded video. Replaced wholesale when a new
/// video is loaded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub name: String,
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    /// Best-effort estimate, containers rarely expose a true rate
    pub frame_rate: f64,
    pub size_bytes: u64,
    pub mime_type: String,
}

impl VideoMetadata {
    pub const DEFAULT_FRAME_RATE: f64 = 30.0;

    pub fn from_stream(name: &str, size_bytes: u64, mime_type: &str, info: &StreamInfo) -> Self {
        let frame_rate = info
            .frame_rate
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(Self::DEFAULT_FRAME_RATE);

        Self {
            name: name.to_string(),
            duration_seconds: info.duration_seconds,
            width: info.width,
            height: info.height,
            frame_rate,
            size_bytes,
            mime_type: mime_type.to_string(),
        }
    }

    pub fn estimated_total_frames(&self) -> u64 {
        let estimate = (self.duration_seconds * self.frame_rate).round();
        if estimate.is_finite() && estimate > 0.0 {
            estimate as u64
        } else {
            0
        }
    }
}

/// Returns the guessed MIME type, rejecting anything that is not `video/*`.
pub fn video_mime_type(path: &Path) -> PipelineResult<String> {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::VIDEO {
        Ok(mime.essence_str().to_string())
    } else {
        Err(PipelineError::UnsupportedMedia(format!(
            "{} ({})",
            path.display(),
            mime.essence_str()
        )))
    }
}

pub fn list_videos(video_root: &Path) -> Vec<PathBuf> {
    WalkDir::new(video_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| video_mime_type(e.path()).is_ok())
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// Accepts a video file for processing: checks the MIME type, opens a
/// decoder and derives the metadata once.
pub fn open_video(
    path: &Path,
    backend: Backend,
) -> PipelineResult<(Box<dyn VideoSource>, VideoMetadata)> {
    let mime_type = video_mime_type(path)?;
    let size_bytes = fs::metadata(path)
        .map_err(|e| PipelineError::MediaDecode(format!("{}: {}", path.display(), e)))?
        .len();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();

    let source = video::open_source(path, backend)?;
    let metadata = VideoMetadata::from_stream(&name, size_bytes, &mime_type, source.info());

    tracing::info!(
        "Accepted video {}: duration={:.2}s, {}x{}, fps={:.2}",
        metadata.name,
        metadata.duration_seconds,
        metadata.width,
        metadata.height,
        metadata.frame_rate
    );

    Ok((source, metadata))
}

/// A finished run persisted under the output root.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub video: VideoMetadata,
    #[serde(skip)]
    pub output_dir: PathBuf,
}

pub fn create_run(output_root: &Path, video: &VideoMetadata) -> Result<RunRecord> {
    let stem = Path::new(&video.name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Invalid video name: {}", video.name))?;

    let created_at = Utc::now();
    let run_id = format!("{}-{}", stem, created_at.format("%Y%m%d-%H%M%S"));
    let output_dir = output_root.join(&run_id);
    if output_dir.exists() {
        return Err(anyhow::anyhow!(
            "Output directory already exists for: {}",
            run_id
        ));
    }

    fs::create_dir_all(&output_dir)?;

    let record = RunRecord {
        run_id,
        created_at,
        video: video.clone(),
        output_dir: output_dir.clone(),
    };

    let metadata_path = output_dir.join("metadata.json");
    let content = serde_json::to_string_pretty(&record)?;
    fs::write(metadata_path, content)?;

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(duration: f64, fps: Option<f64>) -> StreamInfo {
        StreamInfo {
            duration_seconds: duration,
            width: 1920,
            height: 1080,
            frame_rate: fps,
        }
    }

    #[test]
    fn test_frame_rate_falls_back_to_default() {
        let metadata = VideoMetadata::from_stream("a.mp4", 10, "video/mp4", &info(10.0, None));
        assert_eq!(metadata.frame_rate, 30.0);
        assert_eq!(metadata.estimated_total_frames(), 300);

        let metadata =
            VideoMetadata::from_stream("a.mp4", 10, "video/mp4", &info(2.0, Some(29.97)));
        assert_eq!(metadata.estimated_total_frames(), 60);
    }

    #[test]
    fn test_mime_check() {
        assert_eq!(
            video_mime_type(Path::new("clip.mp4")).unwrap(),
            "video/mp4"
        );
        assert!(video_mime_type(Path::new("clip.MOV")).is_ok());
        assert!(matches!(
            video_mime_type(Path::new("notes.txt")),
            Err(PipelineError::UnsupportedMedia(_))
        ));
        assert!(video_mime_type(Path::new("no_extension")).is_err());
    }

    #[test]
    fn test_list_videos_filters_by_mime() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("day1")).unwrap();
        fs::write(dir.path().join("day1/flight.mp4"), b"").unwrap();
        fs::write(dir.path().join("flight.mkv"), b"").unwrap();
        fs::write(dir.path().join("log.csv"), b"").unwrap();

        let mut names: Vec<String> = list_videos(dir.path())
            .iter()
            .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
            .collect();
        names.sort();
        assert_eq!(names, vec!["flight.mkv", "flight.mp4"]);
    }

    #[test]
    fn test_create_run_writes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let video = VideoMetadata::from_stream("flight.mp4", 42, "video/mp4", &info(5.0, None));

        let record = create_run(dir.path(), &video).unwrap();
        assert!(record.run_id.starts_with("flight-"));
        let written = fs::read_to_string(record.output_dir.join("metadata.json")).unwrap();
        let parsed: RunRecord = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.video, video);
    }
}
