use crate::pipeline::types::{DetectedFrame, StatusSnapshot};
use crate::run_context::VideoMetadata;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DetectionReport<'a> {
    generated_at: DateTime<Utc>,
    video: Option<&'a VideoMetadata>,
    total_detections: usize,
    detections: &'a [Arc<DetectedFrame>],
}

/// Files written by one export
#[derive(Debug, Clone)]
pub struct ExportPaths {
    pub csv: PathBuf,
    pub json: PathBuf,
}

/// `HH:MM:SS:FF`, with the frame field counted at `frame_rate`.
pub fn format_timecode(seconds: f64, frame_rate: f64) -> String {
    let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
    let whole = seconds.floor() as u64;
    let frames = ((seconds - whole as f64) * frame_rate).floor() as u64;
    format!(
        "{:02}:{:02}:{:02}:{:02}",
        whole / 3600,
        (whole % 3600) / 60,
        whole % 60,
        frames
    )
}

/// Writes `detections.csv` and `detections.json` for the detections in
/// `snapshot`. Refuses to export when nothing was detected.
pub fn export_detections(output_dir: &Path, snapshot: &StatusSnapshot) -> Result<ExportPaths> {
    if snapshot.detections.is_empty() {
        bail!("No detections to export");
    }
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {:?}", output_dir))?;

    let frame_rate = snapshot
        .metadata
        .as_ref()
        .map(|m| m.frame_rate)
        .unwrap_or(VideoMetadata::DEFAULT_FRAME_RATE);

    let csv_path = output_dir.join("detections.csv");
    let mut writer = csv::Writer::from_path(&csv_path)
        .with_context(|| format!("Failed to create {:?}", csv_path))?;
    writer.write_record(["Frame Number", "Timestamp", "Confidence", "Description"])?;
    for frame in &snapshot.detections {
        writer.write_record([
            frame.frame_number.to_string(),
            format_timecode(frame.timestamp, frame_rate),
            format!("{:.1}%", frame.confidence * 100.0),
            frame.description.clone(),
        ])?;
    }
    writer.flush()?;

    let json_path = output_dir.join("detections.json");
    let report = DetectionReport {
        generated_at: Utc::now(),
        video: snapshot.metadata.as_ref(),
        total_detections: snapshot.detections.len(),
        detections: &snapshot.detections,
    };
    fs::write(&json_path, serde_json::to_string_pretty(&report)?)?;

    tracing::info!(
        "Exported {} detections to {:?}",
        snapshot.detections.len(),
        output_dir
    );

    Ok(ExportPaths {
        csv: csv_path,
        json: json_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{BoundingBox, DetectionResponse};

    #[test]
    fn test_format_timecode() {
        assert_eq!(format_timecode(0.0, 30.0), "00:00:00:00");
        assert_eq!(format_timecode(61.5, 30.0), "00:01:01:15");
        assert_eq!(format_timecode(3725.25, 24.0), "01:02:05:06");
        assert_eq!(format_timecode(-3.0, 30.0), "00:00:00:00");
    }

    fn detected(n: u64, description: &str) -> Arc<DetectedFrame> {
        Arc::new(
            DetectedFrame::sampled(n, n as f64 + 0.5, "data:,".into()).enrich(DetectionResponse {
                human_detected: true,
                description: description.into(),
                confidence: 0.875,
                bounding_box: Some(BoundingBox {
                    x: 1.0,
                    y: 2.0,
                    width: 3.0,
                    height: 4.0,
                }),
            }),
        )
    }

    #[test]
    fn test_export_writes_csv_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = StatusSnapshot {
            detections: vec![detected(3, "Person, waving \"help\""), detected(7, "Hiker")],
            ..StatusSnapshot::default()
        };

        let paths = export_detections(dir.path(), &snapshot).unwrap();

        let csv = fs::read_to_string(&paths.csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Frame Number,Timestamp,Confidence,Description");
        assert_eq!(lines[1], "3,00:00:03:15,87.5%,\"Person, waving \"\"help\"\"\"");
        assert_eq!(lines[2], "7,00:00:07:15,87.5%,Hiker");

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.json).unwrap()).unwrap();
        assert_eq!(json["totalDetections"], 2);
        assert_eq!(json["detections"][1]["frameNumber"], 7);
    }

    #[test]
    fn test_export_refuses_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        assert!(export_detections(dir.path(), &StatusSnapshot::default()).is_err());
        assert!(!dir.path().join("detections.csv").exists());
    }
}
