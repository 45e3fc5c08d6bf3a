use crate::run_context::VideoMetadata;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Bounding box in percentage-of-frame units (0-100 on both axes)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Structured classifier answer for one frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResponse {
    pub human_detected: bool,
    pub description: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
}

/// One sampled instant of the source video, whether or not a human was found.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetectedFrame {
    pub id: String,
    pub frame_number: u64,
    /// Seconds into the source video
    pub timestamp: f64,
    /// Self-contained `data:` URL of the captured still
    pub image_url: String,
    pub human_detected: bool,
    pub confidence: f64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
}

impl DetectedFrame {
    /// A freshly captured frame, before classification.
    pub fn sampled(frame_number: u64, timestamp: f64, image_url: String) -> Self {
        Self {
            id: format!("frame-{}", frame_number),
            frame_number,
            timestamp,
            image_url,
            human_detected: false,
            confidence: 0.0,
            description: String::new(),
            bounding_box: None,
        }
    }

    /// Overwrites the classification fields. Identity, timestamp and image are kept.
    pub fn enrich(mut self, response: DetectionResponse) -> Self {
        self.human_detected = response.human_detected;
        self.confidence = if response.confidence.is_finite() {
            response.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.description = response.description;
        self.bounding_box = response.bounding_box;
        self
    }
}

/// Lifecycle of a coordinator run
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    /// A run exists and has not reached a terminal state.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Aggregate progress of the current run, owned by the coordinator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatus {
    pub is_processing: bool,
    /// Advisory estimate: round(duration * frame rate)
    pub total_frames: u64,
    pub processed_frames: u64,
    pub detected_frames: u64,
    /// 0-100, share of the timeline covered by playback
    pub progress: f64,
    pub current_timestamp: f64,
    /// Oldest first, append-only
    pub errors: Vec<String>,
}

impl ProcessingStatus {
    /// Zero status for a run that is about to start.
    pub fn for_run(metadata: &VideoMetadata) -> Self {
        Self {
            is_processing: true,
            total_frames: metadata.estimated_total_frames(),
            ..Self::default()
        }
    }

    /// The error surfaced prominently to the operator.
    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }
}

/// Read-only view pushed to observers on every state change.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: RunState,
    pub status: ProcessingStatus,
    pub metadata: Option<VideoMetadata>,
    /// Detections in frame-number order
    pub detections: Vec<Arc<DetectedFrame>>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            status: ProcessingStatus::default(),
            metadata: None,
            detections: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrich_keeps_identity() {
        let frame = DetectedFrame::sampled(7, 7.0, "data:image/jpeg;base64,AAAA".into());
        let enriched = frame.clone().enrich(DetectionResponse {
            human_detected: true,
            description: "Human detected in the center of the frame.".into(),
            confidence: 1.7,
            bounding_box: Some(BoundingBox {
                x: 40.0,
                y: 40.0,
                width: 10.0,
                height: 20.0,
            }),
        });

        assert_eq!(enriched.id, "frame-7");
        assert_eq!(enriched.frame_number, frame.frame_number);
        assert_eq!(enriched.timestamp, frame.timestamp);
        assert_eq!(enriched.image_url, frame.image_url);
        assert!(enriched.human_detected);
        // Out-of-range confidence from a remote model is clamped
        assert_eq!(enriched.confidence, 1.0);
    }

    #[test]
    fn test_frame_serializes_camel_case() {
        let frame = DetectedFrame::sampled(0, 0.0, "data:,".into());
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["frameNumber"], 0);
        assert_eq!(json["humanDetected"], false);
        assert!(json.get("boundingBox").is_none());
    }

    #[test]
    fn test_run_state_classes() {
        assert!(RunState::Paused.is_active());
        assert!(!RunState::Paused.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(!RunState::Idle.is_active());
        assert!(!RunState::Idle.is_terminal());
    }
}
