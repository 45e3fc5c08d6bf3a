use crate::error::DetectionError;
use crate::pipeline::types::{BoundingBox, DetectedFrame, DetectionResponse};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// A single-frame human-presence classifier.
#[async_trait]
pub trait HumanDetector: Send + Sync {
    fn name(&self) -> &str;

    async fn detect(&self, frame: &DetectedFrame) -> Result<DetectionResponse, DetectionError>;
}

/// Outcome of one classification. On failure `frame` is the original,
/// unenriched frame and `error` says why.
#[derive(Debug, Clone)]
pub struct Classified {
    pub frame: DetectedFrame,
    pub error: Option<DetectionError>,
}

/// Classifier selected once at construction and shared by every frame of a run.
#[derive(Clone)]
pub struct DetectionClassifier {
    detector: Arc<dyn HumanDetector>,
}

impl DetectionClassifier {
    pub fn new(detector: Arc<dyn HumanDetector>) -> Self {
        Self { detector }
    }

    pub fn name(&self) -> &str {
        self.detector.name()
    }

    pub async fn classify(&self, frame: DetectedFrame) -> Classified {
        match self.detector.detect(&frame).await {
            Ok(response) => Classified {
                frame: frame.enrich(response),
                error: None,
            },
            Err(e) => {
                tracing::warn!(
                    "Detection failed for frame {} ({}, transport={}): {}",
                    frame.frame_number,
                    self.detector.name(),
                    e.is_transport(),
                    e
                );
                Classified {
                    frame,
                    error: Some(e),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MockDetector
// ---------------------------------------------------------------------------

/// Probability that the mock reports a human
pub const DETECTION_PROBABILITY: f64 = 0.2;

const POSITIONS: [&str; 5] = [
    "top left",
    "top right",
    "bottom left",
    "bottom right",
    "center",
];

const MIN_LATENCY: Duration = Duration::from_millis(200);
const MAX_LATENCY: Duration = Duration::from_millis(500);

/// Offline stand-in that answers randomly after a simulated delay.
pub struct MockDetector {
    min_latency: Duration,
    max_latency: Duration,
}

impl MockDetector {
    pub fn new() -> Self {
        Self::with_latency(MIN_LATENCY, MAX_LATENCY)
    }

    /// A reversed range is treated as a fixed `min` delay.
    pub fn with_latency(min: Duration, max: Duration) -> Self {
        Self {
            min_latency: min,
            max_latency: max.max(min),
        }
    }

    /// Simulated network delay, uniform over the configured range.
    pub fn latency<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.max_latency > self.min_latency {
            rng.gen_range(self.min_latency..=self.max_latency)
        } else {
            self.min_latency
        }
    }

    /// Draws one answer. Detected confidences fall in [0.5, 1.0), misses in [0, 0.3).
    pub fn sample<R: Rng>(rng: &mut R) -> DetectionResponse {
        if rng.gen_bool(DETECTION_PROBABILITY) {
            let position = POSITIONS[rng.gen_range(0..POSITIONS.len())];
            let x = rng.gen_range(20..80) as f64;
            let y = rng.gen_range(20..80) as f64;
            let width = (rng.gen_range(10..40) as f64).min(100.0 - x);
            let height = (rng.gen_range(20..60) as f64).min(100.0 - y);

            DetectionResponse {
                human_detected: true,
                description: format!("Human detected in the {} of the frame.", position),
                confidence: rng.gen_range(0.5..1.0),
                bounding_box: Some(BoundingBox {
                    x,
                    y,
                    width,
                    height,
                }),
            }
        } else {
            DetectionResponse {
                human_detected: false,
                description: "No humans detected in this frame.".to_string(),
                confidence: rng.gen_range(0.0..0.3),
                bounding_box: None,
            }
        }
    }
}

impl Default for MockDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HumanDetector for MockDetector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn detect(&self, _frame: &DetectedFrame) -> Result<DetectionResponse, DetectionError> {
        let (delay, response) = {
            let mut rng = rand::thread_rng();
            (self.latency(&mut rng), Self::sample(&mut rng))
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(response)
    }
}
