use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::detection::{Classified, DetectionClassifier};
use crate::pipeline::types::DetectedFrame;
use futures::future::join_all;

/// Bounds classification concurrency: frames are classified in consecutive
/// groups, concurrently within a group and one group after another.
#[derive(Clone)]
pub struct BatchRunner {
    classifier: DetectionClassifier,
    batch_size: usize,
}

impl BatchRunner {
    pub fn new(classifier: DetectionClassifier, batch_size: usize) -> PipelineResult<Self> {
        if batch_size == 0 {
            return Err(PipelineError::Configuration(
                "batch size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            classifier,
            batch_size,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn classifier(&self) -> &DetectionClassifier {
        &self.classifier
    }

    /// Output has the same length and order as `frames`. A failed item comes
    /// back as its original frame with the error attached.
    pub async fn classify_all(&self, frames: Vec<DetectedFrame>) -> Vec<Classified> {
        let mut results = Vec::with_capacity(frames.len());
        let mut pending = frames.into_iter().peekable();

        while pending.peek().is_some() {
            let group: Vec<DetectedFrame> = pending.by_ref().take(self.batch_size).collect();
            tracing::debug!(
                "Classifying batch of {} frame(s) starting at {}",
                group.len(),
                group[0].frame_number
            );
            let classified = join_all(group.into_iter().map(|f| self.classifier.classify(f))).await;
            results.extend(classified);
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DetectionError;
    use crate::pipeline::detection::HumanDetector;
    use crate::pipeline::types::DetectionResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Later frames answer sooner; odd frames fail. Tracks peak concurrency.
    #[derive(Default)]
    struct Staggered {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl HumanDetector for Staggered {
        fn name(&self) -> &str {
            "staggered"
        }

        async fn detect(&self, frame: &DetectedFrame) -> Result<DetectionResponse, DetectionError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = 5 * (10u64.saturating_sub(frame.frame_number % 10));
            tokio::time::sleep(Duration::from_millis(delay)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if frame.frame_number % 2 == 1 {
                return Err(DetectionError::Parse("odd frame".into()));
            }
            Ok(DetectionResponse {
                human_detected: true,
                description: format!("frame {}", frame.frame_number),
                confidence: 0.9,
                bounding_box: None,
            })
        }
    }

    fn frames(n: u64) -> Vec<DetectedFrame> {
        (0..n)
            .map(|i| DetectedFrame::sampled(i, i as f64, "data:,".into()))
            .collect()
    }

    async fn run(batch_size: usize, n: u64) -> (Vec<Classified>, usize) {
        let detector = Arc::new(Staggered::default());
        let runner =
            BatchRunner::new(DetectionClassifier::new(detector.clone()), batch_size).unwrap();
        let out = runner.classify_all(frames(n)).await;
        (out, detector.peak.load(Ordering::SeqCst))
    }

    fn assert_in_order(out: &[Classified], n: u64) {
        assert_eq!(out.len(), n as usize);
        for (i, c) in out.iter().enumerate() {
            assert_eq!(c.frame.frame_number, i as u64);
            if i % 2 == 1 {
                assert!(c.error.is_some());
                assert!(!c.frame.human_detected);
            } else {
                assert!(c.error.is_none());
                assert!(c.frame.human_detected);
            }
        }
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let classifier =
            DetectionClassifier::new(Arc::new(crate::pipeline::detection::MockDetector::new()));
        assert!(matches!(
            BatchRunner::new(classifier, 0),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_sequential_batches() {
        let (out, peak) = run(1, 7).await;
        assert_in_order(&out, 7);
        assert_eq!(peak, 1);
    }

    #[tokio::test]
    async fn test_single_batch() {
        let (out, peak) = run(64, 9).await;
        assert_in_order(&out, 9);
        assert_eq!(peak, 9);
    }

    #[tokio::test]
    async fn test_partial_last_batch() {
        let (out, peak) = run(4, 10).await;
        assert_in_order(&out, 10);
        assert!(peak <= 4);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let (out, _) = run(3, 0).await;
        assert!(out.is_empty());
    }
}
