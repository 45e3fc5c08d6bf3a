use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::detection::{DetectionClassifier, MockDetector};
use crate::pipeline::remote::{RemoteDetector, DEFAULT_ENDPOINT};
use std::sync::Arc;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClassifierKind {
    /// Random answers with simulated latency, no network access
    #[default]
    Mock,
    /// Multimodal model over HTTP
    Remote,
}

/// Tunables for a processing run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Frames captured per second of video
    pub sample_rate: f64,
    /// Classify in groups of this size; `None` classifies one frame at a time
    pub batch_size: Option<usize>,
    pub classifier: ClassifierKind,
    pub api_key: Option<String>,
    pub endpoint: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 1.0,
            batch_size: None,
            classifier: ClassifierKind::Mock,
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(PipelineError::Configuration(format!(
                "sample rate must be a positive number, got {}",
                self.sample_rate
            )));
        }
        if self.batch_size == Some(0) {
            return Err(PipelineError::Configuration(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.classifier == ClassifierKind::Remote
            && self.api_key.as_deref().map_or(true, str::is_empty)
        {
            return Err(PipelineError::Configuration(
                "the remote classifier requires an API key".to_string(),
            ));
        }
        Ok(())
    }

    pub fn build_classifier(&self) -> PipelineResult<DetectionClassifier> {
        match self.classifier {
            ClassifierKind::Mock => Ok(DetectionClassifier::new(Arc::new(MockDetector::new()))),
            ClassifierKind::Remote => {
                let api_key = self.api_key.clone().unwrap_or_default();
                let detector = RemoteDetector::new(api_key, self.endpoint.clone())?;
                Ok(DetectionClassifier::new(Arc::new(detector)))
            }
        }
    }
}
