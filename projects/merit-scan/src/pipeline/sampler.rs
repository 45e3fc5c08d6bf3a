use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::types::DetectedFrame;
use crate::video::{encode_data_url, VideoSource};
use tokio_util::sync::CancellationToken;

/// Slack when comparing playback distance against the sampling interval
const INTERVAL_TOLERANCE: f64 = 1e-6;

/// Where a sampling run stands, carried across pause/resume so numbering
/// continues strictly after the last captured frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SamplerCursor {
    pub next_frame_number: u64,
    pub last_captured: Option<f64>,
}

impl SamplerCursor {
    pub fn is_fresh(&self) -> bool {
        self.next_frame_number == 0 && self.last_captured.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerOutcome {
    /// Playback reached the end of the timeline
    Finished(SamplerCursor),
    /// The cancellation token was observed; playback stopped where it was
    Stopped(SamplerCursor),
}

/// Turns a video timeline into a sequence of captured stills.
#[derive(Debug, Clone, Copy)]
pub struct FrameSampler {
    sampling_rate: f64,
}

impl FrameSampler {
    pub fn new(sampling_rate: f64) -> PipelineResult<Self> {
        if !sampling_rate.is_finite() || sampling_rate <= 0.0 {
            return Err(PipelineError::Configuration(format!(
                "sampling rate must be a positive number, got {}",
                sampling_rate
            )));
        }
        Ok(Self { sampling_rate })
    }

    pub fn interval_seconds(&self) -> f64 {
        1.0 / self.sampling_rate
    }

    /// Drives `video` forward tick by tick, capturing a frame whenever at
    /// least one sampling interval of playback has elapsed since the last
    /// capture. `on_progress(percent, current_time)` fires on every tick.
    ///
    /// A fresh cursor rewinds to the start; otherwise playback continues from
    /// wherever the source currently is. Cancellation is checked before each
    /// tick and ends the run with `SamplerOutcome::Stopped`, never an error.
    pub fn extract(
        &self,
        video: &mut dyn VideoSource,
        mut cursor: SamplerCursor,
        on_frame: &mut dyn FnMut(DetectedFrame),
        on_progress: &mut dyn FnMut(f64, f64),
        cancel: &CancellationToken,
    ) -> PipelineResult<SamplerOutcome> {
        let duration = video.info().duration_seconds;
        if !duration.is_finite() || duration <= 0.0 {
            tracing::info!("Video has no usable duration, nothing to sample");
            return Ok(SamplerOutcome::Finished(cursor));
        }

        if cursor.is_fresh() {
            video.seek(0.0)?;
        }

        let interval = self.interval_seconds();

        loop {
            if cancel.is_cancelled() {
                tracing::debug!(
                    "Sampling stopped before frame {}",
                    cursor.next_frame_number
                );
                return Ok(SamplerOutcome::Stopped(cursor));
            }

            let Some(current) = video.advance()? else {
                break;
            };
            if current >= duration {
                break;
            }

            let due = match cursor.last_captured {
                None => true,
                Some(last) => current - last >= interval - INTERVAL_TOLERANCE,
            };

            if due {
                let still = video.capture()?;
                let image_url = encode_data_url(&still)?;
                on_frame(DetectedFrame::sampled(
                    cursor.next_frame_number,
                    current,
                    image_url,
                ));
                cursor.next_frame_number += 1;
                cursor.last_captured = Some(current);
            }

            on_progress((current / duration * 100.0).min(100.0), current);
        }

        Ok(SamplerOutcome::Finished(cursor))
    }
}
