use super::{StreamInfo, VideoSource};
use crate::error::{PipelineError, PipelineResult};
use image::{Rgb, RgbImage};
use std::time::Duration;

/// Generated video with a fixed frame rate, used for dry runs and tests.
pub struct SyntheticVideo {
    info: StreamInfo,
    fps: f64,
    next_tick: u64,
    position: Option<f64>,
    tick_delay: Option<Duration>,
    fail_at: Option<f64>,
}

impl SyntheticVideo {
    pub fn new(duration_seconds: f64, fps: f64, width: u32, height: u32) -> Self {
        Self {
            info: StreamInfo {
                duration_seconds,
                width,
                height,
                frame_rate: Some(fps),
            },
            fps,
            next_tick: 0,
            position: None,
            tick_delay: None,
            fail_at: None,
        }
    }

    /// Ten seconds of 640x360 at 30 fps, played back faster than real time.
    pub fn demo() -> Self {
        Self::new(10.0, 30.0, 640, 360).with_tick_delay(Duration::from_millis(5))
    }

    /// Sleeps on every decoded frame to emulate real-time playback.
    pub fn with_tick_delay(mut self, delay: Duration) -> Self {
        self.tick_delay = Some(delay);
        self
    }

    /// Raises a decode error once playback reaches `seconds`.
    pub fn failing_at(mut self, seconds: f64) -> Self {
        self.fail_at = Some(seconds);
        self
    }
}

impl VideoSource for SyntheticVideo {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn seek(&mut self, seconds: f64) -> PipelineResult<()> {
        self.next_tick = (seconds.max(0.0) * self.fps).ceil() as u64;
        self.position = None;
        Ok(())
    }

    fn advance(&mut self) -> PipelineResult<Option<f64>> {
        let t = self.next_tick as f64 / self.fps;
        if t >= self.info.duration_seconds {
            return Ok(None);
        }
        if let Some(fail_at) = self.fail_at {
            if t >= fail_at {
                return Err(PipelineError::MediaDecode(format!(
                    "corrupt packet at {:.3}s",
                    t
                )));
            }
        }
        if let Some(delay) = self.tick_delay {
            std::thread::sleep(delay);
        }

        self.next_tick += 1;
        self.position = Some(t);
        Ok(Some(t))
    }

    fn capture(&mut self) -> PipelineResult<RgbImage> {
        let t = self
            .position
            .ok_or_else(|| PipelineError::MediaDecode("no frame decoded yet".to_string()))?;
        let shade = ((t / self.info.duration_seconds.max(f64::EPSILON)) * 255.0) as u8;
        let (w, h) = (self.info.width.max(1), self.info.height.max(1));

        Ok(RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x * 255 / w) as u8, (y * 255 / h) as u8, shade])
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_cover_duration() {
        let mut video = SyntheticVideo::new(1.0, 30.0, 4, 4);
        let mut ticks = Vec::new();
        while let Some(t) = video.advance().unwrap() {
            ticks.push(t);
        }
        assert_eq!(ticks.len(), 30);
        assert_eq!(ticks[0], 0.0);
        assert!(ticks[29] < 1.0);
    }

    #[test]
    fn test_seek_and_failure() {
        let mut video = SyntheticVideo::new(2.0, 10.0, 4, 4).failing_at(1.5);
        assert!(video.capture().is_err());

        video.seek(1.0).unwrap();
        assert_eq!(video.advance().unwrap(), Some(1.0));
        assert_eq!(video.capture().unwrap().dimensions(), (4, 4));

        video.seek(1.5).unwrap();
        assert!(matches!(
            video.advance(),
            Err(PipelineError::MediaDecode(_))
        ));
    }
}
