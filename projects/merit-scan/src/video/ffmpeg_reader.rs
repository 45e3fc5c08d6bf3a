use super::{StreamInfo, VideoSource};
use crate::error::{PipelineError, PipelineResult};
use ffmpeg_next::ffi;
use image::RgbImage;
use std::path::Path;

fn decode_err(context: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::MediaDecode(format!("{}: {}", context, e))
}

/// Video source decoding in-process through libav (software decoding only).
pub struct FfmpegReader {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Seconds per stream timestamp unit
    time_base: f64,
    /// Lazily created on first frame (source format is only known then).
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    info: StreamInfo,
    fps: f64,
    decoded_since_seek: u64,
    seek_origin: f64,
    /// Frames before this time are decoded and dropped after a seek.
    seek_target: Option<f64>,
    current: Option<ffmpeg_next::util::frame::Video>,
    reuse_packet: ffmpeg_next::codec::packet::Packet,
    eof_sent: bool,
}

// SAFETY: FfmpegReader is only ever driven from one blocking sampler thread at a time.
// The raw pointers inside ffmpeg-next types are not shared across threads.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn open(path: &Path) -> PipelineResult<Self> {
        ffmpeg_next::init().map_err(|e| decode_err("failed to initialize FFmpeg", e))?;

        if !path.exists() {
            return Err(PipelineError::MediaDecode(format!(
                "video file not found: {}",
                path.display()
            )));
        }

        let input_ctx =
            ffmpeg_next::format::input(&path).map_err(|e| decode_err("failed to open video", e))?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| {
                PipelineError::MediaDecode(format!("no video stream found in {}", path.display()))
            })?;
        let video_stream_index = video_stream.index();

        let rational_fps = video_stream.avg_frame_rate();
        let frame_rate = if rational_fps.denominator() > 0 && rational_fps.numerator() > 0 {
            Some(rational_fps.numerator() as f64 / rational_fps.denominator() as f64)
        } else {
            tracing::warn!("FfmpegReader: could not determine FPS");
            None
        };
        let tb = video_stream.time_base();
        let time_base = if tb.denominator() > 0 {
            tb.numerator() as f64 / tb.denominator() as f64
        } else {
            0.0
        };
        let duration_seconds = (input_ctx.duration() as f64 / ffi::AV_TIME_BASE as f64).max(0.0);

        let decoder_ctx =
            ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
                .map_err(|e| decode_err("failed to create decoder context", e))?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .map_err(|e| decode_err("failed to open video decoder", e))?;

        let info = StreamInfo {
            duration_seconds,
            width: decoder.width(),
            height: decoder.height(),
            frame_rate,
        };

        tracing::info!(
            "FfmpegReader: opened {}, duration={:.2}s, {}x{}, fps={:?}",
            path.display(),
            info.duration_seconds,
            info.width,
            info.height,
            info.frame_rate
        );

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            time_base,
            scaler: None,
            info,
            fps: frame_rate.unwrap_or(crate::run_context::VideoMetadata::DEFAULT_FRAME_RATE),
            decoded_since_seek: 0,
            seek_origin: 0.0,
            seek_target: None,
            current: None,
            reuse_packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
        })
    }

    /// Pulls the next decoded frame, feeding packets as needed. `None` at end of stream.
    fn decode_next(&mut self) -> PipelineResult<Option<ffmpeg_next::util::frame::Video>> {
        let mut frame = ffmpeg_next::util::frame::Video::empty();
        loop {
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => return Ok(Some(frame)),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(None);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(None),
                Err(e) => return Err(decode_err("decoder error", e)),
            }

            let mut found_packet = false;
            while self.reuse_packet.read(&mut self.input_ctx).is_ok() {
                if self.reuse_packet.stream() == self.video_stream_index {
                    self.decoder
                        .send_packet(&self.reuse_packet)
                        .map_err(|e| decode_err("failed to send packet to decoder", e))?;
                    found_packet = true;
                    break;
                }
            }

            if !found_packet {
                self.decoder
                    .send_eof()
                    .map_err(|e| decode_err("failed to send EOF to decoder", e))?;
                self.eof_sent = true;
            }
        }
    }

    fn presentation_time(&self, frame: &ffmpeg_next::util::frame::Video) -> f64 {
        match frame.timestamp() {
            Some(pts) if self.time_base > 0.0 => pts as f64 * self.time_base,
            _ => self.seek_origin + self.decoded_since_seek as f64 / self.fps,
        }
    }
}

impl VideoSource for FfmpegReader {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn seek(&mut self, seconds: f64) -> PipelineResult<()> {
        let seconds = seconds.max(0.0);
        let timestamp = (seconds * ffi::AV_TIME_BASE as f64) as i64;
        self.input_ctx
            .seek(timestamp, ..timestamp)
            .map_err(|e| decode_err("failed to seek", e))?;
        self.decoder.flush();
        self.eof_sent = false;
        self.scaler = None;
        self.current = None;
        self.decoded_since_seek = 0;
        self.seek_origin = seconds;
        self.seek_target = Some(seconds);
        Ok(())
    }

    fn advance(&mut self) -> PipelineResult<Option<f64>> {
        loop {
            let Some(frame) = self.decode_next()? else {
                self.current = None;
                return Ok(None);
            };
            let t = self.presentation_time(&frame);
            self.decoded_since_seek += 1;

            // Keyframe seeks land early; drop frames until the requested time
            if let Some(target) = self.seek_target {
                if t + 1e-6 < target {
                    continue;
                }
                self.seek_target = None;
            }

            self.current = Some(frame);
            return Ok(Some(t));
        }
    }

    fn capture(&mut self) -> PipelineResult<RgbImage> {
        let frame = self
            .current
            .as_ref()
            .ok_or_else(|| PipelineError::MediaDecode("no frame decoded yet".to_string()))?;
        let (width, height) = (frame.width(), frame.height());

        if self.scaler.is_none() {
            let scaler = ffmpeg_next::software::scaling::Context::get(
                frame.format(),
                width,
                height,
                ffmpeg_next::format::Pixel::RGB24,
                width,
                height,
                ffmpeg_next::software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| decode_err("failed to create scaler", e))?;
            self.scaler = Some(scaler);
        }
        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| PipelineError::MediaDecode("scaler unavailable".to_string()))?;

        let mut rgb = ffmpeg_next::util::frame::Video::empty();
        scaler
            .run(frame, &mut rgb)
            .map_err(|e| decode_err("scaler failed", e))?;

        // Rows are padded to the stride; copy the packed pixels out
        let stride = rgb.stride(0);
        let row_len = width as usize * 3;
        let data = rgb.data(0);
        let mut pixels = Vec::with_capacity(row_len * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            pixels.extend_from_slice(&data[start..start + row_len]);
        }

        RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| PipelineError::MediaDecode("frame buffer size mismatch".to_string()))
    }
}
