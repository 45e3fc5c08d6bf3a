pub mod ffmpeg_cli;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_reader;
pub mod synthetic;

use crate::error::{PipelineError, PipelineResult};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::path::Path;

/// JPEG quality used for captured stills
pub const CAPTURE_QUALITY: u8 = 80;

/// Container-level facts known once a source has been opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    /// `None` when the container does not report a usable rate
    pub frame_rate: Option<f64>,
}

/// A decodable video positioned somewhere on its timeline.
///
/// `advance` moves playback forward by one decoded frame and returns its
/// presentation time; `capture` renders the frame at the current position.
/// Sources are driven from a single blocking thread at a time.
pub trait VideoSource: Send {
    fn info(&self) -> &StreamInfo;

    /// Repositions playback so the next `advance` lands at or after `seconds`.
    fn seek(&mut self, seconds: f64) -> PipelineResult<()>;

    /// `Ok(None)` marks the natural end of the stream.
    fn advance(&mut self) -> PipelineResult<Option<f64>>;

    fn capture(&mut self) -> PipelineResult<RgbImage>;
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backend {
    /// Spawn the `ffmpeg`/`ffprobe` executables
    #[default]
    FfmpegCli,
    /// Link libav through ffmpeg-next (requires the `ffmpeg` feature)
    Ffmpeg,
}

pub fn open_source(path: &Path, backend: Backend) -> PipelineResult<Box<dyn VideoSource>> {
    match backend {
        Backend::FfmpegCli => Ok(Box::new(ffmpeg_cli::FfmpegCliSource::open(path)?)),
        #[cfg(feature = "ffmpeg")]
        Backend::Ffmpeg => Ok(Box::new(ffmpeg_reader::FfmpegReader::open(path)?)),
        #[cfg(not(feature = "ffmpeg"))]
        Backend::Ffmpeg => Err(PipelineError::Configuration(
            "the ffmpeg backend was not compiled in, rebuild with --features ffmpeg".to_string(),
        )),
    }
}

/// Encodes an RGB frame as a self-contained `data:image/jpeg;base64,...` URL.
pub fn encode_data_url(image: &RgbImage) -> PipelineResult<String> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, CAPTURE_QUALITY)
        .encode_image(image)
        .map_err(|e| PipelineError::MediaDecode(format!("JPEG encoding failed: {}", e)))?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(&jpeg);
    Ok(format!("data:image/jpeg;base64,{}", encoded))
}

/// Splits a data URL into its MIME type and base64 payload.
pub fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    Some((mime, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_url_is_jpeg() {
        let image = RgbImage::from_pixel(16, 8, image::Rgb([10, 200, 30]));
        let url = encode_data_url(&image).unwrap();

        let (mime, payload) = split_data_url(&url).unwrap();
        assert_eq!(mime, "image/jpeg");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .unwrap();
        // SOI marker
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_split_rejects_plain_urls() {
        assert!(split_data_url("https://example.com/frame.jpg").is_none());
        assert!(split_data_url("data:image/png,raw").is_none());
    }
}
