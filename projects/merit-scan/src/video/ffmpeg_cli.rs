// Video source backed by the `ffprobe` and `ffmpeg` executables.
//
// Frames are streamed as raw RGB24 over the child's stdout, one decoder
// process per seek. The decoder's stderr is drained on a side thread and
// reported when the process exits unsuccessfully.

use super::{StreamInfo, VideoSource};
use crate::error::{PipelineError, PipelineResult};
use image::RgbImage;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

/// Longest stderr excerpt carried into a decode error
const STDERR_TAIL_CHARS: usize = 512;

/// Executables used to probe and decode.
#[derive(Debug, Clone)]
pub struct FfmpegTools {
    pub ffprobe: PathBuf,
    pub ffmpeg: PathBuf,
}

impl Default for FfmpegTools {
    fn default() -> Self {
        Self {
            ffprobe: PathBuf::from("ffprobe"),
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

struct Decoder {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
}

pub struct FfmpegCliSource {
    path: PathBuf,
    tools: FfmpegTools,
    info: StreamInfo,
    fps: f64,
    decoder: Option<Decoder>,
    start_seconds: f64,
    decoded: u64,
    frame: Vec<u8>,
    has_frame: bool,
    /// Output ran out; stays set until the next seek
    ended: bool,
}

impl FfmpegCliSource {
    pub fn open(path: &Path) -> PipelineResult<Self> {
        Self::open_with(path, FfmpegTools::default())
    }

    pub fn open_with(path: &Path, tools: FfmpegTools) -> PipelineResult<Self> {
        if !path.exists() {
            return Err(PipelineError::MediaDecode(format!(
                "video file not found: {}",
                path.display()
            )));
        }

        let output = Command::new(&tools.ffprobe)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .output()
            .map_err(|e| PipelineError::MediaDecode(format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(PipelineError::MediaDecode(format!(
                "ffprobe failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let info = parse_probe_output(&String::from_utf8_lossy(&output.stdout))?;
        let fps = info
            .frame_rate
            .unwrap_or(crate::run_context::VideoMetadata::DEFAULT_FRAME_RATE);
        let frame_len = info.width as usize * info.height as usize * 3;

        tracing::info!(
            "FfmpegCliSource: opened {}, duration={:.2}s, {}x{}, fps={:?}",
            path.display(),
            info.duration_seconds,
            info.width,
            info.height,
            info.frame_rate
        );

        Ok(Self {
            path: path.to_path_buf(),
            tools,
            info,
            fps,
            decoder: None,
            start_seconds: 0.0,
            decoded: 0,
            frame: vec![0; frame_len],
            has_frame: false,
            ended: false,
        })
    }

    fn spawn_decoder(&mut self) -> PipelineResult<()> {
        let mut child = Command::new(&self.tools.ffmpeg)
            .args(["-v", "error", "-ss"])
            .arg(format!("{:.6}", self.start_seconds))
            .arg("-i")
            .arg(&self.path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PipelineError::MediaDecode(format!("failed to run ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::MediaDecode("ffmpeg stdout unavailable".to_string()))?;
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut bytes = Vec::new();
                let _ = pipe.read_to_end(&mut bytes);
                String::from_utf8_lossy(&bytes).into_owned()
            })
        });

        self.decoder = Some(Decoder {
            child,
            stdout,
            stderr,
        });
        Ok(())
    }

    /// Kills a decoder that is no longer wanted.
    fn stop_decoder(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            let _ = decoder.child.kill();
            let _ = decoder.child.wait();
        }
    }

    /// Reaps a decoder whose output has ended. A non-zero exit is a decode failure.
    fn finish_decoder(&mut self) -> PipelineResult<()> {
        let Some(mut decoder) = self.decoder.take() else {
            return Ok(());
        };
        drop(decoder.stdout);

        let status = decoder.child.wait().map_err(|e| {
            PipelineError::MediaDecode(format!("waiting for ffmpeg failed: {}", e))
        })?;
        let stderr = decoder
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if status.success() {
            return Ok(());
        }

        let position = self.start_seconds + self.decoded as f64 / self.fps;
        Err(PipelineError::MediaDecode(format!(
            "ffmpeg exited with {} at {:.2}s: {}",
            status,
            position,
            stderr_tail(&stderr)
        )))
    }
}

fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return "no diagnostic output";
    }
    let mut start = trimmed.len().saturating_sub(STDERR_TAIL_CHARS);
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

impl VideoSource for FfmpegCliSource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn seek(&mut self, seconds: f64) -> PipelineResult<()> {
        self.stop_decoder();
        self.start_seconds = seconds.max(0.0);
        self.decoded = 0;
        self.has_frame = false;
        self.ended = false;
        Ok(())
    }

    fn advance(&mut self) -> PipelineResult<Option<f64>> {
        if self.frame.is_empty() || self.ended {
            return Ok(None);
        }
        if self.decoder.is_none() {
            self.spawn_decoder()?;
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(None);
        };

        match decoder.stdout.read_exact(&mut self.frame) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.has_frame = false;
                self.ended = true;
                self.finish_decoder()?;
                return Ok(None);
            }
            Err(e) => {
                self.stop_decoder();
                return Err(PipelineError::MediaDecode(format!(
                    "reading decoded frame failed: {}",
                    e
                )));
            }
        }

        let t = self.start_seconds + self.decoded as f64 / self.fps;
        self.decoded += 1;
        self.has_frame = true;
        Ok(Some(t))
    }

    fn capture(&mut self) -> PipelineResult<RgbImage> {
        if !self.has_frame {
            return Err(PipelineError::MediaDecode(
                "no frame decoded yet".to_string(),
            ));
        }
        RgbImage::from_raw(self.info.width, self.info.height, self.frame.clone())
            .ok_or_else(|| PipelineError::MediaDecode("frame buffer size mismatch".to_string()))
    }
}

impl Drop for FfmpegCliSource {
    fn drop(&mut self) {
        self.stop_decoder();
    }
}

/// Reads duration, dimensions and frame rate out of `ffprobe -print_format json`.
pub fn parse_probe_output(json_str: &str) -> PipelineResult<StreamInfo> {
    let json: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| PipelineError::MediaDecode(format!("failed to parse ffprobe output: {}", e)))?;

    let streams = json
        .get("streams")
        .and_then(|s| s.as_array())
        .cloned()
        .unwrap_or_default();

    let video = streams
        .iter()
        .find(|s| s.get("codec_type").and_then(|c| c.as_str()) == Some("video"))
        .ok_or_else(|| PipelineError::MediaDecode("no video stream found".to_string()))?;

    let width = video.get("width").and_then(|w| w.as_u64()).unwrap_or(0) as u32;
    let height = video.get("height").and_then(|h| h.as_u64()).unwrap_or(0) as u32;

    let frame_rate = ["avg_frame_rate", "r_frame_rate"]
        .iter()
        .filter_map(|key| video.get(*key).and_then(|f| f.as_str()))
        .find_map(parse_rational);

    // Container duration first, stream duration as fallback
    let duration_seconds = json
        .get("format")
        .and_then(|f| f.get("duration"))
        .or_else(|| video.get("duration"))
        .and_then(|d| d.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .unwrap_or(0.0);

    Ok(StreamInfo {
        duration_seconds,
        width,
        height,
        frame_rate,
    })
}

/// Parses "30000/1001" style rates. Zero denominators and zero rates yield `None`.
fn parse_rational(s: &str) -> Option<f64> {
    let (num, den) = s.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den > 0.0 && num > 0.0 {
        Some(num / den)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio", "sample_rate": "48000"},
                {"codec_type": "video", "width": 3840, "height": 2160,
                 "avg_frame_rate": "30000/1001", "r_frame_rate": "30000/1001"}
            ],
            "format": {"duration": "125.458000", "size": "104857600"}
        }"#;

        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.width, 3840);
        assert_eq!(info.height, 2160);
        assert!((info.duration_seconds - 125.458).abs() < 1e-9);
        assert!((info.frame_rate.unwrap() - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_unknown_frame_rate_is_none() {
        let json = r#"{
            "streams": [{"codec_type": "video", "width": 640, "height": 360,
                         "avg_frame_rate": "0/0", "r_frame_rate": "0/0"}],
            "format": {}
        }"#;

        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.frame_rate, None);
        assert_eq!(info.duration_seconds, 0.0);
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    // One test for every stub so no script is exec'd while another is still being written
    #[cfg(unix)]
    #[test]
    fn test_decoder_exit_status_decides_end_of_stream() {
        use crate::pipeline::sampler::{FrameSampler, SamplerOutcome};
        use tokio_util::sync::CancellationToken;

        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("ridge.mp4");
        std::fs::write(&video, b"").unwrap();

        let probe = r#"cat <<'JSON'
{"streams": [{"codec_type": "video", "width": 4, "height": 4, "avg_frame_rate": "30/1"}],
 "format": {"duration": "10.0"}}
JSON"#;
        let ffprobe = write_script(dir.path(), "ffprobe", probe);
        // 4x4 rgb24 frames are 48 bytes each
        let broken = write_script(
            dir.path(),
            "ffmpeg-broken",
            "head -c 96 /dev/zero\necho 'Invalid data found when processing input' >&2\nexit 1",
        );
        let healthy = write_script(dir.path(), "ffmpeg-healthy", "head -c 144 /dev/zero\nexit 0");

        let sampler = FrameSampler::new(30.0).unwrap();
        let run = |ffmpeg: PathBuf| {
            let tools = FfmpegTools {
                ffprobe: ffprobe.clone(),
                ffmpeg,
            };
            let mut source = FfmpegCliSource::open_with(&video, tools).unwrap();
            let mut frames = 0;
            let outcome = sampler.extract(
                &mut source,
                Default::default(),
                &mut |_| frames += 1,
                &mut |_, _| {},
                &CancellationToken::new(),
            );
            (outcome, frames)
        };

        let (outcome, frames) = run(broken);
        assert_eq!(frames, 2);
        match outcome {
            Err(PipelineError::MediaDecode(message)) => {
                assert!(message.contains("Invalid data found"), "{}", message)
            }
            other => panic!("expected a decode error, got {:?}", other),
        }

        let (outcome, frames) = run(healthy);
        assert_eq!(frames, 3);
        assert!(matches!(outcome, Ok(SamplerOutcome::Finished(_))));
    }

    #[test]
    fn test_stderr_tail_keeps_the_end() {
        assert_eq!(stderr_tail("  \n"), "no diagnostic output");
        let long = format!("{}last line", "x".repeat(2 * STDERR_TAIL_CHARS));
        let tail = stderr_tail(&long);
        assert_eq!(tail.len(), STDERR_TAIL_CHARS);
        assert!(tail.ends_with("last line"));
    }

    #[test]
    fn test_audio_only_is_rejected() {
        let json = r#"{"streams": [{"codec_type": "audio"}], "format": {"duration": "3.0"}}"#;
        assert!(matches!(
            parse_probe_output(json),
            Err(PipelineError::MediaDecode(_))
        ));
        assert!(parse_probe_output("not json").is_err());
    }
}
