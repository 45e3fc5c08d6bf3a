use crate::pipeline::config::{ClassifierKind, PipelineConfig};
use crate::pipeline::remote::DEFAULT_ENDPOINT;
use crate::video::Backend;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP API for interactive runs
    Serve(ServeArgs),
    /// Process one video headlessly and write a detection report
    Process(ProcessArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(long, default_value_t = 12206)]
    pub port: u16,

    /// Root directory for video files
    #[arg(long, env = "MERIT_VIDEO_ROOT")]
    pub video_root: PathBuf,

    /// Root directory for output artifacts
    #[arg(long, env = "MERIT_OUTPUT_ROOT")]
    pub output_root: PathBuf,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ProcessArgs {
    /// Video file to scan
    pub video: PathBuf,

    /// Root directory for output artifacts
    #[arg(long, env = "MERIT_OUTPUT_ROOT", default_value = "output")]
    pub output_root: PathBuf,

    /// Sample a generated clip instead of decoding the given video
    #[arg(long)]
    pub synthetic: bool,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct PipelineArgs {
    /// Frames captured per second of video
    #[arg(long, env = "MERIT_SAMPLE_RATE", default_value_t = 1.0)]
    pub sample_rate: f64,

    /// Classify frames in concurrent groups of this size (default: one at a time)
    #[arg(long, env = "MERIT_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    #[arg(long, env = "MERIT_CLASSIFIER", value_enum, default_value_t = ClassifierKind::Mock)]
    pub classifier: ClassifierKind,

    /// API key for the remote classifier
    #[arg(long, env = "MERIT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// generateContent endpoint for the remote classifier
    #[arg(long, env = "MERIT_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Decoder used to read video files
    #[arg(long, env = "MERIT_BACKEND", value_enum, default_value_t = Backend::FfmpegCli)]
    pub backend: Backend,
}

impl PipelineArgs {
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            sample_rate: self.sample_rate,
            batch_size: self.batch_size,
            classifier: self.classifier,
            api_key: self.api_key.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_defaults() {
        let args = Args::try_parse_from(["merit-scan", "process", "flight.mp4"]).unwrap();
        let Command::Process(process) = args.command else {
            panic!("expected process subcommand");
        };
        assert_eq!(process.video, PathBuf::from("flight.mp4"));

        let config = process.pipeline.config();
        assert_eq!(config.sample_rate, 1.0);
        assert_eq!(config.batch_size, None);
        assert_eq!(config.classifier, ClassifierKind::Mock);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(process.pipeline.backend, Backend::FfmpegCli);
    }

    #[test]
    fn test_pipeline_flags() {
        let args = Args::try_parse_from([
            "merit-scan",
            "process",
            "flight.mp4",
            "--sample-rate",
            "2.5",
            "--batch-size",
            "4",
            "--classifier",
            "remote",
            "--api-key",
            "k",
            "--synthetic",
        ])
        .unwrap();
        let Command::Process(process) = args.command else {
            panic!("expected process subcommand");
        };
        let config = process.pipeline.config();
        assert_eq!(config.sample_rate, 2.5);
        assert_eq!(config.batch_size, Some(4));
        assert_eq!(config.classifier, ClassifierKind::Remote);
        assert!(config.validate().is_ok());
        assert!(process.synthetic);
    }

    #[test]
    fn test_serve_rejects_synthetic() {
        let parsed = Args::try_parse_from([
            "merit-scan",
            "serve",
            "--video-root",
            "videos",
            "--output-root",
            "out",
            "--synthetic",
        ]);
        assert!(parsed.is_err());

        let args = Args::try_parse_from([
            "merit-scan",
            "serve",
            "--video-root",
            "videos",
            "--output-root",
            "out",
        ])
        .unwrap();
        assert!(matches!(args.command, Command::Serve(_)));
    }
}
