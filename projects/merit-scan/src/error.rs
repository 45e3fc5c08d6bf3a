// Error taxonomy for the sampling and detection pipeline.
//
// Only `MediaDecode` is fatal to a run. Detection failures are reported per
// frame and the frame passes through unenriched.

use thiserror::Error;

/// Failure of a single classification call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("detection endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unparseable detection response: {0}")]
    Parse(String),

    #[error("frame image cannot be submitted: {0}")]
    InvalidFrame(String),
}

impl DetectionError {
    /// True for failures raised below the HTTP payload (network, non-2xx status).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Status { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("media decode error: {0}")]
    MediaDecode(String),

    #[error("detection error: {0}")]
    Detection(#[from] DetectionError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMedia(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
