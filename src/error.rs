use std::fmt;

use thiserror::Error;

/// Media backend stage that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStage {
    Inspect,
    NormalizeAudio,
    ConcatAudio,
    ImageClip,
    ConcatClips,
    MuxBaseAudio,
    DecodeFrames,
    RenderCaptions,
    EncodeFrames,
    BurnSubtitles,
    RemuxFinalAudio,
    Publish,
}

impl MediaStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inspect => "inspect",
            Self::NormalizeAudio => "normalize-audio",
            Self::ConcatAudio => "concat-audio",
            Self::ImageClip => "image-clip",
            Self::ConcatClips => "concat-clips",
            Self::MuxBaseAudio => "mux-base-audio",
            Self::DecodeFrames => "decode-frames",
            Self::RenderCaptions => "render-captions",
            Self::EncodeFrames => "encode-frames",
            Self::BurnSubtitles => "burn-subtitles",
            Self::RemuxFinalAudio => "remux-final-audio",
            Self::Publish => "publish",
        }
    }
}

impl fmt::Display for MediaStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Narration or image service answered with a failure.
    #[error("{service} failed: {detail}")]
    UpstreamService { service: &'static str, detail: String },

    /// Forced alignment failed; recovered by the estimator and never returned from `assemble`.
    #[error("alignment failed: {0}")]
    Alignment(String),

    #[error("media backend failed at stage '{stage}': {detail}")]
    MediaBackend { stage: MediaStage, detail: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("video assembly cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn upstream(service: &'static str, detail: impl Into<String>) -> Self {
        Self::UpstreamService {
            service,
            detail: detail.into(),
        }
    }

    pub fn media(stage: MediaStage, detail: impl Into<String>) -> Self {
        Self::MediaBackend {
            stage,
            detail: detail.into(),
        }
    }

    pub fn config(detail: impl Into<String>) -> Self {
        Self::Configuration(detail.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
