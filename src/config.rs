use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";
pub const DEFAULT_TTS_MODEL: &str = "eleven_monolingual_v1";
pub const API_KEY_VARS: [&str; 2] = ["ELEVEN_LAB_API_KEY", "ELEVENLABS_API_KEY"];

const SYSTEM_FONTS: [&str; 6] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial Bold.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:/Windows/Fonts/arialbd.ttf",
    "C:/Windows/Fonts/Arial.ttf",
];

/// How subtitles end up on the video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubtitleStyle {
    /// Per-frame rendering with the active word highlighted.
    Dynamic,
    /// One SRT cue per segment, burned in by the media backend.
    StaticSrt,
}

impl SubtitleStyle {
    /// `captions_ai` selects dynamic captions; anything else burns an SRT file.
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("captions_ai") {
            Self::Dynamic
        } else {
            Self::StaticSrt
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn with_alpha(self, alpha: u8) -> [u8; 4] {
        [self.0, self.1, self.2, alpha]
    }
}

impl FromStr for Rgb {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(format!("expected R,G,B but got '{}'", raw));
        }
        let mut channels = [0u8; 3];
        for (slot, part) in channels.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| format!("invalid color channel '{}' in '{}'", part, raw))?;
        }
        Ok(Rgb(channels[0], channels[1], channels[2]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorScheme {
    pub text: Rgb,
    pub highlight: Rgb,
    pub shadow: Rgb,
}

impl Default for ColorScheme {
    fn default() -> Self {
        Self {
            text: Rgb(255, 255, 255),
            highlight: Rgb(255, 230, 0),
            shadow: Rgb(0, 0, 0),
        }
    }
}

/// Caption look and feel shared by the compositor and the SRT burn-in.
#[derive(Debug, Clone)]
pub struct CaptionConfig {
    pub colors: ColorScheme,
    pub font_path: Option<PathBuf>,
    /// Font size as a fraction of the frame height.
    pub font_scale: f32,
    pub window_words: usize,
    pub word_spacing: u32,
    pub shadow_alpha: u8,
    pub glow_alpha: u8,
    pub glow_padding: u32,
    pub glow_radius: u32,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            colors: ColorScheme::default(),
            font_path: None,
            font_scale: 0.05,
            window_words: 8,
            word_spacing: 8,
            shadow_alpha: 100,
            glow_alpha: 60,
            glow_padding: 4,
            glow_radius: 8,
        }
    }
}

impl CaptionConfig {
    pub fn font_size(&self, frame_height: u32) -> f32 {
        (frame_height as f32 * self.font_scale).max(1.0)
    }

    /// Configured font, or the first system font that exists.
    pub fn resolve_font(&self) -> Result<PathBuf> {
        if let Some(path) = &self.font_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(PipelineError::config(format!(
                "font not found: {}",
                path.display()
            )));
        }
        SYSTEM_FONTS
            .iter()
            .map(Path::new)
            .find(|p| p.exists())
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                PipelineError::config("no usable system font found; pass --font <path.ttf>")
            })
    }
}

#[derive(Debug, Clone)]
pub enum TtsBackend {
    ElevenLabs {
        api_key: String,
        voice_id: String,
        model_id: String,
    },
    Piper {
        model: PathBuf,
    },
}

impl TtsBackend {
    /// Reads the ElevenLabs credential from the environment.
    pub fn eleven_labs_from_env(voice_id: &str, model_id: &str) -> Result<Self> {
        let api_key = API_KEY_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
            .ok_or_else(|| {
                PipelineError::config("set ELEVEN_LAB_API_KEY or ELEVENLABS_API_KEY")
            })?;
        Ok(Self::ElevenLabs {
            api_key,
            voice_id: voice_id.to_string(),
            model_id: model_id.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WhisperConfig {
    pub binary: String,
    pub model: PathBuf,
    pub language: String,
}

/// Everything the assembler needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub subtitle_style: SubtitleStyle,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub captions: CaptionConfig,
    pub narration_concurrency: usize,
    pub work_dir: Option<PathBuf>,
    pub keep_temp: bool,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            subtitle_style: SubtitleStyle::Dynamic,
            width: 1080,
            height: 1920,
            fps: 24,
            captions: CaptionConfig::default(),
            narration_concurrency: 1,
            work_dir: None,
            keep_temp: false,
        }
    }
}

impl VideoConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::config("output size must be non-zero"));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(PipelineError::config(format!(
                "output size {}x{} must be even for yuv420p",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(PipelineError::config("fps must be positive"));
        }
        if self.captions.window_words == 0 {
            return Err(PipelineError::config("caption window must hold at least one word"));
        }
        if !(self.captions.font_scale > 0.0 && self.captions.font_scale < 1.0) {
            return Err(PipelineError::config("font scale must be in (0, 1)"));
        }
        Ok(())
    }
}
