use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use comicvideo::config::{DEFAULT_TTS_MODEL, DEFAULT_VOICE_ID, Rgb, SubtitleStyle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TtsChoice {
    Elevenlabs,
    Piper,
}

#[derive(Parser, Debug)]
#[clap(about = "Turn narrated comic panels into a captioned video")]
pub struct Args {
    /// JSON file with `texts` + `image_urls` or `segments`.
    #[clap(long)]
    pub script: PathBuf,

    /// Defaults to the script's `output_filename`, then `output.mp4`.
    #[clap(long)]
    pub out: Option<PathBuf>,

    /// `captions_ai` for word-highlight captions, anything else for SRT burn-in.
    /// Falls back to the script's style, then `captions_ai`.
    #[clap(long)]
    pub subtitle_style: Option<String>,

    #[clap(long, default_value_t = 1080)]
    pub width: u32,

    #[clap(long, default_value_t = 1920)]
    pub height: u32,

    #[clap(long, default_value_t = 24)]
    pub fps: u32,

    #[clap(long)]
    pub font: Option<PathBuf>,

    #[clap(long, default_value_t = 0.05)]
    pub font_scale: f32,

    #[clap(long, default_value_t = 8)]
    pub window_words: usize,

    #[clap(long, default_value = "255,255,255")]
    pub text_color: Rgb,

    #[clap(long, default_value = "255,230,0")]
    pub highlight_color: Rgb,

    #[clap(long, default_value = "0,0,0")]
    pub shadow_color: Rgb,

    #[clap(long, value_enum, default_value_t = TtsChoice::Elevenlabs)]
    pub tts: TtsChoice,

    #[clap(long, default_value = DEFAULT_VOICE_ID)]
    pub voice_id: String,

    #[clap(long, default_value = DEFAULT_TTS_MODEL)]
    pub tts_model: String,

    #[clap(long, default_value = "./tts/en_US-hfc_male-medium.onnx")]
    pub piper_model: PathBuf,

    /// ggml model for whisper.cpp; word timing is estimated without it.
    #[clap(long)]
    pub whisper_model: Option<PathBuf>,

    #[clap(long, default_value = "whisper-cli")]
    pub whisper_bin: String,

    #[clap(long, default_value = "en")]
    pub language: String,

    #[clap(long, default_value_t = 1)]
    pub narration_concurrency: usize,

    #[clap(long)]
    pub work_dir: Option<PathBuf>,

    #[clap(long)]
    pub keep_temp: bool,

    #[clap(long, short)]
    pub verbose: bool,
}

impl Args {
    /// An explicit flag wins over the script, which wins over `captions_ai`.
    pub fn resolve_subtitle_style(&self, script_style: Option<&str>) -> SubtitleStyle {
        let name = self
            .subtitle_style
            .as_deref()
            .or(script_style)
            .unwrap_or("captions_ai");
        SubtitleStyle::from_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_vertical_video() {
        let args = Args::parse_from(["comicvideo", "--script", "s.json"]);
        assert_eq!((args.width, args.height, args.fps), (1080, 1920, 24));
        assert!(args.subtitle_style.is_none());
        assert_eq!(args.tts, TtsChoice::Elevenlabs);
        assert_eq!(args.highlight_color, Rgb(255, 230, 0));
        assert!(args.out.is_none());
        assert!(args.whisper_model.is_none());
    }

    #[test]
    fn parses_overrides() {
        let args = Args::parse_from([
            "comicvideo",
            "--script",
            "s.json",
            "--tts",
            "piper",
            "--text-color",
            "10,20,30",
            "--narration-concurrency",
            "3",
            "--keep-temp",
            "--subtitle-style",
            "modern",
        ]);
        assert_eq!(args.tts, TtsChoice::Piper);
        assert_eq!(args.text_color, Rgb(10, 20, 30));
        assert_eq!(args.narration_concurrency, 3);
        assert!(args.keep_temp);
        assert_eq!(args.subtitle_style.as_deref(), Some("modern"));
    }

    #[test]
    fn explicit_style_flag_beats_the_script() {
        let flagged = Args::parse_from([
            "comicvideo",
            "--script",
            "s.json",
            "--subtitle-style",
            "captions_ai",
        ]);
        assert_eq!(flagged.resolve_subtitle_style(Some("modern")), SubtitleStyle::Dynamic);

        let bare = Args::parse_from(["comicvideo", "--script", "s.json"]);
        assert_eq!(bare.resolve_subtitle_style(Some("modern")), SubtitleStyle::StaticSrt);
        assert_eq!(bare.resolve_subtitle_style(None), SubtitleStyle::Dynamic);
    }
}
