mod args;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use comicvideo::align::{Aligner, WhisperModel};
use comicvideo::config::{
    CaptionConfig, ColorScheme, TtsBackend, VideoConfig, WhisperConfig,
};
use comicvideo::images::HttpImageFetcher;
use comicvideo::script::Script;
use comicvideo::tts::{self, NarrationSynthesizer};
use comicvideo::VideoAssembler;

use crate::args::{Args, TtsChoice};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("Starting comic video generation pipeline");

    let script = Script::load(&args.script)
        .with_context(|| format!("failed to load script {}", args.script.display()))?;
    let output = args
        .out
        .clone()
        .or_else(|| script.output_filename.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("output.mp4"));

    let config = VideoConfig {
        subtitle_style: args.resolve_subtitle_style(script.subtitle_style.as_deref()),
        width: args.width,
        height: args.height,
        fps: args.fps,
        captions: CaptionConfig {
            colors: ColorScheme {
                text: args.text_color,
                highlight: args.highlight_color,
                shadow: args.shadow_color,
            },
            font_path: args.font.clone(),
            font_scale: args.font_scale,
            window_words: args.window_words,
            ..CaptionConfig::default()
        },
        narration_concurrency: args.narration_concurrency,
        work_dir: args.work_dir.clone(),
        keep_temp: args.keep_temp,
    };
    config.validate()?;
    info!(
        "Rendering {} segments at {}x{}@{} with {:?} subtitles",
        script.segments.len(),
        config.width,
        config.height,
        config.fps,
        config.subtitle_style
    );

    let backend = match args.tts {
        TtsChoice::Elevenlabs => TtsBackend::eleven_labs_from_env(&args.voice_id, &args.tts_model)?,
        TtsChoice::Piper => {
            if !args.piper_model.exists() {
                anyhow::bail!("Piper model not found: {}", args.piper_model.display());
            }
            TtsBackend::Piper {
                model: args.piper_model.clone(),
            }
        }
    };

    let aligner: Option<Arc<dyn Aligner>> = match &args.whisper_model {
        Some(model) => Some(Arc::new(WhisperModel::new(WhisperConfig {
            binary: args.whisper_bin.clone(),
            model: model.clone(),
            language: args.language.clone(),
        })?)),
        None => {
            info!("No whisper model given; word timing will be estimated");
            None
        }
    };

    let client = reqwest::Client::new();
    let synthesizer: Arc<dyn NarrationSynthesizer> = Arc::from(tts::from_backend(&backend, client.clone()));
    info!("Narration backend: {}", synthesizer.name());
    let fetcher = Arc::new(HttpImageFetcher::new(client));
    let assembler = VideoAssembler::new(config, synthesizer, fetcher, aligner);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let report = assembler.assemble(&script.segments, &output, &cancel).await?;
    info!(
        "Process complete: {} ({:.2}s, {} captioned words)",
        report.output.display(),
        report.duration,
        report.word_count
    );
    Ok(())
}
