use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::config::WhisperConfig;
use crate::error::{MediaStage, PipelineError, Result};
use crate::media;

/// Used when a narration's duration cannot be read.
pub const DEFAULT_SEGMENT_SECONDS: f64 = 5.0;
const MIN_WORD_SECONDS: f64 = 0.01;

static SPECIAL_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[_[A-Z0-9_]*\]$").expect("valid special token regex"));
static WORD_CHAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w").expect("valid word char regex"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTimestamp {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

impl WordTimestamp {
    pub fn new(word: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            word: word.into(),
            start,
            end,
        }
    }

    pub fn contains(&self, t: f64) -> bool {
        self.start <= t && t <= self.end
    }

    pub fn shifted(&self, offset: f64) -> Self {
        Self {
            word: self.word.clone(),
            start: self.start + offset,
            end: self.end + offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlignmentResult {
    Aligned(Vec<WordTimestamp>),
    Failed(String),
}

/// Word-level timing for a narration whose text is known.
#[async_trait]
pub trait Aligner: Send + Sync {
    fn name(&self) -> &str;

    async fn align(&self, audio: &Path, reference_text: &str) -> AlignmentResult;
}

/// Proportional word timing used when forced alignment is unavailable.
///
/// Each word gets `average * (len / 4 + 0.5)` seconds, capped at twice the
/// average; if the provisional total overshoots `total_duration` every word is
/// scaled down so the sequence never runs past the narration.
pub fn estimate(reference_text: &str, total_duration: f64) -> Vec<WordTimestamp> {
    let words: Vec<&str> = reference_text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    if !total_duration.is_finite() || total_duration <= 0.0 {
        warn!(
            "Cannot estimate timing for {} words over {:.3}s",
            words.len(),
            total_duration
        );
        return Vec::new();
    }

    let average = total_duration / words.len() as f64;
    let provisional: Vec<f64> = words
        .iter()
        .map(|w| (average * (w.chars().count() as f64 / 4.0 + 0.5)).min(average * 2.0))
        .collect();
    let sum: f64 = provisional.iter().sum();
    let scale = if sum > total_duration {
        total_duration / sum
    } else {
        1.0
    };

    let mut current = 0.0;
    let mut out = Vec::with_capacity(words.len());
    for (word, duration) in words.iter().zip(provisional) {
        let end = (current + duration * scale).min(total_duration);
        out.push(WordTimestamp::new(*word, current, end));
        current = end;
    }
    out
}

/// Runs the aligner if there is one and falls back to [`estimate`] on failure.
pub async fn resolve_words(
    aligner: Option<&dyn Aligner>,
    audio: &Path,
    reference_text: &str,
    duration: f64,
) -> Vec<WordTimestamp> {
    if reference_text.split_whitespace().next().is_none() {
        return Vec::new();
    }
    let Some(aligner) = aligner else {
        debug!("No speech model configured, estimating word timing");
        return estimate(reference_text, duration);
    };
    match aligner.align(audio, reference_text).await {
        AlignmentResult::Aligned(words) => {
            debug!("{} aligned {} words", aligner.name(), words.len());
            words
        }
        AlignmentResult::Failed(reason) => {
            let err = PipelineError::Alignment(reason);
            warn!("{}; falling back to estimated timestamps", err);
            estimate(reference_text, duration)
        }
    }
}

struct ResolvedModel {
    binary: PathBuf,
}

/// Handle on a whisper.cpp model.
///
/// Built once by the caller and shared by reference. The binary is resolved on
/// first use and cached; transcriptions are serialized through one lock.
pub struct WhisperModel {
    config: WhisperConfig,
    resolved: OnceCell<ResolvedModel>,
    lock: Mutex<()>,
}

impl WhisperModel {
    pub fn new(config: WhisperConfig) -> Result<Self> {
        if !config.model.exists() {
            return Err(PipelineError::config(format!(
                "whisper model not found: {}",
                config.model.display()
            )));
        }
        Ok(Self {
            config,
            resolved: OnceCell::new(),
            lock: Mutex::new(()),
        })
    }

    async fn resolve(&self) -> Result<&ResolvedModel> {
        self.resolved
            .get_or_try_init(|| async {
                let binary = which::which(&self.config.binary).map_err(|e| {
                    PipelineError::config(format!(
                        "whisper binary '{}' not found: {}",
                        self.config.binary, e
                    ))
                })?;
                info!(
                    "Resolved whisper binary {} for model {} (weights load per transcription)",
                    binary.display(),
                    self.config.model.display()
                );
                Ok::<_, PipelineError>(ResolvedModel { binary })
            })
            .await
    }

    async fn transcribe(&self, audio: &Path) -> Result<Vec<WordTimestamp>> {
        let resolved = self.resolve().await?;
        let _guard = self.lock.lock().await;

        let wav = audio.with_extension("whisper.wav");
        let prefix = audio.with_extension("whisper");
        let mut json_path = prefix.clone().into_os_string();
        json_path.push(".json");
        let json_path = PathBuf::from(json_path);

        let mut convert = media::ffmpeg_command();
        convert
            .arg("-i")
            .arg(audio)
            .args(["-ar", "16000", "-ac", "1", "-c:a", "pcm_s16le"])
            .arg(&wav);
        media::run(MediaStage::NormalizeAudio, &mut convert).await?;

        let output = Command::new(&resolved.binary)
            .arg("-m")
            .arg(&self.config.model)
            .arg("-f")
            .arg(&wav)
            .arg("-l")
            .arg(&self.config.language)
            .arg("--output-json-full")
            .arg("--output-file")
            .arg(&prefix)
            .arg("--no-prints")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let _ = tokio::fs::remove_file(&wav).await;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Alignment(format!(
                "whisper exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let raw = tokio::fs::read_to_string(&json_path).await?;
        let _ = tokio::fs::remove_file(&json_path).await;
        parse_whisper_json(&raw)
    }
}

#[async_trait]
impl Aligner for WhisperModel {
    fn name(&self) -> &str {
        "whisper.cpp"
    }

    async fn align(&self, audio: &Path, reference_text: &str) -> AlignmentResult {
        match self.transcribe(audio).await {
            Ok(words) if words.is_empty() => AlignmentResult::Failed(format!(
                "no words recognised for {} reference words",
                reference_text.split_whitespace().count()
            )),
            Ok(words) => AlignmentResult::Aligned(words),
            Err(e) => AlignmentResult::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WhisperDocument {
    #[serde(default)]
    transcription: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    tokens: Vec<WhisperToken>,
}

#[derive(Debug, Deserialize)]
struct WhisperToken {
    text: String,
    offsets: WhisperOffsets,
}

#[derive(Debug, Deserialize)]
struct WhisperOffsets {
    from: f64,
    to: f64,
}

/// Flattens whisper.cpp `--output-json-full` into words.
///
/// Tokens without a leading space continue the previous word.
pub fn parse_whisper_json(raw: &str) -> Result<Vec<WordTimestamp>> {
    let doc: WhisperDocument = serde_json::from_str(raw)?;
    let mut words: Vec<WordTimestamp> = Vec::new();

    for token in doc.transcription.iter().flat_map(|s| s.tokens.iter()) {
        let trimmed = token.text.trim();
        if trimmed.is_empty() || SPECIAL_TOKEN.is_match(trimmed) {
            continue;
        }
        let start = token.offsets.from / 1000.0;
        let end = token.offsets.to / 1000.0;
        let continues = !token.text.starts_with(char::is_whitespace);
        match words.last_mut() {
            Some(last) if continues => {
                last.word.push_str(trimmed);
                last.end = last.end.max(end);
            }
            _ => words.push(WordTimestamp::new(trimmed, start, end)),
        }
    }

    words.retain(|w| WORD_CHAR.is_match(&w.word));
    let mut floor = 0.0_f64;
    for w in &mut words {
        w.start = w.start.max(floor);
        if w.end <= w.start {
            w.end = w.start + MIN_WORD_SECONDS;
        }
        floor = w.start;
    }
    Ok(words)
}
