use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::config::TtsBackend;
use crate::error::{PipelineError, Result};

const ELEVEN_LABS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";

/// Speech waveform written by a synthesizer. The caller owns the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioAsset {
    pub path: PathBuf,
}

#[async_trait]
pub trait NarrationSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    /// File extension of the audio this backend writes.
    fn extension(&self) -> &str;

    async fn synthesize(&self, text: &str, dest: &Path) -> Result<AudioAsset>;
}

pub fn from_backend(backend: &TtsBackend, client: reqwest::Client) -> Box<dyn NarrationSynthesizer> {
    match backend {
        TtsBackend::ElevenLabs {
            api_key,
            voice_id,
            model_id,
        } => Box::new(ElevenLabs::new(client, api_key, voice_id, model_id)),
        TtsBackend::Piper { model } => Box::new(Piper::new(model.clone())),
    }
}

/// Collapses whitespace so the voice does not pause on layout artefacts.
pub fn prepare_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

pub struct ElevenLabs {
    client: reqwest::Client,
    api_key: String,
    voice_id: String,
    model_id: String,
}

impl ElevenLabs {
    pub fn new(client: reqwest::Client, api_key: &str, voice_id: &str, model_id: &str) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            voice_id: voice_id.to_string(),
            model_id: model_id.to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/{}", ELEVEN_LABS_URL, self.voice_id)
    }
}

#[async_trait]
impl NarrationSynthesizer for ElevenLabs {
    fn name(&self) -> &str {
        "ElevenLabs"
    }

    fn extension(&self) -> &str {
        "mp3"
    }

    async fn synthesize(&self, text: &str, dest: &Path) -> Result<AudioAsset> {
        if self.api_key.trim().is_empty() {
            return Err(PipelineError::config("ElevenLabs API key is empty"));
        }
        let text = prepare_text(text);
        debug!("Requesting ElevenLabs narration ({} chars)", text.len());
        let res = self
            .client
            .post(self.endpoint())
            .header("xi-api-key", &self.api_key)
            .json(&SpeechRequest {
                text: &text,
                model_id: &self.model_id,
            })
            .send()
            .await
            .map_err(|e| PipelineError::upstream("ElevenLabs", e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res
                .text()
                .await
                .unwrap_or_else(|e| format!("<unreadable body: {}>", e));
            error!("ElevenLabs returned {}: {}", status, body);
            return Err(PipelineError::upstream(
                "ElevenLabs",
                format!("status {}: {}", status, body.trim()),
            ));
        }
        let audio = res
            .bytes()
            .await
            .map_err(|e| PipelineError::upstream("ElevenLabs", e.to_string()))?;
        tokio::fs::write(dest, &audio).await?;
        info!("Narration written to {} ({} bytes)", dest.display(), audio.len());
        Ok(AudioAsset {
            path: dest.to_path_buf(),
        })
    }
}

/// Local Piper voice, text on stdin, WAV out.
pub struct Piper {
    model: PathBuf,
}

impl Piper {
    pub fn new(model: PathBuf) -> Self {
        Self { model }
    }
}

#[async_trait]
impl NarrationSynthesizer for Piper {
    fn name(&self) -> &str {
        "Piper"
    }

    fn extension(&self) -> &str {
        "wav"
    }

    async fn synthesize(&self, text: &str, dest: &Path) -> Result<AudioAsset> {
        let mut child = Command::new("piper")
            .arg("--model")
            .arg(&self.model)
            .arg("--output_file")
            .arg(dest)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::upstream("Piper", format!("failed to spawn piper: {}", e)))?;

        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| PipelineError::upstream("Piper", "failed to open stdin"))?;
            stdin.write_all(prepare_text(text).as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            error!("Piper TTS command failed for {}", dest.display());
            return Err(PipelineError::upstream(
                "Piper",
                format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        info!("Piper narration written to {}", dest.display());
        Ok(AudioAsset {
            path: dest.to_path_buf(),
        })
    }
}
