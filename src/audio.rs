use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::{debug, warn};

use crate::align::DEFAULT_SEGMENT_SECONDS;
use crate::error::{PipelineError, Result};

pub fn wav_duration_seconds(path: &Path) -> Result<f64> {
    let reader = WavReader::open(path)
        .map_err(|e| PipelineError::Io(std::io::Error::other(e.to_string())))?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(PipelineError::Io(std::io::Error::other(format!(
            "invalid WAV header in {}",
            path.display()
        ))));
    }
    let samples = reader.len();
    let frames = samples as f64 / spec.channels as f64;
    Ok(frames / spec.sample_rate as f64)
}

/// Sample rate every narration is normalised to.
pub const NARRATION_SAMPLE_RATE: u32 = 44_100;

/// Writes `seconds` of mono 16-bit silence at the narration sample rate.
pub fn write_silence(path: &Path, seconds: f64) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: NARRATION_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let to_io = |e: hound::Error| PipelineError::Io(std::io::Error::other(e.to_string()));
    let frames = (seconds.max(0.0) * f64::from(NARRATION_SAMPLE_RATE)).round() as u64;
    let mut writer = WavWriter::create(path, spec).map_err(to_io)?;
    for _ in 0..frames {
        writer.write_sample(0i16).map_err(to_io)?;
    }
    writer.finalize().map_err(to_io)?;
    debug!("Wrote {:.2}s of silence to {}", seconds, path.display());
    Ok(())
}

/// Narration length, degrading to a fixed default when the file is unreadable.
pub fn duration_or_default(path: &Path) -> f64 {
    match wav_duration_seconds(path) {
        Ok(d) if d.is_finite() && d > 0.0 => d,
        Ok(d) => {
            warn!(
                "Narration {} has unusable duration {:.3}s; using {:.1}s",
                path.display(),
                d,
                DEFAULT_SEGMENT_SECONDS
            );
            DEFAULT_SEGMENT_SECONDS
        }
        Err(e) => {
            warn!(
                "Could not read duration of {}: {}; using {:.1}s",
                path.display(),
                e,
                DEFAULT_SEGMENT_SECONDS
            );
            DEFAULT_SEGMENT_SECONDS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fixture(path: &Path, sample_rate: u32, channels: u16, frames: u32) {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for _ in 0..frames * channels as u32 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn measures_mono_and_stereo_wavs() {
        let dir = tempfile::tempdir().unwrap();
        let mono = dir.path().join("mono.wav");
        let stereo = dir.path().join("stereo.wav");
        write_fixture(&mono, 16_000, 1, 32_000);
        write_fixture(&stereo, 44_100, 2, 66_150);
        assert!((wav_duration_seconds(&mono).unwrap() - 2.0).abs() < 1e-9);
        assert!((wav_duration_seconds(&stereo).unwrap() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn unreadable_audio_uses_default_duration() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.wav");
        std::fs::write(&bogus, b"not a wav").unwrap();
        assert_eq!(duration_or_default(&bogus), DEFAULT_SEGMENT_SECONDS);
        assert_eq!(
            duration_or_default(&dir.path().join("missing.wav")),
            DEFAULT_SEGMENT_SECONDS
        );
    }

    #[test]
    fn empty_wav_uses_default_duration() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.wav");
        write_fixture(&empty, 22_050, 1, 0);
        assert_eq!(duration_or_default(&empty), DEFAULT_SEGMENT_SECONDS);
    }

    #[test]
    fn silence_has_requested_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice_000.wav");
        write_silence(&path, DEFAULT_SEGMENT_SECONDS).unwrap();
        let measured = wav_duration_seconds(&path).unwrap();
        assert!((measured - DEFAULT_SEGMENT_SECONDS).abs() < 1e-9);
        assert_eq!(duration_or_default(&path), measured);
    }
}
