use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{self, Stdio};

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::audio::NARRATION_SAMPLE_RATE;
use crate::error::{MediaStage, PipelineError, Result};

const STDERR_TAIL: usize = 600;

pub const FFMPEG: &str = "ffmpeg";
pub const FFPROBE: &str = "ffprobe";

/// `ffmpeg` with the flags every stage shares. Killed if the future is dropped.
pub fn ffmpeg_command() -> Command {
    let mut cmd = Command::new(FFMPEG);
    cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
        .stdin(Stdio::null())
        .kill_on_drop(true);
    cmd
}

fn spawn_error(program: &str, e: std::io::Error) -> PipelineError {
    if e.kind() == ErrorKind::NotFound {
        PipelineError::config(format!(
            "{} was not found on PATH; install it and verify `{} -version` works",
            program, program
        ))
    } else {
        PipelineError::Io(e)
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(STDERR_TAIL);
    text.chars().skip(skip).collect()
}

/// Runs a prepared command, mapping a non-zero exit to a stage error.
pub async fn run(stage: MediaStage, cmd: &mut Command) -> Result<()> {
    debug!("Running {} stage: {:?}", stage, cmd.as_std());
    let output = cmd
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| spawn_error(FFMPEG, e))?;
    if !output.status.success() {
        return Err(PipelineError::media(
            stage,
            format!("{}: {}", output.status, stderr_tail(&output.stderr)),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

#[derive(Debug, Deserialize)]
struct StreamList {
    #[serde(default)]
    streams: Vec<StreamEntry>,
}

#[derive(Debug, Deserialize)]
struct StreamEntry {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

pub async fn read_video_info(path: &Path) -> Result<VideoInfo> {
    let output = Command::new(FFPROBE)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate",
            "-of",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| spawn_error(FFPROBE, e))?;
    if !output.status.success() {
        return Err(PipelineError::media(
            MediaStage::Inspect,
            stderr_tail(&output.stderr),
        ));
    }
    parse_stream_info(&String::from_utf8_lossy(&output.stdout))
}

fn parse_stream_info(raw: &str) -> Result<VideoInfo> {
    let parsed: StreamList = serde_json::from_str(raw)?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::media(MediaStage::Inspect, "no video stream"))?;
    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        return Err(PipelineError::media(MediaStage::Inspect, "missing frame size"));
    };
    let fps = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .ok_or_else(|| PipelineError::media(MediaStage::Inspect, "missing frame rate"))?;
    Ok(VideoInfo { width, height, fps })
}

/// Parses `30000/1001` or `24`.
fn parse_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num.trim().parse::<f64>().ok()? / den
        }
        None => raw.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Escapes a path for use inside an ffmpeg filter argument.
pub fn escape_filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('=', "\\=")
        .replace('\'', "\\'")
}

/// Concat demuxer list; paths are absolute so ffmpeg's working dir does not matter.
pub fn write_concat_list(list: &Path, files: &[impl AsRef<Path>]) -> Result<()> {
    let mut f = BufWriter::new(File::create(list)?);
    for p in files {
        let abs = std::path::absolute(p.as_ref())?;
        let escaped = abs.to_string_lossy().replace('\'', "'\\''");
        writeln!(f, "file '{}'", escaped)?;
    }
    f.flush()?;
    Ok(())
}

/// Any narration format to 44.1 kHz mono PCM.
pub async fn normalize_audio(input: &Path, output: &Path) -> Result<()> {
    let mut cmd = ffmpeg_command();
    cmd.arg("-i")
        .arg(input)
        .args(["-vn", "-ar"])
        .arg(NARRATION_SAMPLE_RATE.to_string())
        .args(["-ac", "1", "-c:a", "pcm_s16le"])
        .arg(output);
    run(MediaStage::NormalizeAudio, &mut cmd).await
}

pub async fn concat_audio(list: &Path, output: &Path) -> Result<()> {
    let mut copy = ffmpeg_command();
    copy.args(["-f", "concat", "-safe", "0", "-i"])
        .arg(list)
        .args(["-c", "copy"])
        .arg(output);
    if let Err(e) = run(MediaStage::ConcatAudio, &mut copy).await {
        warn!("ffmpeg concat with copy failed ({}); retrying with re-encode", e);
        let mut encode = ffmpeg_command();
        encode
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(list)
            .args(["-c:a", "pcm_s16le"])
            .arg(output);
        run(MediaStage::ConcatAudio, &mut encode).await?;
    }
    Ok(())
}

/// Holds one still image for exactly `frames` frames, letterboxed to the output size.
pub async fn image_clip(
    image: &Path,
    frames: u64,
    width: u32,
    height: u32,
    fps: u32,
    output: &Path,
) -> Result<()> {
    let filter = format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,format=yuv420p",
        w = width,
        h = height
    );
    let mut cmd = ffmpeg_command();
    cmd.args(["-loop", "1", "-framerate"])
        .arg(fps.to_string())
        .arg("-i")
        .arg(image)
        .arg("-vf")
        .arg(filter)
        .arg("-r")
        .arg(fps.to_string())
        .arg("-frames:v")
        .arg(frames.to_string())
        .args(["-c:v", "libx264", "-pix_fmt", "yuv420p", "-an"])
        .arg(output);
    run(MediaStage::ImageClip, &mut cmd).await
}

pub async fn concat_clips(list: &Path, output: &Path) -> Result<()> {
    let mut cmd = ffmpeg_command();
    cmd.args(["-f", "concat", "-safe", "0", "-i"])
        .arg(list)
        .args(["-c", "copy"])
        .arg(output);
    run(MediaStage::ConcatClips, &mut cmd).await
}

/// Silent video + narration track into the base video.
pub async fn mux_audio(video: &Path, audio: &Path, output: &Path) -> Result<()> {
    let mut cmd = ffmpeg_command();
    cmd.arg("-i")
        .arg(video)
        .arg("-i")
        .arg(audio)
        .args([
            "-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy", "-c:a", "aac",
        ])
        .arg(output);
    run(MediaStage::MuxBaseAudio, &mut cmd).await
}

pub async fn burn_subtitles(video: &Path, srt: &Path, font_size: u32, output: &Path) -> Result<()> {
    let filter = format!(
        "subtitles=filename='{}':charenc=UTF-8:force_style='Fontsize={},OutlineColour=&H000000&,Outline=3,Shadow=0'",
        escape_filter_path(srt),
        font_size
    );
    let mut cmd = ffmpeg_command();
    cmd.arg("-i")
        .arg(video)
        .arg("-vf")
        .arg(filter)
        .args(["-c:v", "libx264", "-pix_fmt", "yuv420p", "-an"])
        .arg(output);
    run(MediaStage::BurnSubtitles, &mut cmd).await
}

/// Captioned silent video + the base video's audio.
pub async fn remux_audio(video: &Path, audio_source: &Path, output: &Path) -> Result<()> {
    let mut cmd = ffmpeg_command();
    cmd.arg("-i")
        .arg(video)
        .arg("-i")
        .arg(audio_source)
        .args([
            "-map",
            "0:v:0",
            "-map",
            "1:a:0",
            "-c:v",
            "copy",
            "-c:a",
            "copy",
            "-movflags",
            "+faststart",
        ])
        .arg(output);
    run(MediaStage::RemuxFinalAudio, &mut cmd).await
}

/// Moves the finished file to the caller's path.
pub async fn publish(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    copy_into_place(from, to).await
}

/// Copies next to `to` first so a failed copy never leaves a truncated file at `to`.
async fn copy_into_place(from: &Path, to: &Path) -> Result<()> {
    let mut part = to.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);
    let copied = async {
        tokio::fs::copy(from, &part).await?;
        tokio::fs::rename(&part, to).await
    }
    .await;
    if let Err(e) = copied {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(PipelineError::media(MediaStage::Publish, e.to_string()));
    }
    Ok(())
}

/// Pull side of a packed `rgb24` frame stream.
pub trait FrameSource {
    /// Fills `buf` with the next frame; `false` at end of stream.
    fn read_frame(&mut self, buf: &mut Vec<u8>) -> Result<bool>;
}

/// Push side of a packed `rgb24` frame stream.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;
}

/// Decodes a video into packed `rgb24` frames on ffmpeg stdout.
pub struct FrameReader {
    child: process::Child,
    stdout: BufReader<process::ChildStdout>,
    frame_size: usize,
}

impl FrameReader {
    pub fn spawn(input: &Path, info: VideoInfo) -> Result<Self> {
        let frame_size = frame_bytes(info.width, info.height)?;
        let mut child = process::Command::new(FFMPEG)
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(input)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| spawn_error(FFMPEG, e))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            PipelineError::media(MediaStage::DecodeFrames, "failed to capture ffmpeg stdout")
        })?;
        Ok(Self {
            child,
            stdout: BufReader::with_capacity(frame_size, stdout),
            frame_size,
        })
    }

    pub fn finish(mut self) -> Result<()> {
        let status = self.child.wait()?;
        if !status.success() {
            return Err(PipelineError::media(
                MediaStage::DecodeFrames,
                format!("ffmpeg decoder exited with {}", status),
            ));
        }
        Ok(())
    }
}

impl FrameSource for FrameReader {
    fn read_frame(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        buf.resize(self.frame_size, 0);
        let mut filled = 0;
        while filled < self.frame_size {
            let n = self.stdout.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        match filled {
            0 => Ok(false),
            n if n == self.frame_size => Ok(true),
            n => Err(PipelineError::media(
                MediaStage::DecodeFrames,
                format!("truncated frame: {} of {} bytes", n, self.frame_size),
            )),
        }
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Encodes packed `rgb24` frames written to ffmpeg stdin.
pub struct FrameWriter {
    child: process::Child,
    stdin: Option<BufWriter<process::ChildStdin>>,
    frame_size: usize,
}

impl FrameWriter {
    pub fn spawn(output: &Path, info: VideoInfo) -> Result<Self> {
        let frame_size = frame_bytes(info.width, info.height)?;
        let mut child = process::Command::new(FFMPEG)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-s:v"])
            .arg(format!("{}x{}", info.width, info.height))
            .arg("-r")
            .arg(format!("{}", info.fps))
            .args(["-i", "-", "-an"])
            .args(["-c:v", "libx264", "-preset", "medium", "-crf", "18"])
            .args(["-pix_fmt", "yuv420p"])
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| spawn_error(FFMPEG, e))?;
        let stdin = child.stdin.take().ok_or_else(|| {
            PipelineError::media(MediaStage::EncodeFrames, "failed to capture ffmpeg stdin")
        })?;
        Ok(Self {
            child,
            stdin: Some(BufWriter::with_capacity(frame_size, stdin)),
            frame_size,
        })
    }

    pub fn finish(mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush()?;
        }
        let status = self.child.wait()?;
        if !status.success() {
            return Err(PipelineError::media(
                MediaStage::EncodeFrames,
                format!("ffmpeg encoder exited with {}", status),
            ));
        }
        Ok(())
    }
}

impl FrameSink for FrameWriter {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() != self.frame_size {
            return Err(PipelineError::media(
                MediaStage::EncodeFrames,
                format!(
                    "frame size mismatch: expected {} bytes, got {}",
                    self.frame_size,
                    frame.len()
                ),
            ));
        }
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            PipelineError::media(MediaStage::EncodeFrames, "encoder input already closed")
        })?;
        stdin
            .write_all(frame)
            .map_err(|e| PipelineError::media(MediaStage::EncodeFrames, e.to_string()))
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn frame_bytes(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|px| px.checked_mul(3))
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            PipelineError::media(
                MediaStage::DecodeFrames,
                format!("invalid frame size {}x{}", width, height),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fractional_and_integer_rates() {
        assert_eq!(parse_rate("24/1"), Some(24.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("25"), Some(25.0));
        assert_eq!(parse_rate("0/0"), None);
    }

    #[test]
    fn parses_stream_info_json() {
        let raw = r#"{"programs":[],"streams":[{"width":1080,"height":1920,"r_frame_rate":"24/1"}]}"#;
        let info = parse_stream_info(raw).unwrap();
        assert_eq!(
            info,
            VideoInfo {
                width: 1080,
                height: 1920,
                fps: 24.0
            }
        );
        assert!(matches!(
            parse_stream_info(r#"{"streams":[]}"#),
            Err(PipelineError::MediaBackend {
                stage: MediaStage::Inspect,
                ..
            })
        ));
    }

    #[test]
    fn escapes_filter_paths() {
        assert_eq!(
            escape_filter_path(Path::new("C:\\tmp\\subs=1.srt")),
            "C\\:\\\\tmp\\\\subs\\=1.srt"
        );
    }

    #[test]
    fn concat_list_quotes_paths() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("files.txt");
        let part = dir.path().join("it's.wav");
        write_concat_list(&list, &[&part]).unwrap();
        let written = std::fs::read_to_string(&list).unwrap();
        assert!(written.starts_with("file '/"));
        assert!(written.trim_end().ends_with("it'\\''s.wav'"));
    }

    #[tokio::test]
    async fn copy_into_place_publishes_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("final.mp4");
        std::fs::write(&from, b"moov").unwrap();
        let to = dir.path().join("out").join("video.mp4");
        std::fs::create_dir_all(to.parent().unwrap()).unwrap();
        copy_into_place(&from, &to).await.unwrap();
        assert_eq!(std::fs::read(&to).unwrap(), b"moov");
        assert!(!dir.path().join("out").join("video.mp4.part").exists());
    }

    #[tokio::test]
    async fn failed_copy_leaves_nothing_at_destination() {
        let dir = tempfile::tempdir().unwrap();
        let to = dir.path().join("video.mp4");
        let err = copy_into_place(&dir.path().join("missing.mp4"), &to)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MediaBackend {
                stage: MediaStage::Publish,
                ..
            }
        ));
        assert!(!to.exists());
        assert!(!dir.path().join("video.mp4.part").exists());
    }

    #[test]
    fn rejects_zero_frame_size() {
        assert!(frame_bytes(0, 1080).is_err());
        assert_eq!(frame_bytes(4, 2).unwrap(), 24);
    }
}
