use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::align::{self, Aligner, WordTimestamp};
use crate::audio;
use crate::compositor::{self, FontPainter};
use crate::config::{SubtitleStyle, VideoConfig};
use crate::error::{MediaStage, PipelineError, Result};
use crate::images::{self, ImageFetcher};
use crate::media;
use crate::script::SegmentSpec;
use crate::subtitle;
use crate::timeline::{GlobalTimeline, SegmentTiming};
use crate::tts::NarrationSynthesizer;
use crate::workspace::Workspace;

/// libass renders `Fontsize` against a 288-line script height.
const ASS_PLAY_RES_Y: f32 = 288.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    PerSegmentSynth,
    BuildTimeline,
    ConcatClips,
    MuxBaseAudio,
    RenderCaptions,
    BurnSrtSubtitles,
    RemuxFinalAudio,
    Cleanup,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::PerSegmentSynth => "PER_SEGMENT_SYNTH",
            Self::BuildTimeline => "BUILD_TIMELINE",
            Self::ConcatClips => "CONCAT_CLIPS",
            Self::MuxBaseAudio => "MUX_BASE_AUDIO",
            Self::RenderCaptions => "RENDER_CAPTIONS_PER_FRAME",
            Self::BurnSrtSubtitles => "BURN_SRT_SUBTITLES",
            Self::RemuxFinalAudio => "REMUX_FINAL_AUDIO",
            Self::Cleanup => "CLEANUP",
            Self::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// A narrated text with its image, resolved as the pipeline runs.
#[derive(Debug, Clone)]
pub struct Segment {
    pub index: usize,
    pub text: String,
    pub image_source: String,
    pub image: PathBuf,
    pub audio: PathBuf,
    pub duration: f64,
    /// Local time, before the timeline shifts them.
    pub words: Vec<WordTimestamp>,
}

#[derive(Debug, Clone)]
pub struct AssemblyReport {
    pub output: PathBuf,
    pub duration: f64,
    pub segment_count: usize,
    pub word_count: usize,
    pub stages: Vec<Stage>,
}

struct SegmentJob {
    index: usize,
    spec: SegmentSpec,
    image: PathBuf,
    raw_audio: PathBuf,
    audio: PathBuf,
}

struct StageLog {
    visited: Vec<Stage>,
}

impl StageLog {
    fn new() -> Self {
        Self {
            visited: vec![Stage::Init],
        }
    }

    fn enter(&mut self, stage: Stage) {
        info!("Stage {} -> {}", self.current(), stage);
        self.visited.push(stage);
    }

    fn current(&self) -> Stage {
        self.visited.last().copied().unwrap_or(Stage::Init)
    }
}

/// Races `fut` against cancellation.
async fn guarded<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        res = fut => res,
    }
}

/// Turns segments into one captioned video.
pub struct VideoAssembler {
    config: VideoConfig,
    synthesizer: Arc<dyn NarrationSynthesizer>,
    fetcher: Arc<dyn ImageFetcher>,
    aligner: Option<Arc<dyn Aligner>>,
}

impl VideoAssembler {
    pub fn new(
        config: VideoConfig,
        synthesizer: Arc<dyn NarrationSynthesizer>,
        fetcher: Arc<dyn ImageFetcher>,
        aligner: Option<Arc<dyn Aligner>>,
    ) -> Self {
        Self {
            config,
            synthesizer,
            fetcher,
            aligner,
        }
    }

    pub fn config(&self) -> &VideoConfig {
        &self.config
    }

    /// Runs the whole pipeline. Temp artifacts are released on every exit
    /// path and `output` is only written once the final remux succeeded.
    pub async fn assemble(
        &self,
        segments: &[SegmentSpec],
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<AssemblyReport> {
        self.config.validate()?;
        if segments.is_empty() {
            return Err(PipelineError::config("nothing to assemble: no segments"));
        }
        let mut workspace =
            Workspace::create(self.config.work_dir.as_deref(), self.config.keep_temp)?;
        let mut stages = StageLog::new();

        let result = self
            .run(&mut workspace, &mut stages, segments, output, cancel)
            .await;

        stages.enter(Stage::Cleanup);
        workspace.close();

        match result {
            Ok(mut report) => {
                stages.enter(Stage::Done);
                report.stages = stages.visited;
                info!(
                    "Video written to {} ({:.2}s, {} segments)",
                    report.output.display(),
                    report.duration,
                    report.segment_count
                );
                Ok(report)
            }
            Err(e) => {
                error!("Video assembly failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        workspace: &mut Workspace,
        stages: &mut StageLog,
        specs: &[SegmentSpec],
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<AssemblyReport> {
        let painter = match self.config.subtitle_style {
            SubtitleStyle::Dynamic => {
                let font = self.config.captions.resolve_font()?;
                let size = self.config.captions.font_size(self.config.height);
                info!("Using caption font {} at {:.0}px", font.display(), size);
                Some(FontPainter::load(&font, size)?)
            }
            SubtitleStyle::StaticSrt => None,
        };

        stages.enter(Stage::PerSegmentSynth);
        let jobs: Vec<SegmentJob> = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| SegmentJob {
                index,
                spec: spec.clone(),
                image: workspace.artifact(&format!(
                    "image_{:03}.{}",
                    index,
                    images::extension_hint(&spec.image)
                )),
                raw_audio: workspace.artifact(&format!(
                    "narration_{:03}.{}",
                    index,
                    self.synthesizer.extension()
                )),
                audio: workspace.artifact(&format!("voice_{:03}.wav", index)),
            })
            .collect();
        let total = jobs.len();
        let segments: Vec<Segment> = guarded(
            cancel,
            futures::stream::iter(jobs)
                .map(|job| self.prepare_segment(job, total))
                .buffered(self.config.narration_concurrency.max(1))
                .try_collect(),
        )
        .await?;

        stages.enter(Stage::BuildTimeline);
        let timings: Vec<SegmentTiming> = segments
            .iter()
            .map(|s| SegmentTiming {
                duration: s.duration,
                words: s.words.clone(),
            })
            .collect();
        let timeline = GlobalTimeline::build(&timings);
        info!(
            "Timeline: {:.2}s, {} words, boundaries {:?}",
            timeline.total_duration(),
            timeline.words().len(),
            timeline.boundaries()
        );

        stages.enter(Stage::ConcatClips);
        let mut clips = Vec::with_capacity(segments.len());
        for (segment, frames) in segments.iter().zip(timeline.frame_counts(self.config.fps)) {
            if frames == 0 {
                debug!(
                    "Segment {} ({}) is shorter than half a frame; no clip",
                    segment.index, segment.image_source
                );
                continue;
            }
            let clip = workspace.artifact(&format!("clip_{:03}.mp4", segment.index));
            debug!(
                "Building clip {} ({} frames, {:.2}s) from {}",
                segment.index,
                frames,
                segment.duration,
                segment.image_source
            );
            guarded(
                cancel,
                media::image_clip(
                    &segment.image,
                    frames,
                    self.config.width,
                    self.config.height,
                    self.config.fps,
                    &clip,
                ),
            )
            .await?;
            clips.push(clip);
        }
        if clips.is_empty() {
            return Err(PipelineError::media(
                MediaStage::ImageClip,
                format!(
                    "{:.3}s of narration is too short for one frame at {} fps",
                    timeline.total_duration(),
                    self.config.fps
                ),
            ));
        }
        let clip_list = workspace.artifact("clips.txt");
        media::write_concat_list(&clip_list, &clips)?;
        let silent = workspace.artifact("silent.mp4");
        guarded(cancel, media::concat_clips(&clip_list, &silent)).await?;

        let voices: Vec<&Path> = segments.iter().map(|s| s.audio.as_path()).collect();
        let voice_list = workspace.artifact("voices.txt");
        media::write_concat_list(&voice_list, &voices)?;
        let narration = workspace.artifact("narration.wav");
        guarded(cancel, media::concat_audio(&voice_list, &narration)).await?;

        stages.enter(Stage::MuxBaseAudio);
        let base = workspace.artifact("base.mp4");
        guarded(cancel, media::mux_audio(&silent, &narration, &base)).await?;

        let captioned = workspace.artifact("captioned.mp4");
        match painter {
            Some(painter) => {
                stages.enter(Stage::RenderCaptions);
                let info = guarded(cancel, media::read_video_info(&base)).await?;
                let input = base.clone();
                let out = captioned.clone();
                let words = timeline.words().to_vec();
                let style = self.config.captions.clone();
                let token = cancel.clone();
                tokio::task::spawn_blocking(move || {
                    compositor::caption_video(&input, &out, info, &words, &painter, &style, &token)
                })
                .await
                .map_err(|e| PipelineError::media(MediaStage::RenderCaptions, e.to_string()))??;
            }
            None => {
                stages.enter(Stage::BurnSrtSubtitles);
                let texts: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
                let srt = workspace.artifact("subtitles.srt");
                subtitle::write_srt(&srt, &subtitle::segment_cues(&timeline, &texts))?;
                let font_size = (self.config.captions.font_scale * ASS_PLAY_RES_Y).round() as u32;
                guarded(
                    cancel,
                    media::burn_subtitles(&base, &srt, font_size.max(1), &captioned),
                )
                .await?;
            }
        }

        stages.enter(Stage::RemuxFinalAudio);
        let final_video = workspace.artifact("final.mp4");
        guarded(cancel, media::remux_audio(&captioned, &base, &final_video)).await?;
        guarded(cancel, media::publish(&final_video, output)).await?;

        Ok(AssemblyReport {
            output: output.to_path_buf(),
            duration: timeline.total_duration(),
            segment_count: segments.len(),
            word_count: timeline.words().len(),
            stages: Vec::new(),
        })
    }

    /// Image, narration, duration and word timing for one segment.
    async fn prepare_segment(&self, job: SegmentJob, total: usize) -> Result<Segment> {
        let SegmentJob {
            index,
            spec,
            image,
            raw_audio,
            audio,
        } = job;
        info!(
            "Preparing segment {}/{} ({} chars)",
            index + 1,
            total,
            spec.text.len()
        );

        let image = self.fetcher.fetch(&spec.image, &image).await?;
        if spec.text.split_whitespace().next().is_none() {
            info!(
                "Segment {} has no text; holding {} for {:.1}s of silence",
                index, spec.image, align::DEFAULT_SEGMENT_SECONDS
            );
            audio::write_silence(&audio, align::DEFAULT_SEGMENT_SECONDS)?;
        } else {
            let asset = self.synthesizer.synthesize(&spec.text, &raw_audio).await?;
            media::normalize_audio(&asset.path, &audio).await?;
        }
        let duration = audio::duration_or_default(&audio);
        info!("Segment {} duration: {:.2} seconds", index, duration);

        let words = align::resolve_words(
            self.aligner.as_deref(),
            &audio,
            &spec.text,
            duration,
        )
        .await;
        debug!("Segment {} has {} timed words", index, words.len());

        Ok(Segment {
            index,
            text: spec.text,
            image_source: spec.image,
            image,
            audio,
            duration,
            words,
        })
    }
}
