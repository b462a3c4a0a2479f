use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use fontdue::layout::{CoordinateSystem, GlyphRasterConfig, Layout, LayoutSettings, TextStyle};
use fontdue::{Font, FontSettings};
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::align::WordTimestamp;
use crate::config::CaptionConfig;
use crate::error::{MediaStage, PipelineError, Result};
use crate::media::{FrameReader, FrameSink, FrameSource, FrameWriter, VideoInfo};

const MAX_LINE_FRACTION: f32 = 0.8;
const BOTTOM_PADDING_FRACTION: f32 = 0.1;
const LINE_SPACING: f32 = 1.5;
const SHADOW_OFFSET: i32 = 1;

/// Packed `rgb24` video frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = rgb.repeat(width as usize * height as usize);
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y * self.width + x) * 3) as usize;
        [self.pixels[idx], self.pixels[idx + 1], self.pixels[idx + 2]]
    }

    fn blend(&mut self, x: i32, y: i32, src: [u8; 4]) {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return;
        }
        let alpha = u16::from(src[3]);
        if alpha == 0 {
            return;
        }
        let idx = ((y as u32 * self.width + x as u32) * 3) as usize;
        let inv_alpha = 255 - alpha;
        for channel in 0..3 {
            let dst = u16::from(self.pixels[idx + channel]);
            let src_c = u16::from(src[channel]);
            self.pixels[idx + channel] = ((src_c * alpha + dst * inv_alpha + 127) / 255) as u8;
        }
    }
}

/// Measures and paints caption text.
pub trait TextRenderer {
    /// Width and height of `text` in pixels.
    fn measure(&mut self, text: &str) -> (u32, u32);

    fn line_height(&mut self) -> u32 {
        self.measure("Ay").1.max(1)
    }

    /// Paints `text` with its top-left corner at `(x, y)`.
    fn draw(&mut self, frame: &mut Frame, x: i32, y: i32, text: &str, color: [u8; 4]);
}

/// What is on screen at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderState<'a> {
    pub time: f64,
    pub window: &'a [WordTimestamp],
    pub active: usize,
}

/// Index of the first word whose `[start, end]` holds `time`.
///
/// Words are ordered by start, so on overlapping intervals the earliest start wins.
pub fn active_word(words: &[WordTimestamp], time: f64) -> Option<usize> {
    words
        .iter()
        .take_while(|w| w.start <= time)
        .position(|w| w.contains(time))
}

/// Up to `size` words around `active`, clamped to the sequence.
pub fn select_window(len: usize, active: usize, size: usize) -> Range<usize> {
    let start = active.saturating_sub(size / 2);
    let end = len.min(start + size);
    start..end
}

pub fn render_state(words: &[WordTimestamp], time: f64, window_size: usize) -> Option<RenderState<'_>> {
    let active = active_word(words, time)?;
    let range = select_window(words.len(), active, window_size);
    let start = range.start;
    Some(RenderState {
        time,
        window: &words[range],
        active: active - start,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedWord {
    pub index: usize,
    pub x: i32,
    pub y: i32,
    pub width: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionLayout {
    pub words: Vec<PlacedWord>,
    pub line_count: usize,
    pub line_height: u32,
}

/// Wraps words to 80% of the frame width, centres each line and stacks the
/// block above a bottom padding of 10% of the frame height.
pub fn layout_words<R: TextRenderer + ?Sized>(
    renderer: &mut R,
    words: &[&str],
    frame_width: u32,
    frame_height: u32,
    spacing: u32,
) -> CaptionLayout {
    let max_width = (frame_width as f32 * MAX_LINE_FRACTION) as u32;
    let mut lines: Vec<(Vec<(usize, u32)>, u32)> = Vec::new();
    let mut current: Vec<(usize, u32)> = Vec::new();
    let mut current_width = 0u32;

    for (index, word) in words.iter().enumerate() {
        let (width, _) = renderer.measure(word);
        let gap = if current.is_empty() { 0 } else { spacing };
        if !current.is_empty() && current_width + gap + width > max_width {
            lines.push((std::mem::take(&mut current), current_width));
            current.push((index, width));
            current_width = width;
        } else {
            current.push((index, width));
            current_width += gap + width;
        }
    }
    if !current.is_empty() {
        lines.push((current, current_width));
    }

    let line_height = renderer.line_height();
    let step = line_height as f32 * LINE_SPACING;
    let block_height = lines.len() as f32 * step;
    let bottom_padding = (frame_height as f32 * BOTTOM_PADDING_FRACTION).floor();
    let top = frame_height as f32 - bottom_padding - block_height;

    let mut placed = Vec::with_capacity(words.len());
    for (line_idx, (line, line_width)) in lines.iter().enumerate() {
        let y = (top + line_idx as f32 * step).round() as i32;
        let mut x = (frame_width as i32 - *line_width as i32) / 2;
        for &(index, width) in line {
            placed.push(PlacedWord { index, x, y, width });
            x += (width + spacing) as i32;
        }
    }

    CaptionLayout {
        words: placed,
        line_count: lines.len(),
        line_height,
    }
}

/// Draws the caption window for `time` onto `frame`. Returns `false` if no
/// word is being spoken, in which case the frame is untouched.
pub fn render_frame_in_place<R: TextRenderer + ?Sized>(
    frame: &mut Frame,
    time: f64,
    words: &[WordTimestamp],
    renderer: &mut R,
    style: &CaptionConfig,
) -> bool {
    let Some(state) = render_state(words, time, style.window_words) else {
        return false;
    };
    let texts: Vec<&str> = state.window.iter().map(|w| w.word.as_str()).collect();
    let layout = layout_words(renderer, &texts, frame.width, frame.height, style.word_spacing);
    let colors = style.colors;
    let shadow = colors.shadow.with_alpha(style.shadow_alpha);

    for placed in &layout.words {
        let text = texts[placed.index];
        let is_active = placed.index == state.active;
        if is_active {
            let pad = style.glow_padding as i32;
            let rect = Rect {
                x: placed.x - pad,
                y: placed.y - pad,
                w: placed.width + style.glow_padding * 2,
                h: layout.line_height + style.glow_padding * 2,
            };
            fill_rounded_rect(
                frame,
                rect,
                style.glow_radius,
                colors.highlight.with_alpha(style.glow_alpha),
            );
        }
        renderer.draw(
            frame,
            placed.x + SHADOW_OFFSET,
            placed.y + SHADOW_OFFSET,
            text,
            shadow,
        );
        let color = if is_active {
            colors.highlight
        } else {
            colors.text
        };
        renderer.draw(frame, placed.x, placed.y, text, color.with_alpha(255));
    }
    true
}

/// Pure variant of [`render_frame_in_place`].
pub fn render_frame<R: TextRenderer + ?Sized>(
    frame: &Frame,
    time: f64,
    words: &[WordTimestamp],
    renderer: &mut R,
    style: &CaptionConfig,
) -> Frame {
    let mut out = frame.clone();
    render_frame_in_place(&mut out, time, words, renderer, style);
    out
}

#[derive(Debug, Clone, Copy)]
struct Rect {
    x: i32,
    y: i32,
    w: u32,
    h: u32,
}

fn fill_rounded_rect(frame: &mut Frame, rect: Rect, radius: u32, color: [u8; 4]) {
    let radius = radius.min(rect.w / 2).min(rect.h / 2) as i32;
    let x0 = rect.x.max(0);
    let y0 = rect.y.max(0);
    let x1 = (rect.x + rect.w as i32).min(frame.width as i32);
    let y1 = (rect.y + rect.h as i32).min(frame.height as i32);
    for y in y0..y1 {
        for x in x0..x1 {
            if rounded_rect_contains(x, y, rect, radius) {
                frame.blend(x, y, color);
            }
        }
    }
}

fn rounded_rect_contains(x: i32, y: i32, rect: Rect, radius: i32) -> bool {
    let right = rect.x + rect.w as i32 - 1;
    let bottom = rect.y + rect.h as i32 - 1;
    if x < rect.x || y < rect.y || x > right || y > bottom {
        return false;
    }
    if radius == 0 {
        return true;
    }
    let cx = if x < rect.x + radius {
        rect.x + radius
    } else if x > right - radius {
        right - radius
    } else {
        return true;
    };
    let cy = if y < rect.y + radius {
        rect.y + radius
    } else if y > bottom - radius {
        bottom - radius
    } else {
        return true;
    };
    let dx = x - cx;
    let dy = y - cy;
    dx * dx + dy * dy <= radius * radius
}

struct GlyphBitmap {
    width: usize,
    height: usize,
    bitmap: Vec<u8>,
}

/// fontdue-backed painter. The font is shared read-only; the glyph cache is
/// per painter, so clone one for each worker.
pub struct FontPainter {
    font: Arc<Font>,
    font_size: f32,
    glyph_cache: HashMap<GlyphRasterConfig, GlyphBitmap>,
}

impl Clone for FontPainter {
    fn clone(&self) -> Self {
        Self {
            font: Arc::clone(&self.font),
            font_size: self.font_size,
            glyph_cache: HashMap::new(),
        }
    }
}

impl FontPainter {
    pub fn load(font_path: &Path, font_size: f32) -> Result<Self> {
        let bytes = std::fs::read(font_path).map_err(|e| {
            PipelineError::config(format!("cannot read font {}: {}", font_path.display(), e))
        })?;
        let font = Font::from_bytes(bytes, FontSettings::default()).map_err(|e| {
            PipelineError::config(format!("cannot parse font {}: {}", font_path.display(), e))
        })?;
        Ok(Self {
            font: Arc::new(font),
            font_size,
            glyph_cache: HashMap::new(),
        })
    }

    fn layout(&self, x: f32, y: f32, text: &str) -> Layout {
        let mut layout = Layout::new(CoordinateSystem::PositiveYDown);
        layout.reset(&LayoutSettings {
            x,
            y,
            ..LayoutSettings::default()
        });
        layout.append(&[self.font.as_ref()], &TextStyle::new(text, self.font_size, 0));
        layout
    }
}

impl TextRenderer for FontPainter {
    fn measure(&mut self, text: &str) -> (u32, u32) {
        let width: f32 = text
            .chars()
            .map(|c| self.font.metrics(c, self.font_size).advance_width)
            .sum();
        let height = self
            .font
            .horizontal_line_metrics(self.font_size)
            .map(|m| m.ascent - m.descent)
            .unwrap_or(self.font_size);
        (width.ceil().max(0.0) as u32, height.ceil().max(1.0) as u32)
    }

    fn draw(&mut self, frame: &mut Frame, x: i32, y: i32, text: &str, color: [u8; 4]) {
        let layout = self.layout(x as f32, y as f32, text);
        for glyph in layout.glyphs() {
            if glyph.width == 0 || glyph.height == 0 {
                continue;
            }
            let font = &self.font;
            let bitmap = self.glyph_cache.entry(glyph.key).or_insert_with(|| {
                let (_, bitmap) = font.rasterize_config(glyph.key);
                GlyphBitmap {
                    width: glyph.width,
                    height: glyph.height,
                    bitmap,
                }
            });
            let gx = glyph.x.round() as i32;
            let gy = glyph.y.round() as i32;
            for row in 0..bitmap.height {
                for col in 0..bitmap.width {
                    let mask = bitmap.bitmap[row * bitmap.width + col];
                    if mask == 0 {
                        continue;
                    }
                    let alpha = ((u16::from(mask) * u16::from(color[3])) / 255) as u8;
                    frame.blend(
                        gx + col as i32,
                        gy + row as i32,
                        [color[0], color[1], color[2], alpha],
                    );
                }
            }
        }
    }
}

/// Decodes `input`, captions every frame and encodes a silent `output`.
///
/// Blocking: call from `spawn_blocking`.
pub fn caption_video(
    input: &Path,
    output: &Path,
    info: VideoInfo,
    words: &[WordTimestamp],
    painter: &FontPainter,
    style: &CaptionConfig,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut reader = FrameReader::spawn(input, info)?;
    let mut writer = FrameWriter::spawn(output, info)?;
    let frames = caption_frames(&mut reader, &mut writer, info, words, painter, style, cancel)?;
    reader.finish()?;
    writer.finish()?;
    Ok(frames)
}

/// Captions every frame of `source` into `sink` and returns the frame count.
///
/// Frames are processed one second at a time; each batch is rendered in
/// parallel with one renderer clone per rayon worker. Frame `n` is drawn at
/// `n / fps` seconds. Cancellation is checked between batches.
pub fn caption_frames<R, S, K>(
    source: &mut S,
    sink: &mut K,
    info: VideoInfo,
    words: &[WordTimestamp],
    renderer: &R,
    style: &CaptionConfig,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: TextRenderer + Clone + Send + Sync,
    S: FrameSource + ?Sized,
    K: FrameSink + ?Sized,
{
    let batch_size = info.fps.round().max(1.0) as usize;
    let mut frame_index: u64 = 0;
    let mut captioned: u64 = 0;

    info!(
        "Rendering captions at {}x{} {:.2}fps for {} words",
        info.width,
        info.height,
        info.fps,
        words.len()
    );
    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let mut batch: Vec<Frame> = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let mut buf = Vec::new();
            if !source.read_frame(&mut buf)? {
                break;
            }
            batch.push(Frame {
                width: info.width,
                height: info.height,
                pixels: buf,
            });
        }
        if batch.is_empty() {
            break;
        }

        let first = frame_index;
        let drawn: u64 = batch
            .par_iter_mut()
            .enumerate()
            .map_init(
                || renderer.clone(),
                |worker, (offset, frame)| {
                    let time = (first + offset as u64) as f64 / info.fps;
                    u64::from(render_frame_in_place(frame, time, words, worker, style))
                },
            )
            .sum();
        captioned += drawn;

        for frame in &batch {
            sink.write_frame(&frame.pixels)?;
        }
        frame_index += batch.len() as u64;
        debug!("Rendered {} frames", frame_index);
    }

    if frame_index == 0 {
        return Err(PipelineError::media(
            MediaStage::RenderCaptions,
            "decoder produced no frames",
        ));
    }
    info!(
        "Rendered {} frames ({} with captions)",
        frame_index, captioned
    );
    Ok(frame_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColorScheme;

    /// 10px advance, 20px line, solid 8x16 block per non-space glyph.
    #[derive(Clone)]
    struct BlockRenderer;

    impl TextRenderer for BlockRenderer {
        fn measure(&mut self, text: &str) -> (u32, u32) {
            (text.chars().count() as u32 * 10, 20)
        }

        fn draw(&mut self, frame: &mut Frame, x: i32, y: i32, text: &str, color: [u8; 4]) {
            for (i, c) in text.chars().enumerate() {
                if c.is_whitespace() {
                    continue;
                }
                for dy in 0..16 {
                    for dx in 0..8 {
                        frame.blend(x + i as i32 * 10 + dx, y + dy, color);
                    }
                }
            }
        }
    }

    fn words(n: usize, seconds_each: f64) -> Vec<WordTimestamp> {
        (0..n)
            .map(|i| {
                let start = i as f64 * seconds_each;
                WordTimestamp::new(format!("w{}", i), start, start + seconds_each * 0.9)
            })
            .collect()
    }

    #[test]
    fn window_clamps_at_the_end() {
        assert_eq!(select_window(20, 15, 8), 11..19);
        assert_eq!(select_window(20, 19, 8), 15..20);
        assert_eq!(select_window(20, 2, 8), 0..8);
        assert_eq!(select_window(3, 1, 8), 0..3);
    }

    #[test]
    fn render_state_reports_active_index_within_window() {
        let w = words(20, 1.0);
        let state = render_state(&w, 15.2, 8).unwrap();
        assert_eq!(state.window.len(), 8);
        assert_eq!(state.window[0].word, "w11");
        assert_eq!(state.active, 4);
        assert_eq!(state.window[state.active].word, "w15");
    }

    #[test]
    fn overlapping_intervals_pick_earliest_start() {
        let w = vec![
            WordTimestamp::new("first", 0.0, 1.0),
            WordTimestamp::new("second", 0.9, 2.0),
        ];
        assert_eq!(active_word(&w, 0.95), Some(0));
        assert_eq!(active_word(&w, 1.5), Some(1));
        assert_eq!(active_word(&w, 2.5), None);
    }

    #[test]
    fn gap_between_words_has_no_active_word() {
        let w = words(3, 1.0);
        assert_eq!(active_word(&w, 0.95), None);
        assert_eq!(active_word(&w, 1.0), Some(1));
    }

    #[test]
    fn frame_outside_all_words_is_unchanged() {
        let frame = Frame::filled(64, 48, [10, 20, 30]);
        let w = vec![WordTimestamp::new("late", 5.0, 6.0)];
        let style = CaptionConfig::default();
        let out = render_frame(&frame, 1.0, &w, &mut BlockRenderer, &style);
        assert_eq!(out, frame);
        let out = render_frame(&frame, 1.0, &[], &mut BlockRenderer, &style);
        assert_eq!(out, frame);
    }

    #[test]
    fn active_word_is_highlighted() {
        let frame = Frame::filled(400, 300, [0, 0, 128]);
        let w = vec![
            WordTimestamp::new("Hello", 0.0, 1.0),
            WordTimestamp::new("world", 1.0, 2.0),
        ];
        let style = CaptionConfig {
            colors: ColorScheme::default(),
            ..CaptionConfig::default()
        };
        let out = render_frame(&frame, 1.5, &w, &mut BlockRenderer, &style);
        assert_ne!(out, frame);

        let mut renderer = BlockRenderer;
        let layout = layout_words(&mut renderer, &["Hello", "world"], 400, 300, style.word_spacing);
        let hello = layout.words[0];
        let world = layout.words[1];
        // glyph interiors are drawn last, at full opacity
        assert_eq!(
            out.pixel((hello.x + 3) as u32, (hello.y + 3) as u32),
            [255, 255, 255]
        );
        assert_eq!(
            out.pixel((world.x + 3) as u32, (world.y + 3) as u32),
            [255, 230, 0]
        );
        // the glow tints the padding around the active word only
        let glow = out.pixel((world.x - 2) as u32, (world.y + 10) as u32);
        assert_ne!(glow, [0, 0, 128]);
        let plain = out.pixel((hello.x - 2) as u32, (hello.y + 10) as u32);
        assert_eq!(plain, [0, 0, 128]);
    }

    #[test]
    fn layout_wraps_and_centres_lines() {
        let texts = ["aaaaaaaaaa"; 5];
        let mut renderer = BlockRenderer;
        // max line width 240: two 100px words plus 8px gap fit, three do not
        let layout = layout_words(&mut renderer, &texts, 300, 400, 8);
        assert_eq!(layout.line_count, 3);
        assert_eq!(layout.line_height, 20);

        let ys: Vec<i32> = layout.words.iter().map(|p| p.y).collect();
        // block of 3 lines * 30px above 40px padding
        assert_eq!(ys, [270, 270, 300, 300, 330]);
        assert_eq!(layout.words[0].x, (300 - 208) / 2);
        assert_eq!(layout.words[1].x, (300 - 208) / 2 + 108);
        assert_eq!(layout.words[4].x, (300 - 100) / 2);
    }

    #[test]
    fn over_long_word_gets_its_own_line() {
        let mut renderer = BlockRenderer;
        let layout = layout_words(&mut renderer, &["hi", "supercalifragilistic", "yo"], 100, 200, 8);
        assert_eq!(layout.line_count, 3);
        assert!(layout.words[1].x < 0);
    }

    #[test]
    fn rounded_rect_skips_corners() {
        let rect = Rect {
            x: 0,
            y: 0,
            w: 20,
            h: 20,
        };
        assert!(!rounded_rect_contains(0, 0, rect, 8));
        assert!(rounded_rect_contains(10, 0, rect, 8));
        assert!(rounded_rect_contains(10, 10, rect, 8));
        assert!(!rounded_rect_contains(20, 10, rect, 8));
    }

    struct StillSource {
        remaining: usize,
        frame: Frame,
    }

    impl FrameSource for StillSource {
        fn read_frame(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
            if self.remaining == 0 {
                return Ok(false);
            }
            self.remaining -= 1;
            buf.clear();
            buf.extend_from_slice(&self.frame.pixels);
            Ok(true)
        }
    }

    #[derive(Default)]
    struct CollectSink(Vec<Vec<u8>>);

    impl FrameSink for CollectSink {
        fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
            self.0.push(frame.to_vec());
            Ok(())
        }
    }

    fn still(remaining: usize) -> StillSource {
        StillSource {
            remaining,
            frame: Frame::filled(64, 48, [0, 0, 128]),
        }
    }

    const INFO: VideoInfo = VideoInfo {
        width: 64,
        height: 48,
        fps: 4.0,
    };

    #[test]
    fn frames_are_captioned_at_their_own_timestamps() {
        let plain = Frame::filled(64, 48, [0, 0, 128]).pixels;
        let w = vec![WordTimestamp::new("hi", 0.5, 1.0)];
        let mut source = still(10);
        let mut sink = CollectSink::default();

        let frames = caption_frames(
            &mut source,
            &mut sink,
            INFO,
            &w,
            &BlockRenderer,
            &CaptionConfig::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(frames, 10);
        assert_eq!(sink.0.len(), 10);
        // frames 2..=4 are at 0.5s, 0.75s and 1.0s; frame 4 opens the second batch
        let captioned: Vec<usize> = sink
            .0
            .iter()
            .enumerate()
            .filter(|(_, px)| **px != plain)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(captioned, [2, 3, 4]);
    }

    #[test]
    fn cancelled_render_writes_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = CollectSink::default();
        let err = caption_frames(
            &mut still(10),
            &mut sink,
            INFO,
            &[],
            &BlockRenderer,
            &CaptionConfig::default(),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(sink.0.is_empty());
    }

    #[test]
    fn empty_stream_is_a_media_error() {
        let err = caption_frames(
            &mut still(0),
            &mut CollectSink::default(),
            INFO,
            &[],
            &BlockRenderer,
            &CaptionConfig::default(),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MediaBackend {
                stage: MediaStage::RenderCaptions,
                ..
            }
        ));
    }
}
