use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;
use crate::timeline::GlobalTimeline;

const SRT_LINE_CHARS: usize = 42;

#[derive(Debug, Clone, PartialEq)]
pub struct SrtCue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// One cue per segment, spanning the segment's boundaries.
pub fn segment_cues(timeline: &GlobalTimeline, texts: &[&str]) -> Vec<SrtCue> {
    texts
        .iter()
        .enumerate()
        .filter_map(|(i, text)| {
            let (start, end) = timeline.segment_span(i)?;
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            (!text.is_empty() && end > start).then_some(SrtCue { start, end, text })
        })
        .collect()
}

pub fn write_srt(path: &Path, cues: &[SrtCue]) -> Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    for (i, cue) in cues.iter().enumerate() {
        writeln!(f, "{}", i + 1)?;
        writeln!(f, "{} --> {}", format_srt_time(cue.start), format_srt_time(cue.end))?;
        for line in wrap_text(&cue.text, SRT_LINE_CHARS) {
            writeln!(f, "{}", line)?;
        }
        writeln!(f)?;
    }
    f.flush()?;
    Ok(())
}

pub fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_sec = total_ms / 1000;
    let s = total_sec % 60;
    let total_min = total_sec / 60;
    let m = total_min % 60;
    let h = total_min / 60;
    format!("{:02}:{:02}:{:02},{:03}", h, m, s, ms)
}

fn wrap_text(s: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in s.split_whitespace() {
        if !current.is_empty() && current.chars().count() + word.chars().count() + 1 > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::SegmentTiming;

    #[test]
    fn formats_srt_timestamps() {
        assert_eq!(format_srt_time(0.0), "00:00:00,000");
        assert_eq!(format_srt_time(3.5), "00:00:03,500");
        assert_eq!(format_srt_time(3723.0456), "01:02:03,046");
        assert_eq!(format_srt_time(-1.0), "00:00:00,000");
    }

    #[test]
    fn wraps_long_cues() {
        let lines = wrap_text("the quick brown fox jumps over the lazy dog", 15);
        assert_eq!(lines, ["the quick brown", "fox jumps over", "the lazy dog"]);
    }

    #[test]
    fn cues_follow_segment_boundaries() {
        let timeline = GlobalTimeline::build(&[
            SegmentTiming {
                duration: 2.0,
                words: vec![],
            },
            SegmentTiming {
                duration: 1.5,
                words: vec![],
            },
            SegmentTiming {
                duration: 1.0,
                words: vec![],
            },
        ]);
        let cues = segment_cues(&timeline, &["Hello  world", "   ", "Goodbye now"]);
        assert_eq!(
            cues,
            vec![
                SrtCue {
                    start: 0.0,
                    end: 2.0,
                    text: "Hello world".into()
                },
                SrtCue {
                    start: 3.5,
                    end: 4.5,
                    text: "Goodbye now".into()
                },
            ]
        );
    }

    #[test]
    fn writes_numbered_srt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.srt");
        write_srt(
            &path,
            &[
                SrtCue {
                    start: 0.0,
                    end: 2.0,
                    text: "Hello world".into(),
                },
                SrtCue {
                    start: 2.0,
                    end: 3.5,
                    text: "Goodbye now".into(),
                },
            ],
        )
        .unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "1\n00:00:00,000 --> 00:00:02,000\nHello world\n\n2\n00:00:02,000 --> 00:00:03,500\nGoodbye now\n\n"
        );
    }
}
