use crate::align::WordTimestamp;

/// Duration and local word timing of one narrated segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTiming {
    pub duration: f64,
    pub words: Vec<WordTimestamp>,
}

/// Single time axis of the concatenated video.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalTimeline {
    boundaries: Vec<f64>,
    words: Vec<WordTimestamp>,
    word_ranges: Vec<std::ops::Range<usize>>,
}

impl GlobalTimeline {
    /// Shifts each segment's words by the running offset and records the
    /// segment start times, then the total duration.
    pub fn build(segments: &[SegmentTiming]) -> Self {
        let total_words = segments.iter().map(|s| s.words.len()).sum();
        let mut boundaries = Vec::with_capacity(segments.len() + 1);
        let mut words = Vec::with_capacity(total_words);
        let mut word_ranges = Vec::with_capacity(segments.len());
        let mut offset = 0.0_f64;

        for segment in segments {
            let first = words.len();
            words.extend(segment.words.iter().map(|w| w.shifted(offset)));
            word_ranges.push(first..words.len());
            boundaries.push(offset);
            offset += segment.duration;
        }
        boundaries.push(offset);

        Self {
            boundaries,
            words,
            word_ranges,
        }
    }

    pub fn boundaries(&self) -> &[f64] {
        &self.boundaries
    }

    pub fn words(&self) -> &[WordTimestamp] {
        &self.words
    }

    pub fn total_duration(&self) -> f64 {
        self.boundaries.last().copied().unwrap_or(0.0)
    }

    pub fn segment_count(&self) -> usize {
        self.word_ranges.len()
    }

    /// `[start, end)` of segment `index` on the global axis.
    pub fn segment_span(&self, index: usize) -> Option<(f64, f64)> {
        let start = *self.boundaries.get(index)?;
        let end = *self.boundaries.get(index + 1)?;
        Some((start, end))
    }

    /// Frames each segment's still image is held for at `fps`.
    ///
    /// Counts come from the rounded global boundaries, so segment `i` starts on
    /// the frame nearest `boundaries[i]` and rounding never accumulates.
    pub fn frame_counts(&self, fps: u32) -> Vec<u64> {
        let to_frame = |t: f64| (t * f64::from(fps)).round().max(0.0) as u64;
        self.boundaries
            .windows(2)
            .map(|b| to_frame(b[1]).saturating_sub(to_frame(b[0])))
            .collect()
    }

    /// Words of segment `index`, still in global time.
    pub fn segment_words(&self, index: usize) -> &[WordTimestamp] {
        self.word_ranges
            .get(index)
            .map(|r| &self.words[r.clone()])
            .unwrap_or(&[])
    }

    /// Words of segment `index` moved back to that segment's local time.
    pub fn local_words(&self, index: usize) -> Vec<WordTimestamp> {
        let offset = self.boundaries.get(index).copied().unwrap_or(0.0);
        self.segment_words(index)
            .iter()
            .map(|w| w.shifted(-offset))
            .collect()
    }
}
