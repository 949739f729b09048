//! interaction — counting ant-to-ant contacts over a label sequence
//!
//! For every frame, every unordered pair of eligible detections whose boxes
//! overlap has the frame index appended to that pair's history. Each history
//! is then merged into event segments (gaps up to `merge_tolerance` frames are
//! bridged) and a segment counts as one interaction when its frame span
//! reaches `min_segment_length`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{Band, InteractionConfig};
use crate::detection::{filter_region, Detection};
use crate::labels::{Frame, FrameSequence};

// ── Pair key ─────────────────────────────────────────────────────────────────

/// Unordered pair of two distinct track IDs, stored ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PairKey(u32, u32);

impl PairKey {
    /// Canonical key for `a` and `b`, or `None` when they are the same ID.
    pub fn new(a: u32, b: u32) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self(a, b)),
            std::cmp::Ordering::Greater => Some(Self(b, a)),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn first(&self) -> u32 {
        self.0
    }

    pub fn second(&self) -> u32 {
        self.1
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.0, self.1)
    }
}

// ── Pair history ─────────────────────────────────────────────────────────────

/// Frame indices at which each pair was seen overlapping, in ascending order.
#[derive(Debug, Default, Clone)]
pub struct PairHistory {
    frames: BTreeMap<PairKey, Vec<usize>>,
    last_frame: Option<usize>,
}

impl PairHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the overlapping pairs of `detections` under `frame_index`.
    ///
    /// Frames must be fed in increasing order; histories stay sorted because
    /// of it.
    pub fn record_frame(&mut self, frame_index: usize, detections: &[&Detection]) {
        debug_assert!(
            self.last_frame.map_or(true, |last| frame_index > last),
            "frames must arrive in increasing order"
        );
        self.last_frame = Some(frame_index);

        for (i, a) in detections.iter().enumerate() {
            for b in &detections[i + 1..] {
                if !a.overlaps(b) {
                    continue;
                }
                if let Some(key) = PairKey::new(a.track_id, b.track_id) {
                    self.frames.entry(key).or_default().push(frame_index);
                }
            }
        }
    }

    pub fn get(&self, key: &PairKey) -> Option<&[usize]> {
        self.frames.get(key).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PairKey, &[usize])> {
        self.frames.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Per-frame collection step: region filter, then pairwise overlap.
pub struct InteractionCollector {
    band: Option<Band>,
    history: PairHistory,
    frames_seen: usize,
    skipped_lines: usize,
}

impl InteractionCollector {
    pub fn new(band: Option<Band>) -> Self {
        Self {
            band,
            history: PairHistory::new(),
            frames_seen: 0,
            skipped_lines: 0,
        }
    }

    pub fn push(&mut self, frame: &Frame) {
        let eligible: Vec<&Detection> = match &self.band {
            Some(band) => filter_region(&frame.detections, band),
            None => frame.detections.iter().collect(),
        };
        debug!(
            frame = frame.index,
            detections = frame.detections.len(),
            eligible = eligible.len(),
            "collecting overlaps"
        );
        self.history.record_frame(frame.index, &eligible);
        self.frames_seen += 1;
        self.skipped_lines += frame.skipped_lines;
    }

    pub fn history(&self) -> &PairHistory {
        &self.history
    }
}

// ── Interval merging ─────────────────────────────────────────────────────────

/// A run of frames, inclusive at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
}

impl Segment {
    /// Frame span `end - start + 1`.
    pub fn span(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn counts(&self, min_segment_length: usize) -> bool {
        self.span() >= min_segment_length
    }
}

/// Merge a sorted list of frame indices into segments. A frame joins the open
/// segment when it is at most `tolerance` frames after the segment's end.
pub fn merge_intervals(frames: &[usize], tolerance: usize) -> Vec<Segment> {
    let Some((&first, rest)) = frames.split_first() else {
        return Vec::new();
    };

    let mut segments = Vec::new();
    let mut current = Segment {
        start: first,
        end: first,
    };
    for &f in rest {
        if f.saturating_sub(current.end) <= tolerance {
            current.end = current.end.max(f);
        } else {
            segments.push(current);
            current = Segment { start: f, end: f };
        }
    }
    segments.push(current);
    segments
}

/// Number of segments whose span reaches `min_segment_length`.
pub fn count_interactions(segments: &[Segment], min_segment_length: usize) -> usize {
    segments.iter().filter(|s| s.counts(min_segment_length)).count()
}

// ── Report ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PairSummary {
    pub pair: PairKey,
    /// Frames in which the pair overlapped.
    pub frames_observed: usize,
    pub segments: Vec<Segment>,
    /// Segments long enough to count.
    pub interactions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct InteractionReport {
    pub config: InteractionConfig,
    pub frames_processed: usize,
    pub skipped_lines: usize,
    pub total_interactions: usize,
    pub pairs: Vec<PairSummary>,
}

/// Merge and count every pair in `history`.
pub fn summarize(history: &PairHistory, config: &InteractionConfig) -> Vec<PairSummary> {
    history
        .iter()
        .map(|(pair, frames)| {
            let segments = merge_intervals(frames, config.merge_tolerance());
            let interactions = count_interactions(&segments, config.min_segment_length());
            PairSummary {
                pair: *pair,
                frames_observed: frames.len(),
                segments,
                interactions,
            }
        })
        .collect()
}

/// Run the whole count over a label directory.
pub fn count_in_dir<P: AsRef<Path>>(dir: P, config: &InteractionConfig) -> Result<InteractionReport> {
    let dir = dir.as_ref();
    let frames = FrameSequence::open(dir)?;
    info!(
        dir = %dir.display(),
        frames = frames.len(),
        band = ?config.band(),
        merge_tolerance = config.merge_tolerance(),
        min_segment_length = config.min_segment_length(),
        "counting interactions"
    );

    let mut collector = InteractionCollector::new(config.band());
    for frame in frames {
        collector.push(&frame?);
    }
    Ok(report(collector, config))
}

/// Finish a collection run into a report.
pub fn report(collector: InteractionCollector, config: &InteractionConfig) -> InteractionReport {
    let frames_processed = collector.frames_seen;
    let skipped_lines = collector.skipped_lines;
    let pairs = summarize(collector.history(), config);
    let total_interactions = pairs.iter().map(|p| p.interactions).sum();

    for p in pairs.iter().filter(|p| p.interactions > 0) {
        debug!(pair = %p.pair, interactions = p.interactions, segments = p.segments.len(), "pair summary");
    }
    info!(total_interactions, pairs = pairs.len(), "interaction count complete");

    InteractionReport {
        config: config.clone(),
        frames_processed,
        skipped_lines,
        total_interactions,
        pairs,
    }
}
