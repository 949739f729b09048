//! trajectory — distances of two ants to a fixed larva position over time
//!
//! Works on the same label directories as the interaction count but only on
//! frames holding exactly two detections. The tracker's IDs are not stable
//! enough to name "ant 1" and "ant 2" directly, so slots are assigned with a
//! first-seen heuristic that can be fooled by identity swaps.

use std::path::Path;

use anyhow::Result;
use nalgebra::Point2;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{ConfigError, Point};
use crate::detection::Detection;
use crate::labels::{list_label_files, read_frame};

/// Options for [`distance_series`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DistanceOptions {
    interval: usize,
    mad_factor: Option<f64>,
}

impl DistanceOptions {
    pub fn new(interval: usize, mad_factor: Option<f64>) -> Result<Self, ConfigError> {
        if interval == 0 {
            return Err(ConfigError::Other("sampling interval must be at least 1".into()));
        }
        if let Some(f) = mad_factor {
            if !f.is_finite() || f <= 0.0 {
                return Err(ConfigError::Other(format!("MAD factor must be positive (got {f})")));
            }
        }
        Ok(Self { interval, mad_factor })
    }

    /// Use every `interval`-th label file. Always ≥ 1.
    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Replace values more than `mad_factor` MADs from the median; `None` keeps
    /// the raw series.
    pub fn mad_factor(&self) -> Option<f64> {
        self.mad_factor
    }
}

/// Aligned distance series; entry `i` of every vector belongs to `frames[i]`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DistanceSeries {
    pub larva: Option<Point>,
    pub ant1_ids: Vec<u32>,
    pub ant2_ids: Vec<u32>,
    pub frames: Vec<usize>,
    pub ant1_larva: Vec<f64>,
    pub ant2_larva: Vec<f64>,
    pub ant1_ant2: Vec<f64>,
}

/// Identity bookkeeping for the two slots.
#[derive(Debug, Default)]
struct SlotAssigner {
    ant1: Vec<u32>,
    ant2: Vec<u32>,
}

impl SlotAssigner {
    fn observe(&mut self, a: u32, b: u32) {
        if self.ant1.is_empty() {
            self.ant1.push(a);
        }
        if self.ant2.is_empty() {
            self.ant2.push(b);
        }

        let (a_in1, a_in2) = (self.ant1.contains(&a), self.ant2.contains(&a));
        let (b_in1, b_in2) = (self.ant1.contains(&b), self.ant2.contains(&b));
        if !a_in1 && b_in2 {
            self.ant1.push(a);
        } else if a_in1 && !b_in2 {
            self.ant2.push(b);
        } else if a_in2 && !b_in1 {
            self.ant1.push(b);
        } else if !a_in2 && b_in1 {
            self.ant2.push(a);
        }
    }

    /// `true` when `(a, b)` is already in slot order.
    fn in_order(&self, a: u32, b: u32) -> bool {
        self.ant1.contains(&a) && self.ant2.contains(&b)
    }
}

fn centre(d: &Detection) -> Point2<f64> {
    Point2::new(d.bbox.cx, d.bbox.cy)
}

/// Build the distance series for `labels_dir` relative to `larva`.
pub fn distance_series<P: AsRef<Path>>(
    labels_dir: P,
    larva: Point,
    options: DistanceOptions,
) -> Result<DistanceSeries> {
    let files = list_label_files(labels_dir.as_ref())?;

    let mut samples: Vec<(usize, Detection, Detection)> = Vec::new();
    for (index, path) in files.iter().enumerate().step_by(options.interval) {
        let frame = read_frame(index, path)?;
        if let [a, b] = frame.detections[..] {
            samples.push((index, a, b));
        } else {
            debug!(frame = index, detections = frame.detections.len(), "skipping frame without exactly two ants");
        }
    }

    let mut slots = SlotAssigner::default();
    for (_, a, b) in &samples {
        slots.observe(a.track_id, b.track_id);
    }

    let l = Point2::new(larva.x, larva.y);
    let mut series = DistanceSeries {
        larva: Some(larva),
        ..Default::default()
    };
    for (index, a, b) in &samples {
        let (first, second) = if slots.in_order(a.track_id, b.track_id) {
            (a, b)
        } else {
            (b, a)
        };
        let (p1, p2) = (centre(first), centre(second));
        series.frames.push(*index);
        series.ant1_larva.push(nalgebra::distance(&p1, &l));
        series.ant2_larva.push(nalgebra::distance(&p2, &l));
        series.ant1_ant2.push(nalgebra::distance(&p1, &p2));
    }

    if let Some(factor) = options.mad_factor {
        replace_outliers(&mut series.ant1_larva, factor);
        replace_outliers(&mut series.ant2_larva, factor);
        replace_outliers(&mut series.ant1_ant2, factor);
    }

    series.ant1_ids = slots.ant1;
    series.ant2_ids = slots.ant2;
    info!(
        label_files = files.len(),
        samples = series.frames.len(),
        ant1_ids = ?series.ant1_ids,
        ant2_ids = ?series.ant2_ids,
        "distance series built"
    );
    Ok(series)
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Replace values whose absolute deviation from the median exceeds
/// `mad_factor × MAD` with the median. Series shorter than 3 or with zero MAD
/// are left alone.
pub fn replace_outliers(values: &mut [f64], mad_factor: f64) {
    if values.len() < 3 {
        return;
    }
    let med = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    let mad = median(&deviations);
    if mad == 0.0 {
        return;
    }
    let threshold = mad_factor * mad;
    for (v, dev) in values.iter_mut().zip(deviations) {
        if dev > threshold {
            *v = med;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::fs;

    #[test]
    fn test_replace_outliers() {
        let mut v = vec![1.0, 1.1, 0.9, 1.0, 50.0];
        replace_outliers(&mut v, 3.0);
        assert_eq!(v, vec![1.0, 1.1, 0.9, 1.0, 1.0]);

        let mut flat = vec![2.0, 2.0, 2.0, 9.0];
        replace_outliers(&mut flat, 3.0);
        assert_eq!(flat, vec![2.0, 2.0, 2.0, 9.0]);

        let mut short = vec![1.0, 100.0];
        replace_outliers(&mut short, 3.0);
        assert_eq!(short, vec![1.0, 100.0]);
    }

    #[test]
    fn test_slot_assignment_follows_known_partner() {
        let mut slots = SlotAssigner::default();
        slots.observe(1, 2);
        // ant 2 still known, new ID 5 takes over slot 1
        slots.observe(5, 2);
        // reversed order: 2 is in slot 2, new 7 goes to slot 1
        slots.observe(2, 7);
        assert_eq!(slots.ant1, vec![1, 5, 7]);
        assert_eq!(slots.ant2, vec![2]);
        assert!(slots.in_order(5, 2));
        assert!(!slots.in_order(2, 7));
    }

    #[test]
    fn test_distance_series_orients_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        // frame 0: ant 1 at (0,0), ant 2 at (3,4)
        fs::write(dir.path().join("f_0.txt"), "0 0 0 1 1 1\n0 3 4 1 1 2\n").unwrap();
        // frame 1: skipped by interval 2
        fs::write(dir.path().join("f_1.txt"), "0 9 9 1 1 1\n0 9 9 1 1 2\n").unwrap();
        // frame 2: listed in reverse order; must be swapped back
        fs::write(dir.path().join("f_2.txt"), "0 6 8 1 1 2\n0 0 0 1 1 1\n").unwrap();
        // frame 4: three detections, ignored
        fs::write(dir.path().join("f_3.txt"), "").unwrap();
        fs::write(dir.path().join("f_4.txt"), "0 0 0 1 1 1\n0 1 1 1 1 2\n0 2 2 1 1 3\n").unwrap();

        let options = DistanceOptions::new(2, None).unwrap();
        let series = distance_series(dir.path(), Point { x: 0.0, y: 0.0 }, options).unwrap();

        assert_eq!(series.frames, vec![0, 2]);
        assert_abs_diff_eq!(series.ant1_larva[0], 0.0);
        assert_abs_diff_eq!(series.ant2_larva[0], 5.0);
        assert_abs_diff_eq!(series.ant1_ant2[0], 5.0);
        assert_abs_diff_eq!(series.ant1_larva[1], 0.0);
        assert_abs_diff_eq!(series.ant2_larva[1], 10.0);
    }

    #[test]
    fn test_options_validation() {
        assert!(DistanceOptions::new(0, None).is_err());
        assert!(DistanceOptions::new(1, Some(-1.0)).is_err());
        assert!(DistanceOptions::new(1, Some(f64::NAN)).is_err());

        let options = DistanceOptions::new(60, Some(3.0)).unwrap();
        assert_eq!(options.interval(), 60);
        assert_eq!(options.mad_factor(), Some(3.0));
    }
}
