//! config — validated run configuration
//!
//! Everything here is checked up front: a bad identity list, an empty band or
//! a zero `min_segment_length` is rejected before any label file is opened.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Configuration rejections raised before processing begins.
///
/// These travel inside `anyhow::Error`; use `downcast_ref::<ConfigError>()`
/// to tell them apart from I/O failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("no input provided: supply either true-positive or false-positive IDs")]
    NoIdInput,

    #[error("invalid configuration: true-positive and false-positive IDs are mutually exclusive")]
    ConflictingIdSets,

    #[error("invalid configuration: {token:?} in ID list {input:?} is not a non-negative integer")]
    InvalidIdList { input: String, token: String },

    #[error("invalid configuration: region band [{min}, {max}] is empty or not finite")]
    InvalidBand { min: f64, max: f64 },

    #[error("invalid configuration: band must be given as <min>,<max> (got {0:?})")]
    MalformedBand(String),

    #[error("invalid configuration: min_segment_length must be at least 1")]
    InvalidMinSegmentLength,

    #[error("invalid configuration: point must be given as <x>,<y> (got {0:?})")]
    MalformedPoint(String),

    #[error("invalid configuration: {0}")]
    Other(String),
}

// ── Region band ──────────────────────────────────────────────────────────────

/// Horizontal region of interest, in the same coordinate space as the
/// detection centres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Band {
    pub x_min: f64,
    pub x_max: f64,
}

impl Band {
    pub fn new(x_min: f64, x_max: f64) -> Result<Self, ConfigError> {
        if !x_min.is_finite() || !x_max.is_finite() || x_min >= x_max {
            return Err(ConfigError::InvalidBand {
                min: x_min,
                max: x_max,
            });
        }
        Ok(Self { x_min, x_max })
    }
}

impl FromStr for Band {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (min, max) = parse_pair(s).ok_or_else(|| ConfigError::MalformedBand(s.to_string()))?;
        Band::new(min, max)
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x_min, self.x_max)
    }
}

/// A fixed point of interest (the larva) in label coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl FromStr for Point {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_pair(s) {
            Some((x, y)) if x.is_finite() && y.is_finite() => Ok(Self { x, y }),
            _ => Err(ConfigError::MalformedPoint(s.to_string())),
        }
    }
}

fn parse_pair(s: &str) -> Option<(f64, f64)> {
    let (a, b) = s.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

// ── Interaction counting ─────────────────────────────────────────────────────

/// Tuning for the interaction count.
///
/// `merge_tolerance` and `min_segment_length` are dataset-specific and have no
/// default.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractionConfig {
    band: Option<Band>,
    merge_tolerance: usize,
    min_segment_length: usize,
}

impl InteractionConfig {
    pub fn new(
        band: Option<Band>,
        merge_tolerance: usize,
        min_segment_length: usize,
    ) -> Result<Self, ConfigError> {
        if min_segment_length == 0 {
            return Err(ConfigError::InvalidMinSegmentLength);
        }
        Ok(Self {
            band,
            merge_tolerance,
            min_segment_length,
        })
    }

    /// Restrict counting to detections fully inside this band; `None` keeps all.
    pub fn band(&self) -> Option<Band> {
        self.band
    }

    /// Largest gap (in frames) still treated as the same interaction.
    pub fn merge_tolerance(&self) -> usize {
        self.merge_tolerance
    }

    /// Minimum frame span (`end - start + 1`) for a segment to count. Always ≥ 1.
    pub fn min_segment_length(&self) -> usize {
        self.min_segment_length
    }
}

// ── Identity lists ───────────────────────────────────────────────────────────

/// Parse a comma-separated list of track IDs such as `"1, 2,7"`.
///
/// Empty tokens are ignored, so `""` yields an empty set and `"3,"` yields
/// `{3}`. Any other non-integer token rejects the whole list.
pub fn parse_id_list(input: &str) -> Result<BTreeSet<u32>, ConfigError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse::<u32>().map_err(|_| ConfigError::InvalidIdList {
                input: input.to_string(),
                token: t.to_string(),
            })
        })
        .collect()
}

/// Which identities the false-positive filter should remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdSelection {
    /// Remove exactly these identities.
    FalsePositives(BTreeSet<u32>),
    /// Keep these identities; remove every other identity observed.
    TruePositives(BTreeSet<u32>),
}

impl IdSelection {
    /// Build a selection from the two raw comma-separated inputs. Exactly one
    /// of them must contain IDs.
    pub fn from_lists(true_positives: &str, false_positives: &str) -> Result<Self, ConfigError> {
        let tp = parse_id_list(true_positives)?;
        let fp = parse_id_list(false_positives)?;
        match (tp.is_empty(), fp.is_empty()) {
            (true, true) => Err(ConfigError::NoIdInput),
            (false, false) => Err(ConfigError::ConflictingIdSets),
            (false, true) => Ok(Self::TruePositives(tp)),
            (true, false) => Ok(Self::FalsePositives(fp)),
        }
    }
}
