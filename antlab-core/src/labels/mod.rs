//! labels — per-frame tracker label files
//!
//! The tracker writes one `.txt` file per processed frame. Each non-blank line
//! is `class_id x_center y_center width height track_id`, whitespace
//! separated. Some tracker builds insert a confidence column before the track
//! ID, so the identity is always taken from the last field.
//!
//! Frame order is the natural order of the file names (`clip_2.txt` comes
//! before `clip_10.txt`). Malformed lines are skipped with a warning; an
//! unreadable file or a missing directory aborts the caller.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tracing::{debug, warn};

use crate::detection::{BBox, Detection};

/// Minimum number of whitespace-separated fields on a valid line.
pub const MIN_FIELDS: usize = 6;
/// Extension of label files inside a run's `labels/` directory.
const LABEL_EXTENSION: &str = "txt";

// ── Line codec ───────────────────────────────────────────────────────────────

/// Why a single label line was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LineError {
    #[error("expected at least 6 fields, found {0}")]
    TooFewFields(usize),

    #[error("field {index} ({value:?}) is not a valid {expected}")]
    BadField {
        index: usize,
        value: String,
        expected: &'static str,
    },
}

/// Parse one label line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Detection>, LineError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.is_empty() {
        return Ok(None);
    }
    if fields.len() < MIN_FIELDS {
        return Err(LineError::TooFewFields(fields.len()));
    }

    let class_id = parse_field::<u32>(&fields, 0, "class id")?;
    let cx = parse_coord(&fields, 1)?;
    let cy = parse_coord(&fields, 2)?;
    let w = parse_coord(&fields, 3)?;
    let h = parse_coord(&fields, 4)?;
    let track_id = parse_field::<u32>(&fields, fields.len() - 1, "track id")?;

    Ok(Some(Detection {
        class_id,
        bbox: BBox::new(cx, cy, w, h),
        track_id,
    }))
}

fn parse_field<T: std::str::FromStr>(
    fields: &[&str],
    index: usize,
    expected: &'static str,
) -> Result<T, LineError> {
    fields[index].parse().map_err(|_| LineError::BadField {
        index,
        value: fields[index].to_string(),
        expected,
    })
}

fn parse_coord(fields: &[&str], index: usize) -> Result<f64, LineError> {
    let v: f64 = parse_field(fields, index, "number")?;
    if !v.is_finite() {
        return Err(LineError::BadField {
            index,
            value: fields[index].to_string(),
            expected: "finite number",
        });
    }
    Ok(v)
}

// ── Directory enumeration ────────────────────────────────────────────────────

/// Compare two file names so that embedded digit runs sort numerically.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let da = a.iter().take_while(|c| c.is_ascii_digit()).count();
                let db = b.iter().take_while(|c| c.is_ascii_digit()).count();
                let (na, nb) = (trim_zeros(&a[..da]), trim_zeros(&b[..db]));
                // Longer significant run is the bigger number; equal lengths compare bytewise.
                let ord = na.len().cmp(&nb.len()).then_with(|| na.cmp(nb)).then(da.cmp(&db));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[da..];
                b = &b[db..];
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn trim_zeros(digits: &[u8]) -> &[u8] {
    let skip = digits.iter().take_while(|&&c| c == b'0').count();
    &digits[skip..]
}

/// List the label files of `dir` in frame order.
pub fn list_label_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        bail!("label directory not found: {}", dir.display());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("failed to read label directory: {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let path = entry.path();
        let is_label = path.extension().and_then(|e| e.to_str()) == Some(LABEL_EXTENSION);
        if is_label && entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            files.push(path);
        }
    }

    files.sort_by(|a, b| natural_cmp(&file_name(a), &file_name(b)));
    debug!(dir = %dir.display(), files = files.len(), "enumerated label files");
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ── Frame-sequence loader ────────────────────────────────────────────────────

/// The detections of one frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position of the file in frame order, starting at 0.
    pub index: usize,
    pub path: PathBuf,
    pub detections: Vec<Detection>,
    /// Malformed lines dropped while parsing this file.
    pub skipped_lines: usize,
}

/// Read and parse a single label file.
pub fn read_frame<P: AsRef<Path>>(index: usize, path: P) -> Result<Frame> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read label file: {}", path.display()))?;

    let mut detections = Vec::new();
    let mut skipped_lines = 0;
    for (lineno, line) in text.lines().enumerate() {
        match parse_line(line) {
            Ok(Some(d)) => detections.push(d),
            Ok(None) => {}
            Err(e) => {
                skipped_lines += 1;
                warn!(path = %path.display(), line = lineno + 1, "skipping malformed label line: {e}");
            }
        }
    }

    Ok(Frame {
        index,
        path: path.to_path_buf(),
        detections,
        skipped_lines,
    })
}

/// Lazily reads the label files of a directory in frame order, one file at a
/// time.
pub struct FrameSequence {
    files: Vec<PathBuf>,
    next: usize,
}

impl FrameSequence {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Ok(Self {
            files: list_label_files(dir)?,
            next: 0,
        })
    }

    /// Total number of frames in the sequence.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Iterator for FrameSequence {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.files.get(self.next)?;
        let frame = read_frame(self.next, path);
        self.next += 1;
        Some(frame)
    }
}

/// Every track ID appearing on a well-formed line anywhere in `dir`.
pub fn observed_identities<P: AsRef<Path>>(dir: P) -> Result<BTreeSet<u32>> {
    let mut ids = BTreeSet::new();
    for frame in FrameSequence::open(dir)? {
        ids.extend(frame?.detections.iter().map(|d| d.track_id));
    }
    Ok(ids)
}
