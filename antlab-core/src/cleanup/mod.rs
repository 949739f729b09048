//! cleanup — removing falsely tracked identities from a label directory
//!
//! The rewrite is destructive. Call [`backup_label_dir`] first if the original
//! labels must be recoverable.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::IdSelection;
use crate::labels::{list_label_files, observed_identities, parse_line};

/// Prefix of the tracker's per-run output directories (`track`, `track2`, …).
const RUN_DIR_PREFIX: &str = "track";

// ── Identity resolution ──────────────────────────────────────────────────────

/// Turn an [`IdSelection`] into the concrete set of identities to remove.
/// A true-positive selection needs the census of `labels_dir`.
pub fn resolve_false_positives<P: AsRef<Path>>(
    selection: &IdSelection,
    labels_dir: P,
) -> Result<BTreeSet<u32>> {
    match selection {
        IdSelection::FalsePositives(ids) => Ok(ids.clone()),
        IdSelection::TruePositives(keep) => {
            let all = observed_identities(labels_dir)?;
            let remove = false_positives_from(&all, keep);
            info!(?all, true_positives = ?keep, false_positives = ?remove, "derived false-positive IDs");
            Ok(remove)
        }
    }
}

/// `observed − true_positives`.
pub fn false_positives_from(observed: &BTreeSet<u32>, true_positives: &BTreeSet<u32>) -> BTreeSet<u32> {
    observed.difference(true_positives).copied().collect()
}

// ── In-place rewrite ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterSummary {
    pub removed_ids: BTreeSet<u32>,
    pub files_rewritten: usize,
    pub lines_kept: usize,
    pub lines_removed: usize,
    /// Malformed lines dropped during the rewrite.
    pub lines_skipped: usize,
}

/// Keep the lines of `text` whose track ID is not in `remove`. Retained
/// lines are trimmed and newline-terminated; blank and malformed lines go.
///
/// Returns the new content and `(kept, removed, skipped)` counts.
pub fn filter_lines(text: &str, remove: &BTreeSet<u32>) -> (String, usize, usize, usize) {
    let mut out = String::with_capacity(text.len());
    let (mut kept, mut removed, mut skipped) = (0, 0, 0);
    for line in text.lines() {
        match parse_line(line) {
            Ok(Some(d)) if remove.contains(&d.track_id) => removed += 1,
            Ok(Some(_)) => {
                out.push_str(line.trim());
                out.push('\n');
                kept += 1;
            }
            Ok(None) => {}
            Err(e) => {
                skipped += 1;
                debug!("dropping malformed label line: {e}");
            }
        }
    }
    (out, kept, removed, skipped)
}

/// Rewrite every label file in `labels_dir`, dropping all detections whose
/// identity is in `remove`. Files left with no detections are kept empty.
pub fn remove_identities<P: AsRef<Path>>(labels_dir: P, remove: &BTreeSet<u32>) -> Result<FilterSummary> {
    let labels_dir = labels_dir.as_ref();
    let files = list_label_files(labels_dir)?;
    let mut summary = FilterSummary {
        removed_ids: remove.clone(),
        ..Default::default()
    };

    for path in &files {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read label file: {}", path.display()))?;
        let (filtered, kept, removed, skipped) = filter_lines(&text, remove);
        if skipped > 0 {
            warn!(path = %path.display(), skipped, "dropped malformed label lines");
        }
        fs::write(path, filtered)
            .with_context(|| format!("failed to rewrite label file: {}", path.display()))?;

        summary.files_rewritten += 1;
        summary.lines_kept += kept;
        summary.lines_removed += removed;
        summary.lines_skipped += skipped;
    }

    info!(
        dir = %labels_dir.display(),
        files = summary.files_rewritten,
        kept = summary.lines_kept,
        removed = summary.lines_removed,
        "false-positive lines removed"
    );
    Ok(summary)
}

/// Resolve `selection` against `labels_dir` and rewrite the directory.
pub fn apply_selection<P: AsRef<Path>>(labels_dir: P, selection: &IdSelection) -> Result<FilterSummary> {
    let labels_dir = labels_dir.as_ref();
    let remove = resolve_false_positives(selection, labels_dir)?;
    remove_identities(labels_dir, &remove)
}

// ── Backup and run discovery ─────────────────────────────────────────────────

/// Default backup location: `<labels_dir>_backup` next to the original.
pub fn default_backup_dir<P: AsRef<Path>>(labels_dir: P) -> PathBuf {
    let labels_dir = labels_dir.as_ref();
    let mut name = labels_dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "labels".into());
    name.push("_backup");
    labels_dir.with_file_name(name)
}

/// Recursively copy `src` into `dst`, overwriting files that already exist.
/// `dst` may live inside `src`; it is never copied into itself. Returns the
/// number of files copied.
pub fn backup_label_dir<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dst: Q) -> Result<usize> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if !src.is_dir() {
        bail!("cannot back up missing directory: {}", src.display());
    }

    fs::create_dir_all(dst)
        .with_context(|| format!("failed to create backup directory: {}", dst.display()))?;
    let src_real = fs::canonicalize(src)
        .with_context(|| format!("failed to resolve {}", src.display()))?;
    let dst_real = fs::canonicalize(dst)
        .with_context(|| format!("failed to resolve {}", dst.display()))?;
    if src_real == dst_real {
        bail!("backup destination is the label directory itself: {}", dst.display());
    }

    // List everything up front so directories created below are never walked
    let entries = WalkDir::new(src)
        .into_iter()
        .filter_entry(|e| {
            !e.file_type().is_dir() || fs::canonicalize(e.path()).map_or(true, |p| p != dst_real)
        })
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to walk {}", src.display()))?;

    let mut copied = 0;
    for entry in entries {
        let rel = entry
            .path()
            .strip_prefix(src)
            .context("walked entry outside the source directory")?;
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("failed to copy {} to {}", entry.path().display(), target.display())
            })?;
            copied += 1;
        }
    }

    info!(src = %src.display(), dst = %dst.display(), files = copied, "label directory backed up");
    Ok(copied)
}

/// Most recently created `track*` subdirectory of `runs_dir`, if any.
pub fn most_recent_run<P: AsRef<Path>>(runs_dir: P) -> Result<Option<PathBuf>> {
    let runs_dir = runs_dir.as_ref();
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    for entry in fs::read_dir(runs_dir)
        .with_context(|| format!("failed to read runs directory: {}", runs_dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("failed to list runs directory: {}", runs_dir.display()))?;
        if !entry.file_name().to_string_lossy().starts_with(RUN_DIR_PREFIX) {
            continue;
        }
        let path = entry.path();
        let meta = entry
            .metadata()
            .with_context(|| format!("failed to stat tracking run: {}", path.display()))?;
        if !meta.is_dir() {
            continue;
        }
        let stamp = meta
            .created()
            .or_else(|_| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(t, _)| stamp > *t) {
            newest = Some((stamp, path));
        }
    }

    Ok(newest.map(|(_, p)| p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_false_positives_from_true_positives() {
        let all = BTreeSet::from([1, 2, 3, 4]);
        let keep = BTreeSet::from([1, 2]);
        assert_eq!(false_positives_from(&all, &keep), BTreeSet::from([3, 4]));
        // IDs never observed are irrelevant
        assert_eq!(
            false_positives_from(&all, &BTreeSet::from([1, 9])),
            BTreeSet::from([2, 3, 4])
        );
    }

    #[test]
    fn test_filter_lines() {
        let text = "0 0.1 0.1 0.1 0.1 1\n  0 0.2 0.2 0.1 0.1 3  \n\nbroken\n0 0.3 0.3 0.1 0.1 2\n";
        let (out, kept, removed, skipped) = filter_lines(text, &BTreeSet::from([3]));
        assert_eq!(out, "0 0.1 0.1 0.1 0.1 1\n0 0.3 0.3 0.1 0.1 2\n");
        assert_eq!((kept, removed, skipped), (2, 1, 1));
    }

    #[test]
    fn test_filter_lines_can_empty_a_file() {
        let (out, kept, removed, _) = filter_lines("0 .5 .5 .1 .1 8\n", &BTreeSet::from([8]));
        assert!(out.is_empty());
        assert_eq!((kept, removed), (0, 1));
    }

    #[test]
    fn test_default_backup_dir() {
        assert_eq!(
            default_backup_dir("runs/detect/track1/labels"),
            PathBuf::from("runs/detect/track1/labels_backup")
        );
    }

    #[test]
    fn test_backup_copies_tree() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), "x").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/b.txt"), "y").unwrap();

        let dst_root = tempfile::tempdir().unwrap();
        let dst = dst_root.path().join("copy");
        assert_eq!(backup_label_dir(src.path(), &dst).unwrap(), 2);
        assert_eq!(fs::read_to_string(dst.join("sub/b.txt")).unwrap(), "y");

        // Existing destination is overwritten, not rejected
        fs::write(src.path().join("a.txt"), "z").unwrap();
        assert_eq!(backup_label_dir(src.path(), &dst).unwrap(), 2);
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "z");
    }

    #[test]
    fn test_backup_into_own_subdirectory() {
        let src = tempfile::tempdir().unwrap();
        for name in ["f1.txt", "f2.txt", "f3.txt"] {
            fs::write(src.path().join(name), "0 0.5 0.5 0.1 0.1 1\n").unwrap();
        }
        let dst = src.path().join("bak");

        assert_eq!(backup_label_dir(src.path(), &dst).unwrap(), 3);
        // A second run finds the earlier backup inside the source and skips it
        assert_eq!(backup_label_dir(src.path(), &dst).unwrap(), 3);

        assert!(dst.join("f2.txt").is_file());
        assert!(!dst.join("bak").exists());
    }

    #[test]
    fn test_backup_onto_itself_is_rejected() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f1.txt"), "0 0.5 0.5 0.1 0.1 1\n").unwrap();
        assert!(backup_label_dir(src.path(), src.path()).is_err());
        assert_eq!(fs::read_to_string(src.path().join("f1.txt")).unwrap(), "0 0.5 0.5 0.1 0.1 1\n");
    }

    #[test]
    fn test_most_recent_run() {
        let runs = tempfile::tempdir().unwrap();
        assert_eq!(most_recent_run(runs.path()).unwrap(), None);

        fs::create_dir(runs.path().join("track")).unwrap();
        fs::create_dir(runs.path().join("predict")).unwrap();
        fs::write(runs.path().join("track_notes"), "").unwrap();
        fs::write(runs.path().join("results.csv"), "").unwrap();
        assert_eq!(
            most_recent_run(runs.path()).unwrap(),
            Some(runs.path().join("track"))
        );
    }
}
