use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use antlab_core::cleanup::{apply_selection, backup_label_dir, default_backup_dir};
use antlab_core::config::{Band, ConfigError, IdSelection, InteractionConfig};
use antlab_core::interaction::{count_in_dir, PairKey, Segment};
use antlab_core::labels::observed_identities;

const NEAR_1: &str = "0 0.50 0.50 0.10 0.10 1";
const NEAR_2: &str = "0 0.52 0.50 0.10 0.10 2";
const FAR_2: &str = "0 0.90 0.50 0.05 0.05 2";
const FAR_3: &str = "0 0.10 0.10 0.05 0.05 3";

fn write_frames(dir: &Path, frames: usize, content: impl Fn(usize) -> String) {
    for i in 0..frames {
        fs::write(dir.join(format!("clip_{i}.txt")), content(i)).unwrap();
    }
}

#[test]
fn interactions_merge_short_gaps_into_one() {
    let dir = tempfile::tempdir().unwrap();
    let touching = [10, 11, 12, 15, 16];
    write_frames(dir.path(), 100, |i| {
        let partner = if touching.contains(&i) { NEAR_2 } else { FAR_2 };
        format!("{NEAR_1}\n{partner}\n{FAR_3}\n")
    });

    let config = InteractionConfig::new(None, 5, 6).unwrap();
    let report = count_in_dir(dir.path(), &config).unwrap();

    assert_eq!(report.frames_processed, 100);
    assert_eq!(report.total_interactions, 1);
    assert_eq!(report.pairs.len(), 1);
    let pair = &report.pairs[0];
    assert_eq!(pair.pair, PairKey::new(2, 1).unwrap());
    assert_eq!(pair.frames_observed, 5);
    assert_eq!(pair.segments, vec![Segment { start: 10, end: 16 }]);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["total_interactions"], 1);
    assert_eq!(json["config"]["merge_tolerance"], 5);
}

#[test]
fn interactions_respect_band_and_minimum_length() {
    let dir = tempfile::tempdir().unwrap();
    write_frames(dir.path(), 30, |i| {
        if (0..3).contains(&i) || (20..30).contains(&i) {
            format!("{NEAR_1}\n{NEAR_2}\n")
        } else {
            String::new()
        }
    });

    // Two runs: 0..=2 (span 3) and 20..=29 (span 10)
    let config = InteractionConfig::new(None, 1, 4).unwrap();
    assert_eq!(count_in_dir(dir.path(), &config).unwrap().total_interactions, 1);

    // The pair sits around x = 0.5; a band to its right excludes both ants
    let band: Band = "0.6,1.0".parse().unwrap();
    let config = InteractionConfig::new(Some(band), 1, 1).unwrap();
    let report = count_in_dir(dir.path(), &config).unwrap();
    assert_eq!(report.total_interactions, 0);
    assert!(report.pairs.is_empty());
}

#[test]
fn malformed_lines_are_skipped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_frames(dir.path(), 10, |_| format!("{NEAR_1}\nnot a label\n{NEAR_2}\n0 0.5\n"));

    let config = InteractionConfig::new(None, 1, 10).unwrap();
    let report = count_in_dir(dir.path(), &config).unwrap();
    assert_eq!(report.total_interactions, 1);
    assert_eq!(report.skipped_lines, 20);
}

#[test]
fn missing_label_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = InteractionConfig::new(None, 5, 6).unwrap();
    assert!(count_in_dir(dir.path().join("absent"), &config).is_err());
}

#[test]
fn true_positive_cleanup_removes_everything_else() {
    let dir = tempfile::tempdir().unwrap();
    let labels = dir.path().join("labels");
    fs::create_dir(&labels).unwrap();
    fs::write(
        labels.join("clip_1.txt"),
        "0 0.1 0.1 0.05 0.05 3\n0 0.2 0.2 0.05 0.05 1\n0 0.3 0.3 0.05 0.05 4\n0 0.4 0.4 0.05 0.05 2\n",
    )
    .unwrap();
    fs::write(labels.join("clip_2.txt"), "0 0.1 0.1 0.05 0.05 3\n0 0.3 0.3 0.05 0.05 4\n").unwrap();
    fs::write(labels.join("clip_10.txt"), "0 0.5 0.5 0.05 0.05 2\n").unwrap();

    assert_eq!(observed_identities(&labels).unwrap(), BTreeSet::from([1, 2, 3, 4]));

    let backup = default_backup_dir(&labels);
    assert_eq!(backup_label_dir(&labels, &backup).unwrap(), 3);

    let selection = IdSelection::from_lists("1,2", "").unwrap();
    let summary = apply_selection(&labels, &selection).unwrap();
    assert_eq!(summary.removed_ids, BTreeSet::from([3, 4]));
    assert_eq!(summary.files_rewritten, 3);
    assert_eq!(summary.lines_kept, 3);
    assert_eq!(summary.lines_removed, 4);

    assert_eq!(
        fs::read_to_string(labels.join("clip_1.txt")).unwrap(),
        "0 0.2 0.2 0.05 0.05 1\n0 0.4 0.4 0.05 0.05 2\n"
    );
    // Emptied files stay in place so frame alignment is preserved
    assert_eq!(fs::read_to_string(labels.join("clip_2.txt")).unwrap(), "");
    assert_eq!(observed_identities(&labels).unwrap(), BTreeSet::from([1, 2]));

    // The backup still holds the original census
    assert_eq!(observed_identities(&backup).unwrap(), BTreeSet::from([1, 2, 3, 4]));
}

#[test]
fn false_positive_cleanup_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write_frames(dir.path(), 3, |_| format!("{NEAR_1}\n{NEAR_2}\n{FAR_3}\n"));

    let selection = IdSelection::from_lists("", "3").unwrap();
    let first = apply_selection(dir.path(), &selection).unwrap();
    assert_eq!(first.lines_removed, 3);
    let snapshot = fs::read_to_string(dir.path().join("clip_0.txt")).unwrap();

    let second = apply_selection(dir.path(), &selection).unwrap();
    assert_eq!(second.lines_removed, 0);
    assert_eq!(fs::read_to_string(dir.path().join("clip_0.txt")).unwrap(), snapshot);
}

#[test]
fn rejected_selection_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let original = format!("{NEAR_1}\n{FAR_3}\n");
    write_frames(dir.path(), 2, |_| original.clone());

    let err: anyhow::Error = IdSelection::from_lists("", " ").unwrap_err().into();
    assert_eq!(err.downcast_ref::<ConfigError>(), Some(&ConfigError::NoIdInput));

    let err = IdSelection::from_lists("1", "3").unwrap_err();
    assert_eq!(err, ConfigError::ConflictingIdSets);

    for i in 0..2 {
        let text = fs::read_to_string(dir.path().join(format!("clip_{i}.txt"))).unwrap();
        assert_eq!(text, original);
    }
}
