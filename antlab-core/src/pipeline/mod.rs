use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::labels::{list_label_files, read_frame};
use crate::rendering::BoxPainter;
use crate::video::{probe, transcode_with_progress, RgbFrame};

/// Replays label files onto decoded frames.
///
/// Alignment is positional: the n-th label file in frame order belongs to the
/// n-th decoded frame. Frames past the last label file pass through
/// unannotated; label files past the last frame are never read.
pub struct Annotator {
    label_files: Vec<PathBuf>,
    painter: BoxPainter,
    prof_frames: u64,
    prof_read: Duration,
    prof_paint: Duration,
}

impl Annotator {
    pub fn new(label_files: Vec<PathBuf>, painter: BoxPainter) -> Self {
        Self {
            label_files,
            painter,
            prof_frames: 0,
            prof_read: Duration::ZERO,
            prof_paint: Duration::ZERO,
        }
    }

    pub fn open<P: AsRef<Path>>(labels_dir: P, painter: BoxPainter) -> Result<Self> {
        Ok(Self::new(list_label_files(labels_dir)?, painter))
    }

    /// Label file for decoded frame `index`, if any.
    pub fn label_for(&self, index: usize) -> Option<&Path> {
        self.label_files.get(index).map(PathBuf::as_path)
    }

    pub fn label_count(&self) -> usize {
        self.label_files.len()
    }

    pub fn annotate(&mut self, frame: &mut RgbFrame) -> Result<()> {
        self.prof_frames += 1;
        let Some(path) = self.label_files.get(frame.index) else {
            return Ok(());
        };

        let read_start = Instant::now();
        let labels = read_frame(frame.index, path)?;
        self.prof_read += read_start.elapsed();

        let paint_start = Instant::now();
        self.painter
            .paint(frame, &labels.detections)
            .with_context(|| format!("failed to annotate frame {}", frame.index))?;
        self.prof_paint += paint_start.elapsed();

        if self.prof_frames % 300 == 0 {
            tracing::info!(
                frames = self.prof_frames,
                read_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_read.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                paint_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_paint.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                "annotate timings"
            );
        }
        Ok(())
    }
}

/// Outcome of an annotated re-render.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RenderSummary {
    pub output: PathBuf,
    pub frames_written: u64,
    pub label_files: usize,
}

/// Re-render `video` with the boxes from `labels_dir` burned in.
///
/// The source video is probed first so an unreadable input fails before any
/// output is created.
pub fn render_annotated<P, Q, R, G>(
    video: P,
    labels_dir: Q,
    output: R,
    painter: BoxPainter,
    progress_fn: G,
) -> Result<RenderSummary>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    R: AsRef<Path>,
    G: FnMut(u64, u64),
{
    let (video, output) = (video.as_ref(), output.as_ref());
    let info = probe(video)?;
    let mut annotator = Annotator::open(labels_dir, painter)?;
    let label_files = annotator.label_count();

    if info.frames > 0 && info.frames != label_files as u64 {
        tracing::warn!(
            video_frames = info.frames,
            label_files,
            "label file count differs from video frame count; boxes are aligned by position"
        );
    }
    tracing::info!(
        video = %video.display(),
        output = %output.display(),
        width = info.width,
        height = info.height,
        fps = info.fps,
        label_files,
        "rendering annotated video"
    );

    let frames_written = transcode_with_progress(
        video,
        output,
        info.frames,
        |frame| annotator.annotate(frame),
        progress_fn,
    )?;

    Ok(RenderSummary {
        output: output.to_path_buf(),
        frames_written,
        label_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendering::BOX_COLOR;
    use std::fs;

    fn blank(index: usize) -> RgbFrame {
        RgbFrame {
            data: vec![0; 20 * 20 * 3],
            width: 20,
            height: 20,
            pts: index as i64,
            index,
        }
    }

    fn lit(frame: &RgbFrame) -> bool {
        frame.data.chunks_exact(3).any(|px| px == BOX_COLOR)
    }

    #[test]
    fn test_frames_align_by_position() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("v_1.txt"), "0 0.5 0.5 0.5 0.5 1\n").unwrap();
        fs::write(dir.path().join("v_2.txt"), "").unwrap();
        fs::write(dir.path().join("v_10.txt"), "0 0.5 0.5 0.5 0.5 2\n").unwrap();

        let mut annotator = Annotator::open(dir.path(), BoxPainter::new(true)).unwrap();
        assert_eq!(annotator.label_for(2), Some(dir.path().join("v_10.txt").as_path()));
        assert_eq!(annotator.label_for(3), None);

        let mut frames: Vec<RgbFrame> = (0..5).map(blank).collect();
        for f in &mut frames {
            annotator.annotate(f).unwrap();
        }
        let painted: Vec<bool> = frames.iter().map(lit).collect();
        // Frame 1 has an empty label file; frames 3 and 4 have none at all.
        assert_eq!(painted, vec![true, false, true, false, false]);
    }

    #[test]
    fn test_unreadable_label_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut annotator = Annotator::new(vec![dir.path().join("gone.txt")], BoxPainter::new(true));
        assert!(annotator.annotate(&mut blank(0)).is_err());
    }
}
