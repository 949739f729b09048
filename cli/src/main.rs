use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use antlab_core::{
    cleanup::{apply_selection, backup_label_dir, default_backup_dir, most_recent_run},
    config::{Band, IdSelection, InteractionConfig, Point},
    interaction::count_in_dir,
    pipeline::render_annotated,
    rendering::BoxPainter,
    runtime::{TrackerCommand, TrackerProcess, TrackerState},
    trajectory::{distance_series, DistanceOptions},
    video::probe,
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "antlab",
    version,
    about = "Post-processing for ant tracking runs: interaction counts, false-positive cleanup, annotated video",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the label files live: a label directory, or a runs directory whose
/// newest `track*` run holds them under `labels/`.
#[derive(Args)]
#[command(group(ArgGroup::new("source").required(true).args(["labels", "runs"])))]
struct LabelSource {
    /// Directory of per-frame label files
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Tracker output directory; the most recent `track*` run is used
    #[arg(long)]
    runs: Option<PathBuf>,
}

#[derive(Args)]
struct RenderArgs {
    /// TrueType font for the `ID:<n>` labels (boxes only without one)
    #[arg(long)]
    font: Option<PathBuf>,

    /// Label coordinates are pixels rather than fractions of the frame
    #[arg(long)]
    pixel_coords: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Count distinct pairwise interactions between tracked ants.
    Interactions {
        #[command(flatten)]
        source: LabelSource,

        /// Largest gap in frames still merged into the same interaction
        #[arg(long)]
        merge_tolerance: usize,

        /// Minimum frame span for a merged segment to count
        #[arg(long)]
        min_segment_length: usize,

        /// Only count detections strictly inside this horizontal band, as MIN,MAX
        #[arg(long, allow_hyphen_values = true)]
        band: Option<Band>,

        /// Write the full report as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Remove false-positive identities from the label files in place.
    Clean {
        #[command(flatten)]
        source: LabelSource,

        /// Comma-separated IDs to keep; every other observed ID is removed
        #[arg(long)]
        true_positives: Option<String>,

        /// Comma-separated IDs to remove
        #[arg(long)]
        false_positives: Option<String>,

        /// Copy the label directory to `<labels>_backup` before rewriting
        #[arg(long)]
        backup: bool,

        /// Re-render this video with the cleaned labels
        #[arg(long, requires = "output")]
        video: Option<PathBuf>,

        /// Output path for the re-rendered video
        #[arg(short, long, requires = "video")]
        output: Option<PathBuf>,

        #[command(flatten)]
        render: RenderArgs,

        /// Write the filter summary as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Burn the label boxes into a copy of the video.
    Render {
        #[command(flatten)]
        source: LabelSource,

        /// Source video
        #[arg(long)]
        video: PathBuf,

        /// Output video path
        #[arg(short, long, default_value = "annotated.mp4")]
        output: PathBuf,

        #[command(flatten)]
        render: RenderArgs,
    },

    /// Copy a label directory aside.
    Backup {
        #[command(flatten)]
        source: LabelSource,

        /// Destination directory (default `<labels>_backup`)
        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// Distances of two ants to a larva position over time.
    Distance {
        #[command(flatten)]
        source: LabelSource,

        /// Larva position as X,Y in label coordinates
        #[arg(long, allow_hyphen_values = true)]
        larva: Point,

        /// Use every N-th label file
        #[arg(long, default_value_t = 60)]
        interval: usize,

        /// Replace values further than F median absolute deviations from the median
        #[arg(long)]
        mad_factor: Option<f64>,

        /// Write the series as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Run the external tracker on a video and wait for it to finish.
    Track {
        /// Video handed to the tracker (replaces a `{video}` argument)
        #[arg(long)]
        video: PathBuf,

        /// Tracker program and its arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Interactions {
            source,
            merge_tolerance,
            min_segment_length,
            band,
            json,
        } => cmd_interactions(source, merge_tolerance, min_segment_length, band, json),
        Commands::Clean {
            source,
            true_positives,
            false_positives,
            backup,
            video,
            output,
            render,
            json,
        } => cmd_clean(
            source,
            true_positives,
            false_positives,
            backup,
            video.zip(output),
            render,
            json,
        ),
        Commands::Render {
            source,
            video,
            output,
            render,
        } => cmd_render(source, video, output, render),
        Commands::Backup { source, dest } => cmd_backup(source, dest),
        Commands::Distance {
            source,
            larva,
            interval,
            mad_factor,
            json,
        } => cmd_distance(source, larva, interval, mad_factor, json),
        Commands::Track { video, command } => cmd_track(video, command),
    }
}

// ── Interactions ──────────────────────────────────────────────────────────────

fn cmd_interactions(
    source: LabelSource,
    merge_tolerance: usize,
    min_segment_length: usize,
    band: Option<Band>,
    json: Option<PathBuf>,
) -> Result<()> {
    let config = InteractionConfig::new(band, merge_tolerance, min_segment_length)?;
    let labels = source.resolve()?;

    let report = count_in_dir(&labels, &config)?;
    if let Some(path) = json {
        write_json(&path, &report)?;
    }

    println!(
        "{} interactions across {} pairs in {} frames",
        report.total_interactions,
        report.pairs.len(),
        report.frames_processed
    );
    if report.skipped_lines > 0 {
        warn!(skipped = report.skipped_lines, "malformed label lines were ignored");
    }
    Ok(())
}

// ── False-positive cleanup ────────────────────────────────────────────────────

fn cmd_clean(
    source: LabelSource,
    true_positives: Option<String>,
    false_positives: Option<String>,
    backup: bool,
    rerender: Option<(PathBuf, PathBuf)>,
    render: RenderArgs,
    json: Option<PathBuf>,
) -> Result<()> {
    // Everything that can be rejected is checked before the first rewrite
    let selection = IdSelection::from_lists(
        true_positives.as_deref().unwrap_or(""),
        false_positives.as_deref().unwrap_or(""),
    )?;
    let labels = source.resolve()?;
    let painter = match &rerender {
        Some((video, _)) => {
            probe(video).with_context(|| format!("cannot re-render {}", video.display()))?;
            Some(render.painter()?)
        }
        None => None,
    };

    if backup {
        let dest = default_backup_dir(&labels);
        let copied = backup_label_dir(&labels, &dest)?;
        info!("backed up {copied} files to {}", dest.display());
    }

    let summary = apply_selection(&labels, &selection)?;
    if let Some(path) = json {
        write_json(&path, &summary)?;
    }
    println!(
        "removed IDs {:?}: {} lines dropped, {} kept across {} files",
        summary.removed_ids, summary.lines_removed, summary.lines_kept, summary.files_rewritten
    );

    if let (Some((video, output)), Some(painter)) = (rerender, painter) {
        rerender_video(&video, &labels, &output, painter)?;
    }
    Ok(())
}

// ── Re-render ─────────────────────────────────────────────────────────────────

fn cmd_render(source: LabelSource, video: PathBuf, output: PathBuf, render: RenderArgs) -> Result<()> {
    let labels = source.resolve()?;
    let painter = render.painter()?;
    rerender_video(&video, &labels, &output, painter)
}

fn rerender_video(video: &Path, labels: &Path, output: &Path, painter: BoxPainter) -> Result<()> {
    info!("Annotated re-render");
    info!("  video  : {}", video.display());
    info!("  labels : {}", labels.display());
    info!("  output : {}", output.display());

    let pb = spinner("Rendering annotated video…");
    let pb2 = pb.clone();

    let summary = render_annotated(video, labels, output, painter, move |done, total| {
        if total > 0 && pb2.length() != Some(total) {
            pb2.set_length(total);
            pb2.set_style(bar_style());
        }
        pb2.set_position(done);
    })
    .context("annotated re-render failed")?;

    pb.finish_with_message(format!(
        "Wrote {} frames to {}",
        summary.frames_written,
        summary.output.display()
    ));
    Ok(())
}

// ── Backup ────────────────────────────────────────────────────────────────────

fn cmd_backup(source: LabelSource, dest: Option<PathBuf>) -> Result<()> {
    let labels = source.resolve()?;
    let dest = dest.unwrap_or_else(|| default_backup_dir(&labels));
    let copied = backup_label_dir(&labels, &dest)?;
    println!("copied {copied} files to {}", dest.display());
    Ok(())
}

// ── Trajectory distances ──────────────────────────────────────────────────────

fn cmd_distance(
    source: LabelSource,
    larva: Point,
    interval: usize,
    mad_factor: Option<f64>,
    json: Option<PathBuf>,
) -> Result<()> {
    let options = DistanceOptions::new(interval, mad_factor)?;
    let labels = source.resolve()?;

    let series = distance_series(&labels, larva, options)?;
    if let Some(path) = json {
        write_json(&path, &series)?;
    }

    println!(
        "{} sampled frames; ant 1 IDs {:?}, ant 2 IDs {:?}",
        series.frames.len(),
        series.ant1_ids,
        series.ant2_ids
    );
    for (name, values) in [
        ("ant1-larva", &series.ant1_larva),
        ("ant2-larva", &series.ant2_larva),
        ("ant1-ant2", &series.ant1_ant2),
    ] {
        if let Some(mean) = mean(values) {
            println!("  {name:<10} mean {mean:.2}");
        }
    }
    Ok(())
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

// ── External tracker ──────────────────────────────────────────────────────────

fn cmd_track(video: PathBuf, command: Vec<String>) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("no tracker command given");
    };
    let cmd = args
        .iter()
        .fold(TrackerCommand::new(program), |cmd, a| cmd.arg(a));

    let mut tracker = TrackerProcess::new(cmd);
    tracker.start(&video)?;

    let pb = spinner("Tracking…");
    while tracker.poll()? == TrackerState::Running {
        std::thread::sleep(Duration::from_millis(200));
    }
    let status = tracker.wait()?;

    if !status.success() {
        pb.abandon_with_message("Tracker failed.");
        bail!("tracker exited with {status}");
    }
    pb.finish_with_message("Tracking finished.");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

impl LabelSource {
    fn resolve(&self) -> Result<PathBuf> {
        match (&self.labels, &self.runs) {
            (Some(labels), _) => Ok(labels.clone()),
            (None, Some(runs)) => {
                let run = most_recent_run(runs)?
                    .with_context(|| format!("no track* run found in {}", runs.display()))?;
                info!(run = %run.display(), "using most recent tracking run");
                Ok(run.join("labels"))
            }
            (None, None) => bail!("either --labels or --runs is required"),
        }
    }
}

impl RenderArgs {
    fn painter(&self) -> Result<BoxPainter> {
        let painter = BoxPainter::new(!self.pixel_coords);
        match &self.font {
            Some(font) => painter.with_font(font),
            None => Ok(painter),
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialise report")?;
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "report written");
    Ok(())
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}/{len} frames ({eta})")
        .unwrap()
        .progress_chars("=> ")
}
