//! runtime — the external detector/tracker subprocess
//!
//! The tracker is an opaque long-running command that writes label files. It
//! is owned by a [`TrackerProcess`] whose state moves `Idle → Running →
//! Stopped`; nothing else holds the child handle.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

/// Argument replaced by the video path when building the command line.
pub const VIDEO_PLACEHOLDER: &str = "{video}";

/// Program and arguments used to launch the tracker.
#[derive(Debug, Clone)]
pub struct TrackerCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl TrackerCommand {
    pub fn new<S: Into<OsString>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg<S: Into<OsString>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Arguments for a run on `video`: every `{video}` argument is replaced by
    /// the path; without a placeholder the path is appended.
    pub fn args_for(&self, video: &Path) -> Vec<OsString> {
        let mut substituted = false;
        let mut args: Vec<OsString> = self
            .args
            .iter()
            .map(|a| {
                if a == VIDEO_PLACEHOLDER {
                    substituted = true;
                    video.as_os_str().to_os_string()
                } else {
                    a.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(video.as_os_str().to_os_string());
        }
        args
    }
}

/// Observable state of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Running,
    Stopped,
}

/// Result of [`TrackerProcess::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A running tracker was terminated.
    Terminated,
    /// The tracker had already exited on its own.
    AlreadyFinished,
    /// No tracker was ever started.
    NotRunning,
}

enum Slot {
    Idle,
    Running(Child),
    Stopped(Option<ExitStatus>),
}

/// Owner of at most one tracker subprocess.
pub struct TrackerProcess {
    command: TrackerCommand,
    inherit_output: bool,
    slot: Slot,
}

impl TrackerProcess {
    pub fn new(command: TrackerCommand) -> Self {
        Self {
            command,
            inherit_output: true,
            slot: Slot::Idle,
        }
    }

    /// Discard the tracker's stdout/stderr instead of passing them through.
    pub fn quiet(mut self) -> Self {
        self.inherit_output = false;
        self
    }

    /// Current state, after checking whether a running child has exited.
    pub fn poll(&mut self) -> Result<TrackerState> {
        if let Slot::Running(child) = &mut self.slot {
            if let Some(status) = child.try_wait().context("failed to poll tracker process")? {
                info!(%status, "tracker process exited");
                self.slot = Slot::Stopped(Some(status));
            }
        }
        Ok(self.state())
    }

    /// State as last observed; does not touch the child.
    pub fn state(&self) -> TrackerState {
        match self.slot {
            Slot::Idle => TrackerState::Idle,
            Slot::Running(_) => TrackerState::Running,
            Slot::Stopped(_) => TrackerState::Stopped,
        }
    }

    /// Exit status of the last run, once it has stopped. `None` while running,
    /// before any run, or when the child was killed without a status.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self.slot {
            Slot::Stopped(status) => status,
            _ => None,
        }
    }

    /// Launch the tracker on `video`. Fails if a run is still in progress.
    pub fn start<P: AsRef<Path>>(&mut self, video: P) -> Result<u32> {
        if self.poll()? == TrackerState::Running {
            bail!("tracker is already running");
        }
        let video = video.as_ref();
        let args = self.command.args_for(video);
        let (out, err) = if self.inherit_output {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::null(), Stdio::null())
        };

        let child = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to launch tracker: {}",
                    self.command.program.to_string_lossy()
                )
            })?;

        let pid = child.id();
        info!(pid, video = %video.display(), "tracker process started");
        self.slot = Slot::Running(child);
        Ok(pid)
    }

    /// Terminate a running tracker and reap it.
    pub fn stop(&mut self) -> Result<StopOutcome> {
        match self.poll()? {
            TrackerState::Idle => Ok(StopOutcome::NotRunning),
            TrackerState::Stopped => Ok(StopOutcome::AlreadyFinished),
            TrackerState::Running => {
                let Slot::Running(child) = &mut self.slot else {
                    unreachable!("state() reported Running");
                };
                child.kill().context("failed to terminate tracker process")?;
                let status = child.wait().context("failed to reap tracker process")?;
                info!(%status, "tracker process stopped");
                self.slot = Slot::Stopped(Some(status));
                Ok(StopOutcome::Terminated)
            }
        }
    }

    /// Block until the running tracker exits.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        match &mut self.slot {
            Slot::Running(child) => {
                let status = child.wait().context("failed to wait for tracker process")?;
                self.slot = Slot::Stopped(Some(status));
                Ok(status)
            }
            Slot::Stopped(Some(status)) => Ok(*status),
            Slot::Stopped(None) | Slot::Idle => bail!("no tracker run to wait for"),
        }
    }
}

impl Drop for TrackerProcess {
    fn drop(&mut self) {
        if let Slot::Running(child) = &mut self.slot {
            if let Ok(None) = child.try_wait() {
                warn!(pid = child.id(), "killing tracker process left running");
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    #[test]
    fn test_args_for_placeholder() {
        let cmd = TrackerCommand::new("python")
            .arg("run_tracking.py")
            .arg(VIDEO_PLACEHOLDER)
            .arg("0");
        let args = cmd.args_for(Path::new("uploads/video.mp4"));
        assert_eq!(args, vec![OsString::from("run_tracking.py"), "uploads/video.mp4".into(), "0".into()]);
    }

    #[test]
    fn test_args_for_appends_without_placeholder() {
        let cmd = TrackerCommand::new("track").arg("--fast");
        let args = cmd.args_for(&PathBuf::from("v.mp4"));
        assert_eq!(args, vec![OsString::from("--fast"), "v.mp4".into()]);
    }

    #[test]
    fn test_lifecycle_stop_running() {
        let mut tracker = TrackerProcess::new(TrackerCommand::new("sleep").arg("30").arg("{video}")).quiet();
        assert_eq!(tracker.state(), TrackerState::Idle);
        assert_eq!(tracker.stop().unwrap(), StopOutcome::NotRunning);

        // `sleep 30 5`: the video argument doubles as a second duration
        tracker.start("5").unwrap();
        assert_eq!(tracker.poll().unwrap(), TrackerState::Running);
        assert!(tracker.start("5").is_err());

        assert_eq!(tracker.stop().unwrap(), StopOutcome::Terminated);
        assert_eq!(tracker.state(), TrackerState::Stopped);
        assert_eq!(tracker.stop().unwrap(), StopOutcome::AlreadyFinished);
    }

    #[test]
    fn test_lifecycle_natural_exit() {
        let mut tracker = TrackerProcess::new(TrackerCommand::new("true").arg("{video}")).quiet();
        tracker.start("ignored.mp4").unwrap();
        assert_eq!(tracker.exit_status(), None);
        let status = tracker.wait().unwrap();
        assert!(status.success());
        assert_eq!(tracker.poll().unwrap(), TrackerState::Stopped);
        assert_eq!(tracker.exit_status(), Some(status));
        assert_eq!(tracker.stop().unwrap(), StopOutcome::AlreadyFinished);

        // A finished run can be followed by another
        tracker.start("again.mp4").unwrap();
        assert!(tracker.wait().unwrap().success());
    }

    #[test]
    fn test_drop_kills_running_tracker() {
        let mut tracker = TrackerProcess::new(TrackerCommand::new("sleep").arg("{video}")).quiet();
        let pid = tracker.start("30").unwrap();
        assert_eq!(tracker.poll().unwrap(), TrackerState::Running);

        let started = Instant::now();
        drop(tracker);
        assert!(started.elapsed() < Duration::from_secs(5));

        // Reaped, so the pid no longer has a process entry
        if cfg!(target_os = "linux") {
            assert!(!Path::new(&format!("/proc/{pid}")).exists());
        }
    }

    #[test]
    fn test_missing_program_fails_to_start() {
        let mut tracker = TrackerProcess::new(TrackerCommand::new("/nonexistent/tracker-binary")).quiet();
        assert!(tracker.start("v.mp4").is_err());
        assert_eq!(tracker.state(), TrackerState::Idle);
    }
}
