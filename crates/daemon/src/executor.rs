//! Subprocess execution with live progress parsing and cancellation.
//!
//! The child runs in its own process group so cancellation can signal the
//! whole tree. Stdout and stderr are read concurrently line-by-line;
//! neither can block the other. Parsed progress flows through a channel
//! into the store's throttle, and the last 8 KiB of combined output is
//! kept for the job's error field on nonzero exit.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::planner::PlanTool;

/// How much combined output is kept for error reporting.
pub const OUTPUT_TAIL_BYTES: usize = 8 * 1024;

/// Grace period between SIGTERM and SIGKILL on cancellation.
pub const KILL_GRACE: Duration = Duration::from_secs(10);

/// Error type for executor operations
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one subprocess run.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Exit code; None when the child died to a signal.
    pub exit_code: Option<i32>,
    /// Whether the run ended because cancellation was requested.
    pub cancelled: bool,
    /// Last 8 KiB of combined stdout/stderr.
    pub output_tail: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

/// Which progress dialect the child speaks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressDialect {
    /// VideoTool-A prints `time=HH:MM:SS.ss`; percent is time over the
    /// probed container duration.
    Ffmpeg { duration_secs: f64 },
    /// VideoTool-B prints `Encoding: task N of M, P.PP %`.
    Handbrake,
}

impl ProgressDialect {
    pub fn for_tool(tool: PlanTool, duration_secs: f64) -> Self {
        match tool {
            PlanTool::Ffmpeg => ProgressDialect::Ffmpeg { duration_secs },
            PlanTool::Handbrake => ProgressDialect::Handbrake,
        }
    }
}

fn ffmpeg_time_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("static regex")
    })
}

fn handbrake_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"Encoding: task (\d+) of (\d+), (\d+(?:\.\d+)?) %")
            .expect("static regex")
    })
}

/// Extract a percentage from one output line, if it carries progress.
pub fn parse_progress(dialect: ProgressDialect, line: &str) -> Option<f64> {
    match dialect {
        ProgressDialect::Ffmpeg { duration_secs } => {
            if duration_secs <= 0.0 {
                return None;
            }
            let caps = ffmpeg_time_re().captures(line)?;
            let hours: f64 = caps[1].parse().ok()?;
            let minutes: f64 = caps[2].parse().ok()?;
            let seconds: f64 = caps[3].parse().ok()?;
            let elapsed = hours * 3600.0 + minutes * 60.0 + seconds;
            Some((elapsed / duration_secs * 100.0).clamp(0.0, 100.0))
        }
        ProgressDialect::Handbrake => {
            let caps = handbrake_re().captures(line)?;
            let task: f64 = caps[1].parse().ok()?;
            let total: f64 = caps[2].parse().ok()?;
            let pct: f64 = caps[3].parse().ok()?;
            if total < 1.0 || task < 1.0 {
                return None;
            }
            Some((((task - 1.0) + pct / 100.0) / total * 100.0).clamp(0.0, 100.0))
        }
    }
}

/// Bounded ring of output lines, trimmed to `OUTPUT_TAIL_BYTES`.
#[derive(Debug, Default)]
struct TailBuffer {
    lines: VecDeque<String>,
    bytes: usize,
}

impl TailBuffer {
    fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        // Keep at least the newest line even if it alone busts the budget
        while self.bytes > OUTPUT_TAIL_BYTES && self.lines.len() > 1 {
            if let Some(front) = self.lines.pop_front() {
                self.bytes -= front.len() + 1;
            }
        }
    }

    fn join(&self) -> String {
        self.lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Run an encode subprocess to completion.
///
/// Progress percentages are sent on `progress`; flipping `cancel` to true
/// sends SIGTERM to the child's process group, escalating to SIGKILL after
/// the grace period.
pub async fn run(
    program: &Path,
    args: &[String],
    cwd: &Path,
    dialect: ProgressDialect,
    progress: mpsc::Sender<f64>,
    mut cancel: watch::Receiver<bool>,
) -> Result<ExecOutcome, ExecError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        program: program.to_string_lossy().into_owned(),
        source,
    })?;
    let pid = child.id();

    let tail = Arc::new(Mutex::new(TailBuffer::default()));
    let stdout_task = child
        .stdout
        .take()
        .map(|out| spawn_reader(out, dialect, progress.clone(), tail.clone()));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| spawn_reader(err, dialect, progress.clone(), tail.clone()));

    let mut cancelled = false;
    let mut cancel_open = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            changed = cancel.changed(), if cancel_open => {
                match changed {
                    Ok(()) if *cancel.borrow() => {
                        cancelled = true;
                        if let Some(pid) = pid {
                            signal_group(pid, libc::SIGTERM);
                        }
                        match timeout(KILL_GRACE, child.wait()).await {
                            Ok(status) => break status?,
                            Err(_) => {
                                if let Some(pid) = pid {
                                    signal_group(pid, libc::SIGKILL);
                                }
                                break child.wait().await?;
                            }
                        }
                    }
                    Ok(()) => {}
                    Err(_) => cancel_open = false,
                }
            }
        }
    };

    // Let the readers drain whatever is left in the pipes
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let output_tail = tail.lock().unwrap().join();
    Ok(ExecOutcome {
        exit_code: status.code(),
        cancelled,
        output_tail,
    })
}

fn spawn_reader<R>(
    stream: R,
    dialect: ProgressDialect,
    progress: mpsc::Sender<f64>,
    tail: Arc<Mutex<TailBuffer>>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(pct) = parse_progress(dialect, &line) {
                let _ = progress.try_send(pct);
            }
            tail.lock().unwrap().push(line);
        }
    })
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) {
    // Negative pid addresses the whole process group
    unsafe {
        libc::kill(-(pid as i32), sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _sig: i32) {}
