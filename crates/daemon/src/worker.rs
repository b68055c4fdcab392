//! The single-flight worker driving jobs through their lifecycle.
//!
//! One background task claims the oldest PENDING job and walks it through
//! stabilize, resolve, admit, plan, execute, publish, and cleanup. Every
//! failure is converted into a taxonomy kind on the job row; nothing a
//! single job does can take the loop down. Infrastructure errors back off
//! exponentially and the loop retries.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::Disks;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{error, info, warn};

use crate::command_guard::EncodeSettings;
use crate::error::ErrorKind;
use crate::executor::{self, ProgressDialect};
use crate::path_guard::{self, PathGuardError};
use crate::planner::{self, Classification, Toolchain};
use crate::probe::{self, GpuCaps};
use crate::publish;
use crate::stability::{self, StabilizeOutcome};
use crate::store::{Job, JobStatus, Store};
use ripline_config::Config;

/// What the worker is doing right now, surfaced by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Running,
    Stopped,
}

impl WorkerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerPhase::Idle => "idle",
            WorkerPhase::Running => "running",
            WorkerPhase::Stopped => "stopped",
        }
    }
}

/// Shared view of the worker phase.
pub type SharedPhase = Arc<Mutex<WorkerPhase>>;

pub fn new_shared_phase() -> SharedPhase {
    Arc::new(Mutex::new(WorkerPhase::Idle))
}

/// Bytes that must be free before a transcode is admitted: 60% of the
/// source size on top of the configured floor.
pub fn required_bytes(source_size: u64, minimum_free_space_gb: u64) -> u64 {
    (source_size as f64 * 0.6) as u64 + minimum_free_space_gb * 1024 * 1024 * 1024
}

/// Free space on the filesystem holding `path`, from the mounted-disk
/// list. None when no mount point matches.
pub fn available_space_at(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Total size of all files under a directory.
fn tree_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

pub struct Worker {
    store: Arc<Store>,
    config: Config,
    settings: EncodeSettings,
    toolchain: Toolchain,
    caps: GpuCaps,
    wake: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
    phase: SharedPhase,
    // Stabilization timing, shortened in tests
    stabilize_window: Duration,
    sample_interval: Duration,
    stabilize_ceiling: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        config: Config,
        settings: EncodeSettings,
        toolchain: Toolchain,
        caps: GpuCaps,
        wake: Arc<Notify>,
        shutdown: watch::Receiver<bool>,
        phase: SharedPhase,
    ) -> Self {
        let stabilize_window = Duration::from_secs(config.runtime.stabilize_seconds);
        Self {
            store,
            config,
            settings,
            toolchain,
            caps,
            wake,
            shutdown,
            phase,
            stabilize_window,
            sample_interval: stability::SAMPLE_INTERVAL,
            stabilize_ceiling: stability::HARD_CEILING,
        }
    }

    fn set_phase(&self, phase: WorkerPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    /// The worker loop: claim, drive, repeat. Returns when shutdown is
    /// signalled.
    pub async fn run(mut self) {
        let mut store_failures: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.store.claim_next() {
                Ok(Some(job)) => {
                    store_failures = 0;
                    self.set_phase(WorkerPhase::Running);
                    info!(job_id = job.id, title = %job.title, "job claimed");
                    self.process(job).await;
                    self.set_phase(WorkerPhase::Idle);
                }
                Ok(None) => {
                    store_failures = 0;
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = wait_shutdown(&mut self.shutdown) => {}
                    }
                }
                Err(e) => {
                    // Infrastructure trouble: back off, never crash the loop
                    store_failures = store_failures.saturating_add(1);
                    let delay = backoff_delay(store_failures);
                    error!(error = %e, retry_in_secs = delay.as_secs(), "store unavailable");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_shutdown(&mut self.shutdown) => {}
                    }
                }
            }
        }

        self.set_phase(WorkerPhase::Stopped);
    }

    /// Drive one claimed job to a terminal state (or back to PENDING on
    /// shutdown).
    async fn process(&mut self, job: Job) {
        let candidate = self.config.paths.raw_path.join(&job.source_hint);

        // STABILIZING: wait for the rip to stop changing
        let stabilize = stability::wait_for_stable(
            &candidate,
            self.stabilize_window,
            self.sample_interval,
            self.stabilize_ceiling,
        );
        tokio::pin!(stabilize);
        let mut shutdown = self.shutdown.clone();
        let outcome = tokio::select! {
            outcome = &mut stabilize => outcome,
            _ = wait_shutdown(&mut shutdown) => {
                self.park_for_shutdown(job.id);
                return;
            }
        };
        match outcome {
            StabilizeOutcome::Stable => {}
            StabilizeOutcome::Missing => {
                self.fail(&job, ErrorKind::Missing, "source directory never appeared");
                return;
            }
            StabilizeOutcome::Unstable => {
                self.fail(&job, ErrorKind::Unstable, "source kept changing past the ceiling");
                return;
            }
        }

        // RESOLVING: containment-checked canonical path
        let source = match path_guard::resolve(&self.config.paths.raw_path, &job.source_hint) {
            Ok(path) => path,
            Err(PathGuardError::NotFound(p)) => {
                self.fail(&job, ErrorKind::Missing, &format!("not found: {}", p.display()));
                return;
            }
            Err(e) => {
                self.fail(&job, ErrorKind::Missing, &e.to_string());
                return;
            }
        };
        if let Err(e) = self.store.set_source_resolved(job.id, &source) {
            error!(job_id = job.id, error = %e, "failed to record resolved source");
        }

        // Classification decides the whole downstream path
        let classification = match planner::classify_source(&source, &job.title) {
            Ok(c) => c,
            Err(e) => {
                self.fail(&job, ErrorKind::Missing, &e.to_string());
                return;
            }
        };

        if classification == Classification::Audio {
            self.process_audio(&job, &source).await;
            return;
        }

        // ADMIT: free-space check on the work filesystem
        let source_size = tree_size(&source);
        let required = required_bytes(source_size, self.config.runtime.minimum_free_space_gb);
        match available_space_at(&self.config.paths.work_path) {
            Some(free) if free < required => {
                self.fail(
                    &job,
                    ErrorKind::Nospace,
                    &format!("need {} bytes free, have {}", required, free),
                );
                return;
            }
            Some(_) => {}
            None => {
                warn!(
                    path = %self.config.paths.work_path.display(),
                    "no disk matches work path, skipping space check"
                );
            }
        }

        self.process_video(&job, &source, classification).await;
    }

    /// Audio passthrough: copy every track, no encoder involved.
    async fn process_audio(&self, job: &Job, source: &Path) {
        if let Err(e) = self.store.set_plan(job.id, Classification::Audio, self.settings.video.family()) {
            error!(job_id = job.id, error = %e, "failed to record plan");
        }

        let files = planner::list_audio_files(source);
        let dest_dir = self
            .config
            .paths
            .completed_path
            .join(&self.config.subdirs.audio)
            .join(publish::clean_title(&job.title));

        match publish::publish_audio_files(&files, &dest_dir) {
            Ok(out) => {
                info!(job_id = job.id, output = %out.display(), "audio published");
                self.finish_ok(job, &out);
            }
            Err(e) => {
                self.fail(job, ErrorKind::Publish, &e.to_string());
            }
        }
    }

    /// The full transcode path: plan, execute, publish, clean up.
    async fn process_video(&mut self, job: &Job, source: &Path, classification: Classification) {
        // PLANNING
        let main_video = match planner::find_main_video(source) {
            Ok(p) => p,
            Err(e) => {
                self.fail(job, ErrorKind::Missing, &e.to_string());
                return;
            }
        };
        let info = match probe::probe_media(&self.toolchain.ffprobe, &main_video) {
            Ok(info) => info,
            Err(e) => {
                self.fail(job, ErrorKind::Encode, &format!("probe failed: {}", e));
                return;
            }
        };

        let scratch = self.config.paths.work_path.join(format!("job_{}", job.id));
        if let Err(e) = std::fs::create_dir_all(&scratch) {
            self.fail(job, ErrorKind::Nospace, &format!("scratch dir: {}", e));
            return;
        }

        let cleaned = publish::clean_title(&job.title);
        let artifact = scratch.join(format!("{}.mkv", cleaned));
        let (plan, fallback_warning) = planner::plan_encode(
            &self.settings,
            self.caps,
            &info,
            &self.toolchain,
            &main_video,
            &artifact,
        );
        if let Some(warning) = fallback_warning {
            warn!(job_id = job.id, "{}", warning);
        }
        if let Err(e) = self.store.set_plan(job.id, classification, plan.family()) {
            error!(job_id = job.id, error = %e, "failed to record plan");
        }
        info!(
            job_id = job.id,
            tool = ?plan.tool,
            encoder = plan.encoder.as_str(),
            "executing encode"
        );

        // EXECUTING: progress flows through the store's throttle
        let (progress_tx, mut progress_rx) = mpsc::channel::<f64>(64);
        let progress_store = self.store.clone();
        let progress_job_id = job.id;
        let progress_task = tokio::spawn(async move {
            while let Some(pct) = progress_rx.recv().await {
                if let Err(e) = progress_store.update_progress(progress_job_id, pct) {
                    warn!(job_id = progress_job_id, error = %e, "progress update failed");
                }
            }
        });

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut shutdown_rx = self.shutdown.clone();
        let cancel_task = tokio::spawn(async move {
            wait_shutdown(&mut shutdown_rx).await;
            let _ = cancel_tx.send(true);
        });

        let dialect = ProgressDialect::for_tool(plan.tool, info.duration_secs);
        let result = executor::run(
            &plan.program,
            &plan.args,
            &scratch,
            dialect,
            progress_tx,
            cancel_rx,
        )
        .await;
        cancel_task.abort();
        let _ = progress_task.await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&scratch);
                self.fail(job, ErrorKind::Encode, &e.to_string());
                return;
            }
        };

        if outcome.cancelled {
            let _ = std::fs::remove_dir_all(&scratch);
            self.park_for_shutdown(job.id);
            return;
        }
        if !outcome.success() {
            let _ = std::fs::remove_dir_all(&scratch);
            let message = format!(
                "encoder exited with {:?}: {}",
                outcome.exit_code, outcome.output_tail
            );
            self.fail(job, ErrorKind::Encode, &message);
            return;
        }

        // PUBLISHING
        let subdir = match classification {
            Classification::Movie => &self.config.subdirs.movies,
            Classification::Tv => &self.config.subdirs.tv,
            Classification::Audio => &self.config.subdirs.audio,
        };
        let dest_dir = self.config.paths.completed_path.join(subdir);
        let published =
            match publish::publish_artifact(&artifact, &dest_dir, &format!("{}.mkv", cleaned)) {
                Ok(path) => path,
                Err(e) => {
                    let _ = std::fs::remove_dir_all(&scratch);
                    self.fail(job, ErrorKind::Publish, &e.to_string());
                    return;
                }
            };

        // CLEANUP: scratch always goes; the source only when configured.
        // Cleanup failures never fail the job.
        let _ = std::fs::remove_dir_all(&scratch);
        if self.config.runtime.delete_source {
            publish::cleanup_source(source);
        }

        info!(job_id = job.id, output = %published.display(), "job completed");
        self.finish_ok(job, &published);
    }

    fn finish_ok(&self, job: &Job, output: &Path) {
        if let Err(e) = self
            .store
            .finish(job.id, JobStatus::Completed, None, None, Some(output))
        {
            error!(job_id = job.id, error = %e, "failed to record completion");
        }
    }

    /// Record a failure, escalating to `retry_exhausted` when the retry
    /// budget is already spent.
    fn fail(&self, job: &Job, kind: ErrorKind, message: &str) {
        let kind = if job.retry_count >= self.config.runtime.max_retry_count {
            ErrorKind::RetryExhausted
        } else {
            kind
        };
        warn!(job_id = job.id, kind = kind.as_str(), error = message, "job failed");
        if let Err(e) =
            self.store
                .finish(job.id, JobStatus::Failed, Some(kind), Some(message), None)
        {
            error!(job_id = job.id, error = %e, "failed to record failure");
        }
    }

    /// Shutdown while mid-job: back to PENDING with the shutdown marker,
    /// retry counter untouched.
    fn park_for_shutdown(&self, job_id: i64) {
        info!(job_id, "parking job for shutdown");
        if let Err(e) = self.store.reset_to_pending(job_id, ErrorKind::Shutdown) {
            error!(job_id, error = %e, "failed to park job");
        }
    }
}

/// Resolve once the shutdown flag flips to true; never resolves if the
/// sender is dropped without signalling.
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Exponential backoff for store failures, capped at 30 seconds.
fn backoff_delay(failures: u32) -> Duration {
    let millis = 500u64.saturating_mul(1u64 << failures.min(6));
    Duration::from_millis(millis.min(30_000))
}
