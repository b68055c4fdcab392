//! Daemon startup and wiring.
//!
//! Builds the validated settings, resolves the external tools, opens the
//! store, recovers orphaned jobs, and runs the worker next to the HTTP
//! server until a shutdown signal lands.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::command_guard::{resolve_executable, CommandGuardError, EncodeSettings};
use crate::planner::Toolchain;
use crate::probe::{detect_gpu_caps, GpuCaps};
use crate::server::{create_router, AppState, ServerError};
use crate::store::{Store, StoreError};
use crate::worker::{new_shared_phase, SharedPhase, Worker};
use ripline_config::Config;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Settings failed allowlist validation
    #[error("invalid settings: {0}")]
    Settings(#[from] CommandGuardError),

    /// Store error during startup
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Server error
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// IO error (e.g., directory creation)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Creates the directories the daemon needs: the raw and work roots, the
/// classified output tree, and the database parent.
pub fn create_required_directories(config: &Config) -> Result<(), io::Error> {
    fs::create_dir_all(&config.paths.raw_path)?;
    fs::create_dir_all(&config.paths.work_path)?;
    for subdir in [
        &config.subdirs.movies,
        &config.subdirs.tv,
        &config.subdirs.audio,
    ] {
        fs::create_dir_all(config.paths.completed_path.join(subdir))?;
    }
    if let Some(parent) = config.paths.db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Daemon state containing all runtime components
pub struct Daemon {
    pub config: Config,
    pub settings: EncodeSettings,
    pub toolchain: Toolchain,
    pub caps: GpuCaps,
    pub store: Arc<Store>,
    wake: Arc<Notify>,
    phase: SharedPhase,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Daemon {
    /// Full startup sequence: validate settings, resolve tools, detect
    /// hardware, create directories, open the store.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        let settings = EncodeSettings::from_config(&config.encoding)?;

        let ffmpeg = resolve_executable("ffmpeg")?;
        let ffprobe = resolve_executable("ffprobe")?;
        let handbrake = match resolve_executable("HandBrakeCLI") {
            Ok(path) => Some(path),
            Err(_) => {
                warn!("HandBrakeCLI not found, preset path disabled");
                None
            }
        };
        let toolchain = Toolchain {
            ffmpeg,
            ffprobe,
            handbrake,
        };

        let caps = detect_gpu_caps(&toolchain.ffmpeg, &settings.vaapi_device);
        info!(
            nvenc = caps.nvenc,
            vaapi = caps.vaapi,
            qsv = caps.qsv,
            amf = caps.amf,
            "encoder hardware detected"
        );

        Self::assemble(config, settings, toolchain, caps)
    }

    /// Construct without resolving tools or probing hardware. The tool
    /// names are used as-is and every family is assumed present.
    pub fn new_unchecked(config: Config) -> Result<Self, DaemonError> {
        let settings = EncodeSettings::from_config(&config.encoding)?;
        let toolchain = Toolchain {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            handbrake: Some(PathBuf::from("HandBrakeCLI")),
        };
        Self::assemble(config, settings, toolchain, GpuCaps::all())
    }

    fn assemble(
        config: Config,
        settings: EncodeSettings,
        toolchain: Toolchain,
        caps: GpuCaps,
    ) -> Result<Self, DaemonError> {
        create_required_directories(&config)?;
        let store = Arc::new(Store::open(&config.paths.db_path)?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            settings,
            toolchain,
            caps,
            store,
            wake: Arc::new(Notify::new()),
            phase: new_shared_phase(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Shared state for the HTTP handlers.
    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.store.clone(),
            &self.config.auth,
            self.config.runtime.max_retry_count,
            self.wake.clone(),
            self.phase.clone(),
        )
    }

    /// Run the daemon: orphan recovery, worker task, HTTP server. Returns
    /// after a shutdown signal once the worker has parked its job.
    pub async fn run(self) -> Result<(), DaemonError> {
        let recovered = self.store.recover_orphans()?;
        if recovered > 0 {
            info!(count = recovered, "requeued jobs interrupted by restart");
        }

        let worker = Worker::new(
            self.store.clone(),
            self.config.clone(),
            self.settings.clone(),
            self.toolchain.clone(),
            self.caps,
            self.wake.clone(),
            self.shutdown_rx.clone(),
            self.phase.clone(),
        );
        let worker_handle = tokio::spawn(worker.run());

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });

        let app = create_router(self.app_state());
        let listener = tokio::net::TcpListener::bind(&self.config.server.bind_addr)
            .await
            .map_err(ServerError::BindError)?;
        info!(addr = %self.config.server.bind_addr, "http server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            })
            .await
            .map_err(ServerError::BindError)?;

        let _ = worker_handle.await;
        Ok(())
    }

    /// Flip the shutdown flag; the worker parks its job and the server
    /// drains.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
