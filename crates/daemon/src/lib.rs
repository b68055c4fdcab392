//! Ripline
//!
//! Durable transcoding-job daemon: accepts rip-complete webhooks, queues
//! jobs in an embedded store, and drives a single-flight worker through
//! stabilize, probe, plan, encode, and publish.

pub mod admission;
pub mod command_guard;
pub mod daemon;
pub mod error;
pub mod executor;
pub mod path_guard;
pub mod planner;
pub mod probe;
pub mod publish;
pub mod server;
pub mod stability;
pub mod store;
pub mod worker;

pub use ripline_config as config;
pub use ripline_config::Config;

pub use admission::{
    check_webhook_secret, extract_rip_hint, parse_notification, AdmissionError, AdmissionOutcome,
    MAX_BODY_BYTES,
};
pub use command_guard::{
    resolve_executable, validate_preset, validate_quality, AudioEncoder, CommandGuardError,
    EncodeSettings, EncoderFamily, SubtitleMode, VideoEncoder, HANDBRAKE_PRESETS,
};
pub use daemon::{create_required_directories, Daemon, DaemonError};
pub use error::ErrorKind;
pub use executor::{parse_progress, run as run_subprocess, ExecError, ExecOutcome, ProgressDialect};
pub use path_guard::{resolve as resolve_path, scrub_hint, PathGuardError};
pub use planner::{
    classify_source, find_main_video, list_audio_files, plan_encode, Classification, EncodePlan,
    PlanError, PlanTool, Toolchain,
};
pub use probe::{
    classify_resolution, detect_gpu_caps, parse_ffprobe_output, probe_media, GpuCaps, MediaInfo,
    ProbeError, ResolutionClass,
};
pub use publish::{clean_title, publish_artifact, publish_audio_files, PublishError};
pub use server::{create_router, parse_api_keys, run_server, ApiKey, AppState, Role, ServerError};
pub use stability::{snapshot_tree, wait_for_stable, StabilizeOutcome};
pub use store::{should_commit_progress, Job, JobStatus, Store, StoreError, StoreStats};
pub use worker::{new_shared_phase, SharedPhase, Worker, WorkerPhase};
