//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Filesystem roots the daemon operates on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Where the ripper drops finished discs
    #[serde(default = "default_raw_path")]
    pub raw_path: PathBuf,
    /// Root of the classified output tree
    #[serde(default = "default_completed_path")]
    pub completed_path: PathBuf,
    /// Scratch directory for in-flight transcodes
    #[serde(default = "default_work_path")]
    pub work_path: PathBuf,
    /// Location of the embedded job database
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_raw_path() -> PathBuf {
    PathBuf::from("/raw")
}

fn default_completed_path() -> PathBuf {
    PathBuf::from("/completed")
}

fn default_work_path() -> PathBuf {
    PathBuf::from("/work")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/work/ripline.db")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_path: default_raw_path(),
            completed_path: default_completed_path(),
            work_path: default_work_path(),
            db_path: default_db_path(),
        }
    }
}

/// Names of the classification subdirectories under the completed root
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubdirsConfig {
    #[serde(default = "default_movies_subdir")]
    pub movies: String,
    #[serde(default = "default_tv_subdir")]
    pub tv: String,
    #[serde(default = "default_audio_subdir")]
    pub audio: String,
}

fn default_movies_subdir() -> String {
    "movies".to_string()
}

fn default_tv_subdir() -> String {
    "tv".to_string()
}

fn default_audio_subdir() -> String {
    "audio".to_string()
}

impl Default for SubdirsConfig {
    fn default() -> Self {
        Self {
            movies: default_movies_subdir(),
            tv: default_tv_subdir(),
            audio: default_audio_subdir(),
        }
    }
}

/// Encoder selection and tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingConfig {
    /// Video encoder name, validated against the allowlist at startup
    #[serde(default = "default_video_encoder")]
    pub video_encoder: String,
    /// Quality value, clamped to [0, 51]
    #[serde(default = "default_video_quality")]
    pub video_quality: u8,
    /// Audio encoder name ("copy" passes streams through)
    #[serde(default = "default_audio_encoder")]
    pub audio_encoder: String,
    /// Subtitle mapping mode: all, none, or first
    #[serde(default = "default_subtitle_mode")]
    pub subtitle_mode: String,
    /// HandBrake preset for the NVENC preset path (empty disables it)
    #[serde(default)]
    pub handbrake_preset: String,
    /// HandBrake preset for UHD sources (empty falls back to handbrake_preset)
    #[serde(default)]
    pub handbrake_preset_4k: String,
    /// Render device node for VAAPI/QSV
    #[serde(default = "default_vaapi_device")]
    pub vaapi_device: PathBuf,
}

fn default_video_encoder() -> String {
    "nvenc_h265".to_string()
}

fn default_video_quality() -> u8 {
    22
}

fn default_audio_encoder() -> String {
    "copy".to_string()
}

fn default_subtitle_mode() -> String {
    "all".to_string()
}

fn default_vaapi_device() -> PathBuf {
    PathBuf::from("/dev/dri/renderD128")
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            video_encoder: default_video_encoder(),
            video_quality: default_video_quality(),
            audio_encoder: default_audio_encoder(),
            subtitle_mode: default_subtitle_mode(),
            handbrake_preset: String::new(),
            handbrake_preset_4k: String::new(),
            vaapi_device: default_vaapi_device(),
        }
    }
}

/// Runtime behavior of the worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Concurrent transcodes; the worker is single-flight so this stays 1
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Seconds a source tree must hold still before it counts as stable
    #[serde(default = "default_stabilize_seconds")]
    pub stabilize_seconds: u64,
    /// Retry ceiling, clamped to [0, 10]
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Free-space floor on the work filesystem, in GiB
    #[serde(default = "default_minimum_free_space_gb")]
    pub minimum_free_space_gb: u64,
    /// Remove the source directory after a successful publish
    #[serde(default = "default_delete_source")]
    pub delete_source: bool,
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_stabilize_seconds() -> u64 {
    60
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_minimum_free_space_gb() -> u64 {
    10
}

fn default_delete_source() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            stabilize_seconds: default_stabilize_seconds(),
            max_retry_count: default_max_retry_count(),
            minimum_free_space_gb: default_minimum_free_space_gb(),
            delete_source: default_delete_source(),
        }
    }
}

/// API and webhook authentication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// When false, the X-API-Key check is bypassed entirely
    #[serde(default = "default_require_api_auth")]
    pub require_api_auth: bool,
    /// Comma-separated keys, each optionally prefixed with "admin:" or "readonly:"
    #[serde(default)]
    pub api_keys: String,
    /// Shared secret for the webhook endpoint (empty leaves it open)
    #[serde(default)]
    pub webhook_secret: String,
}

fn default_require_api_auth() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_api_auth: default_require_api_auth(),
            api_keys: String::new(),
            webhook_secret: String::new(),
        }
    }
}

/// HTTP server binding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub subdirs: SubdirsConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Every documented variable maps onto one field: RAW_PATH,
    /// COMPLETED_PATH, WORK_PATH, DB_PATH, MOVIES_SUBDIR, TV_SUBDIR,
    /// AUDIO_SUBDIR, VIDEO_ENCODER, VIDEO_QUALITY, AUDIO_ENCODER,
    /// SUBTITLE_MODE, HANDBRAKE_PRESET, HANDBRAKE_PRESET_4K, VAAPI_DEVICE,
    /// MAX_CONCURRENT, STABILIZE_SECONDS, MAX_RETRY_COUNT,
    /// MINIMUM_FREE_SPACE_GB, DELETE_SOURCE, REQUIRE_API_AUTH, API_KEYS,
    /// WEBHOOK_SECRET, BIND_ADDR.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RAW_PATH") {
            self.paths.raw_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("COMPLETED_PATH") {
            self.paths.completed_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("WORK_PATH") {
            self.paths.work_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("DB_PATH") {
            self.paths.db_path = PathBuf::from(val);
        }

        if let Ok(val) = env::var("MOVIES_SUBDIR") {
            self.subdirs.movies = val;
        }
        if let Ok(val) = env::var("TV_SUBDIR") {
            self.subdirs.tv = val;
        }
        if let Ok(val) = env::var("AUDIO_SUBDIR") {
            self.subdirs.audio = val;
        }

        if let Ok(val) = env::var("VIDEO_ENCODER") {
            self.encoding.video_encoder = val;
        }
        if let Ok(val) = env::var("VIDEO_QUALITY") {
            if let Ok(q) = val.parse::<u8>() {
                self.encoding.video_quality = q;
            }
        }
        if let Ok(val) = env::var("AUDIO_ENCODER") {
            self.encoding.audio_encoder = val;
        }
        if let Ok(val) = env::var("SUBTITLE_MODE") {
            self.encoding.subtitle_mode = val;
        }
        if let Ok(val) = env::var("HANDBRAKE_PRESET") {
            self.encoding.handbrake_preset = val;
        }
        if let Ok(val) = env::var("HANDBRAKE_PRESET_4K") {
            self.encoding.handbrake_preset_4k = val;
        }
        if let Ok(val) = env::var("VAAPI_DEVICE") {
            self.encoding.vaapi_device = PathBuf::from(val);
        }

        if let Ok(val) = env::var("MAX_CONCURRENT") {
            if let Ok(n) = val.parse::<u32>() {
                self.runtime.max_concurrent = n;
            }
        }
        if let Ok(val) = env::var("STABILIZE_SECONDS") {
            if let Ok(n) = val.parse::<u64>() {
                self.runtime.stabilize_seconds = n;
            }
        }
        if let Ok(val) = env::var("MAX_RETRY_COUNT") {
            if let Ok(n) = val.parse::<u32>() {
                self.runtime.max_retry_count = n;
            }
        }
        if let Ok(val) = env::var("MINIMUM_FREE_SPACE_GB") {
            if let Ok(n) = val.parse::<u64>() {
                self.runtime.minimum_free_space_gb = n;
            }
        }
        if let Ok(val) = env::var("DELETE_SOURCE") {
            if let Some(b) = parse_bool(&val) {
                self.runtime.delete_source = b;
            }
        }

        if let Ok(val) = env::var("REQUIRE_API_AUTH") {
            if let Some(b) = parse_bool(&val) {
                self.auth.require_api_auth = b;
            }
        }
        if let Ok(val) = env::var("API_KEYS") {
            self.auth.api_keys = val;
        }
        if let Ok(val) = env::var("WEBHOOK_SECRET") {
            self.auth.webhook_secret = val;
        }

        if let Ok(val) = env::var("BIND_ADDR") {
            self.server.bind_addr = val;
        }
    }

    /// Clamp out-of-range numeric fields to their documented bounds
    pub fn clamp(&mut self) {
        self.encoding.video_quality = self.encoding.video_quality.min(51);
        self.runtime.max_retry_count = self.runtime.max_retry_count.min(10);
        self.runtime.stabilize_seconds = self.runtime.stabilize_seconds.clamp(5, 1800);
        self.runtime.max_concurrent = self.runtime.max_concurrent.max(1);
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.clamp();
        Ok(config)
    }

    /// Build configuration from defaults and the environment alone
    ///
    /// Used when no config file is given; deployments normally drive the
    /// daemon entirely through environment variables.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.clamp();
        config
    }
}

/// Parse a boolean env value, accepting true/1/yes and false/0/no
fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
