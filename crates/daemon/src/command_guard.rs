//! Allowlist validation for everything that ends up on an encoder command line.
//!
//! User-tunable settings (encoder names, quality, preset, audio and subtitle
//! modes) are validated here once at startup; the planner then only works
//! with the typed results. Argv is always assembled as a sequence of strings,
//! never concatenated into a shell line.

use ripline_config::EncodingConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for command validation
#[derive(Debug, Error)]
pub enum CommandGuardError {
    #[error("unknown video encoder: {0}")]
    UnknownVideoEncoder(String),

    #[error("unknown audio encoder: {0}")]
    UnknownAudioEncoder(String),

    #[error("unknown subtitle mode: {0}")]
    UnknownSubtitleMode(String),

    #[error("quality {0} out of range [0, 51]")]
    QualityOutOfRange(i64),

    #[error("preset not in the built-in list: {0}")]
    UnknownPreset(String),

    #[error("executable not found on PATH: {0}")]
    ExecutableNotFound(String),
}

/// Hardware acceleration backend, resolved at job start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderFamily {
    Nvenc,
    Vaapi,
    Amf,
    Qsv,
    SoftX265,
    SoftX264,
}

impl EncoderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderFamily::Nvenc => "nvenc",
            EncoderFamily::Vaapi => "vaapi",
            EncoderFamily::Amf => "amf",
            EncoderFamily::Qsv => "qsv",
            EncoderFamily::SoftX265 => "soft_x265",
            EncoderFamily::SoftX264 => "soft_x264",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "nvenc" => Some(EncoderFamily::Nvenc),
            "vaapi" => Some(EncoderFamily::Vaapi),
            "amf" => Some(EncoderFamily::Amf),
            "qsv" => Some(EncoderFamily::Qsv),
            "soft_x265" => Some(EncoderFamily::SoftX265),
            "soft_x264" => Some(EncoderFamily::SoftX264),
            _ => None,
        }
    }
}

impl std::fmt::Display for EncoderFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated video encoder selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEncoder {
    NvencH265,
    NvencH264,
    VaapiH265,
    VaapiH264,
    AmfH265,
    AmfH264,
    QsvH265,
    QsvH264,
    X265,
    X264,
}

impl VideoEncoder {
    /// Parse a configured encoder name. Accepts the short form and the
    /// canonical VideoTool-A codec names as aliases (e.g. `hevc_nvenc`),
    /// normalizing to the short form.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "nvenc_h265" | "hevc_nvenc" => Some(VideoEncoder::NvencH265),
            "nvenc_h264" | "h264_nvenc" => Some(VideoEncoder::NvencH264),
            "vaapi_h265" | "hevc_vaapi" => Some(VideoEncoder::VaapiH265),
            "vaapi_h264" | "h264_vaapi" => Some(VideoEncoder::VaapiH264),
            "amf_h265" | "hevc_amf" => Some(VideoEncoder::AmfH265),
            "amf_h264" | "h264_amf" => Some(VideoEncoder::AmfH264),
            "qsv_h265" | "hevc_qsv" => Some(VideoEncoder::QsvH265),
            "qsv_h264" | "h264_qsv" => Some(VideoEncoder::QsvH264),
            "x265" | "libx265" => Some(VideoEncoder::X265),
            "x264" | "libx264" => Some(VideoEncoder::X264),
            _ => None,
        }
    }

    /// Short-form name used in config and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoEncoder::NvencH265 => "nvenc_h265",
            VideoEncoder::NvencH264 => "nvenc_h264",
            VideoEncoder::VaapiH265 => "vaapi_h265",
            VideoEncoder::VaapiH264 => "vaapi_h264",
            VideoEncoder::AmfH265 => "amf_h265",
            VideoEncoder::AmfH264 => "amf_h264",
            VideoEncoder::QsvH265 => "qsv_h265",
            VideoEncoder::QsvH264 => "qsv_h264",
            VideoEncoder::X265 => "x265",
            VideoEncoder::X264 => "x264",
        }
    }

    /// The codec name VideoTool-A expects after `-c:v`.
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            VideoEncoder::NvencH265 => "hevc_nvenc",
            VideoEncoder::NvencH264 => "h264_nvenc",
            VideoEncoder::VaapiH265 => "hevc_vaapi",
            VideoEncoder::VaapiH264 => "h264_vaapi",
            VideoEncoder::AmfH265 => "hevc_amf",
            VideoEncoder::AmfH264 => "h264_amf",
            VideoEncoder::QsvH265 => "hevc_qsv",
            VideoEncoder::QsvH264 => "h264_qsv",
            VideoEncoder::X265 => "libx265",
            VideoEncoder::X264 => "libx264",
        }
    }

    pub fn family(&self) -> EncoderFamily {
        match self {
            VideoEncoder::NvencH265 | VideoEncoder::NvencH264 => EncoderFamily::Nvenc,
            VideoEncoder::VaapiH265 | VideoEncoder::VaapiH264 => EncoderFamily::Vaapi,
            VideoEncoder::AmfH265 | VideoEncoder::AmfH264 => EncoderFamily::Amf,
            VideoEncoder::QsvH265 | VideoEncoder::QsvH264 => EncoderFamily::Qsv,
            VideoEncoder::X265 => EncoderFamily::SoftX265,
            VideoEncoder::X264 => EncoderFamily::SoftX264,
        }
    }
}

/// A validated audio encoder selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoder {
    Copy,
    Aac,
    Ac3,
    Eac3,
    Flac,
    Mp3,
}

impl AudioEncoder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "copy" => Some(AudioEncoder::Copy),
            "aac" => Some(AudioEncoder::Aac),
            "ac3" => Some(AudioEncoder::Ac3),
            "eac3" => Some(AudioEncoder::Eac3),
            "flac" => Some(AudioEncoder::Flac),
            "mp3" => Some(AudioEncoder::Mp3),
            _ => None,
        }
    }

    /// The codec name VideoTool-A expects after `-c:a`.
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            AudioEncoder::Copy => "copy",
            AudioEncoder::Aac => "aac",
            AudioEncoder::Ac3 => "ac3",
            AudioEncoder::Eac3 => "eac3",
            AudioEncoder::Flac => "flac",
            AudioEncoder::Mp3 => "libmp3lame",
        }
    }
}

/// Subtitle stream mapping mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleMode {
    All,
    None,
    First,
}

impl SubtitleMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "all" => Some(SubtitleMode::All),
            "none" => Some(SubtitleMode::None),
            "first" => Some(SubtitleMode::First),
            _ => None,
        }
    }
}

/// Built-in VideoTool-B preset names. A preset installed at runtime but
/// absent from this list is refused at startup.
pub const HANDBRAKE_PRESETS: &[&str] = &[
    "Very Fast 2160p60 4K HEVC",
    "Very Fast 1080p30",
    "Very Fast 720p30",
    "Very Fast 576p25",
    "Very Fast 480p30",
    "Fast 2160p60 4K HEVC",
    "Fast 1080p30",
    "Fast 720p30",
    "Fast 576p25",
    "Fast 480p30",
    "HQ 2160p60 4K HEVC Surround",
    "HQ 1080p30 Surround",
    "HQ 720p30 Surround",
    "HQ 576p25 Surround",
    "HQ 480p30 Surround",
    "Super HQ 2160p60 4K HEVC Surround",
    "Super HQ 1080p30 Surround",
    "Super HQ 720p30 Surround",
    "Super HQ 576p25 Surround",
    "Super HQ 480p30 Surround",
    "H.265 NVENC 2160p 4K",
    "H.265 NVENC 1080p",
    "H.264 NVENC 2160p 4K",
    "H.264 NVENC 1080p",
    "H.265 QSV 2160p 4K",
    "H.265 QSV 1080p",
    "H.264 QSV 1080p",
    "H.265 VCN 2160p 4K",
    "H.265 VCN 1080p",
    "H.264 VCN 1080p",
    "H.265 MF 2160p 4K",
    "H.265 MF 1080p",
    "H.264 MF 1080p",
];

/// Validate a quality value against the [0, 51] range shared by every family.
pub fn validate_quality(quality: i64) -> Result<u8, CommandGuardError> {
    if (0..=51).contains(&quality) {
        Ok(quality as u8)
    } else {
        Err(CommandGuardError::QualityOutOfRange(quality))
    }
}

/// Validate a preset name against the baked allowlist.
pub fn validate_preset(name: &str) -> Result<(), CommandGuardError> {
    if HANDBRAKE_PRESETS.contains(&name) {
        Ok(())
    } else {
        Err(CommandGuardError::UnknownPreset(name.to_string()))
    }
}

/// The fully validated encoding settings the planner works with.
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub video: VideoEncoder,
    pub quality: u8,
    pub audio: AudioEncoder,
    pub subtitles: SubtitleMode,
    /// Preset for the VideoTool-B path; None disables it.
    pub preset: Option<String>,
    /// UHD preset variant; falls back to `preset` when None.
    pub preset_4k: Option<String>,
    pub vaapi_device: PathBuf,
}

impl EncodeSettings {
    /// Validate the raw encoding config into typed settings.
    pub fn from_config(cfg: &EncodingConfig) -> Result<Self, CommandGuardError> {
        let video = VideoEncoder::parse(&cfg.video_encoder)
            .ok_or_else(|| CommandGuardError::UnknownVideoEncoder(cfg.video_encoder.clone()))?;
        let audio = AudioEncoder::parse(&cfg.audio_encoder)
            .ok_or_else(|| CommandGuardError::UnknownAudioEncoder(cfg.audio_encoder.clone()))?;
        let subtitles = SubtitleMode::parse(&cfg.subtitle_mode)
            .ok_or_else(|| CommandGuardError::UnknownSubtitleMode(cfg.subtitle_mode.clone()))?;
        let quality = validate_quality(cfg.video_quality as i64)?;

        let preset = if cfg.handbrake_preset.is_empty() {
            None
        } else {
            validate_preset(&cfg.handbrake_preset)?;
            Some(cfg.handbrake_preset.clone())
        };
        let preset_4k = if cfg.handbrake_preset_4k.is_empty() {
            None
        } else {
            validate_preset(&cfg.handbrake_preset_4k)?;
            Some(cfg.handbrake_preset_4k.clone())
        };

        Ok(Self {
            video,
            quality,
            audio,
            subtitles,
            preset,
            preset_4k,
            vaapi_device: cfg.vaapi_device.clone(),
        })
    }
}

/// Resolve an executable name to an absolute path by searching PATH.
///
/// Done once at startup; the planner only ever emits absolute tool paths.
pub fn resolve_executable(name: &str) -> Result<PathBuf, CommandGuardError> {
    let path_var =
        std::env::var_os("PATH").ok_or_else(|| CommandGuardError::ExecutableNotFound(name.to_string()))?;

    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(CommandGuardError::ExecutableNotFound(name.to_string()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
