//! Media inspection and encoder-hardware detection.
//!
//! Probing runs the VideoTool-A inspector (`ffprobe -v quiet -print_format
//! json -show_streams -show_format`) and reduces the JSON to the resolution
//! and duration the planner needs. Hardware detection runs once at startup
//! and is cached on the daemon; its results are advisory.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

use crate::command_guard::EncoderFamily;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The file has no video stream to classify.
    #[error("no video stream in {0}")]
    NoVideoStream(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolution and duration of the main video stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub duration_secs: f64,
}

/// Resolution class driving the planner's scaling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionClass {
    Uhd,
    Hd,
    Sd,
}

impl MediaInfo {
    pub fn resolution_class(&self) -> ResolutionClass {
        classify_resolution(self.width, self.height)
    }
}

/// Classify a resolution: anything above 1080p is UHD, 720p and up is HD,
/// the rest is SD.
pub fn classify_resolution(width: u32, height: u32) -> ResolutionClass {
    if width > 1920 || height > 1080 {
        ResolutionClass::Uhd
    } else if width >= 1280 || height >= 720 {
        ResolutionClass::Hd
    } else {
        ResolutionClass::Sd
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Probe a media file for the main video stream's resolution and the
/// container duration.
pub fn probe_media(ffprobe: &Path, file: &Path) -> Result<MediaInfo, ProbeError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(file)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout, &file.to_string_lossy())
}

/// Parse ffprobe JSON output into a MediaInfo.
pub fn parse_ffprobe_output(json_str: &str, file_name: &str) -> Result<MediaInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ProbeError::NoVideoStream(file_name.to_string()))?;

    let duration_secs = ffprobe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(MediaInfo {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        duration_secs,
    })
}

/// Which encoder families the host can actually run.
///
/// Detected once at startup. Software encoding is always available and is
/// the fallback when the configured family is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuCaps {
    pub nvenc: bool,
    pub vaapi: bool,
    pub qsv: bool,
    pub amf: bool,
}

impl GpuCaps {
    /// Everything available; used in tests and when detection is skipped.
    pub fn all() -> Self {
        Self {
            nvenc: true,
            vaapi: true,
            qsv: true,
            amf: true,
        }
    }

    pub fn supports(&self, family: EncoderFamily) -> bool {
        match family {
            EncoderFamily::Nvenc => self.nvenc,
            EncoderFamily::Vaapi => self.vaapi,
            EncoderFamily::Qsv => self.qsv,
            EncoderFamily::Amf => self.amf,
            EncoderFamily::SoftX265 | EncoderFamily::SoftX264 => true,
        }
    }
}

/// Detect encoder hardware.
///
/// NVENC needs both an nvenc entry in `ffmpeg -encoders` and a responding
/// vendor tool; VAAPI and QSV need the render device node; AMF is reported
/// available in principle and left to the encode itself to confirm.
pub fn detect_gpu_caps(ffmpeg: &Path, render_device: &Path) -> GpuCaps {
    let encoders = list_encoders(ffmpeg).unwrap_or_default();
    let nvenc = encoders.contains("nvenc") && nvidia_tool_responds();
    let render_node = render_device.exists();

    GpuCaps {
        nvenc,
        vaapi: render_node,
        qsv: render_node,
        amf: true,
    }
}

fn list_encoders(ffmpeg: &Path) -> Option<String> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .output()
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        None
    }
}

/// Presence-only query: any zero exit from `nvidia-smi -L` counts.
fn nvidia_tool_responds() -> bool {
    Command::new("nvidia-smi")
        .arg("-L")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
