//! Encode planning: classification, tool choice, and argv assembly.
//!
//! Given the validated settings, the detected hardware, and the probed
//! source, the planner decides which tool runs (VideoTool-A for every
//! family except the NVENC preset path, which uses VideoTool-B), which
//! destination subtree the result belongs in, and the exact argument
//! vector to execute.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use walkdir::WalkDir;

use crate::command_guard::{AudioEncoder, EncodeSettings, EncoderFamily, SubtitleMode, VideoEncoder};
use crate::probe::{GpuCaps, MediaInfo, ResolutionClass};

/// Error type for planning operations
#[derive(Debug, Error)]
pub enum PlanError {
    /// No usable video file in the source directory.
    #[error("no video file found under {0}")]
    NoVideoFile(PathBuf),

    /// IO error while scanning the source.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Destination classification for a job's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Movie,
    Tv,
    Audio,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Movie => "movie",
            Classification::Tv => "tv",
            Classification::Audio => "audio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "movie" => Some(Classification::Movie),
            "tv" => Some(Classification::Tv),
            "audio" => Some(Classification::Audio),
            _ => None,
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File extensions treated as standalone audio tracks.
pub const AUDIO_EXTENSIONS: &[&str] = &["flac", "mp3", "wav", "ogg"];

/// File extensions considered video containers when picking the main title.
pub const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "m4v", "avi", "ts", "m2ts", "mov", "wmv"];

fn episode_token() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(?i)S\d{1,2}E\d{1,3}").expect("static regex"))
}

/// Classify a source directory.
///
/// Any standalone audio file makes the whole directory AUDIO; otherwise a
/// season/episode token in the directory name or the title makes it TV;
/// everything else is a MOVIE. The heuristic is purely lexical.
pub fn classify_source(dir: &Path, title: &str) -> Result<Classification, PlanError> {
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if has_extension_in(entry.path(), AUDIO_EXTENSIONS) {
            return Ok(Classification::Audio);
        }
    }

    let dir_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if episode_token().is_match(&dir_name) || episode_token().is_match(title) {
        return Ok(Classification::Tv);
    }

    Ok(Classification::Movie)
}

fn has_extension_in(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Find the main video file under a source directory: the largest file
/// carrying a video extension. Disc rips keep the feature title as the
/// biggest track.
pub fn find_main_video(dir: &Path) -> Result<PathBuf, PlanError> {
    let mut best: Option<(u64, PathBuf)> = None;

    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !has_extension_in(entry.path(), VIDEO_EXTENSIONS) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if best.as_ref().map(|(s, _)| size > *s).unwrap_or(true) {
            best = Some((size, entry.path().to_path_buf()));
        }
    }

    best.map(|(_, p)| p)
        .ok_or_else(|| PlanError::NoVideoFile(dir.to_path_buf()))
}

/// Collect the standalone audio files of an AUDIO-classified source, in
/// sorted order for deterministic publishing.
pub fn list_audio_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && has_extension_in(e.path(), AUDIO_EXTENSIONS))
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}

/// Absolute paths of the external tools, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// None when VideoTool-B is not installed; the preset path is disabled.
    pub handbrake: Option<PathBuf>,
}

/// Which progress dialect the executor should parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanTool {
    Ffmpeg,
    Handbrake,
}

/// A fully planned encode invocation.
#[derive(Debug, Clone)]
pub struct EncodePlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub tool: PlanTool,
    pub encoder: VideoEncoder,
}

impl EncodePlan {
    pub fn family(&self) -> EncoderFamily {
        self.encoder.family()
    }
}

/// Pick the encoder to actually use: the configured one when its family is
/// present, software x265 with a warning otherwise. Detection is advisory.
pub fn resolve_encoder(settings: &EncodeSettings, caps: GpuCaps) -> (VideoEncoder, Option<String>) {
    if caps.supports(settings.video.family()) {
        (settings.video, None)
    } else {
        let warning = format!(
            "encoder family {} unavailable, falling back to x265",
            settings.video.family()
        );
        (VideoEncoder::X265, Some(warning))
    }
}

/// Build the full encode plan for a video source.
///
/// Returns the plan and an optional warning (hardware fallback) to record
/// on the job.
pub fn plan_encode(
    settings: &EncodeSettings,
    caps: GpuCaps,
    info: &MediaInfo,
    toolchain: &Toolchain,
    input: &Path,
    output: &Path,
) -> (EncodePlan, Option<String>) {
    let (encoder, warning) = resolve_encoder(settings, caps);
    let class = info.resolution_class();

    // The preset-driven path applies only to NVENC with a configured
    // preset and an installed VideoTool-B.
    if encoder.family() == EncoderFamily::Nvenc && settings.preset.is_some() {
        if let Some(handbrake) = &toolchain.handbrake {
            let preset = select_preset(settings, class);
            let args = build_handbrake_args(&preset, input, output);
            return (
                EncodePlan {
                    program: handbrake.clone(),
                    args,
                    tool: PlanTool::Handbrake,
                    encoder,
                },
                warning,
            );
        }
    }

    let args = build_ffmpeg_args(encoder, settings, class, input, output);
    (
        EncodePlan {
            program: toolchain.ffmpeg.clone(),
            args,
            tool: PlanTool::Ffmpeg,
            encoder,
        },
        warning,
    )
}

/// UHD sources take the 4K preset variant when one is configured.
fn select_preset(settings: &EncodeSettings, class: ResolutionClass) -> String {
    let base = settings.preset.clone().unwrap_or_default();
    if class == ResolutionClass::Uhd {
        settings.preset_4k.clone().unwrap_or(base)
    } else {
        base
    }
}

fn build_handbrake_args(preset: &str, input: &Path, output: &Path) -> Vec<String> {
    vec![
        "--preset".to_string(),
        preset.to_string(),
        "--format".to_string(),
        "av_mkv".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-o".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Assemble the VideoTool-A argument vector for one encode.
///
/// SD sources are upscaled to 1280x720 with the family's native filter;
/// HD and UHD preserve the source resolution.
fn build_ffmpeg_args(
    encoder: VideoEncoder,
    settings: &EncodeSettings,
    class: ResolutionClass,
    input: &Path,
    output: &Path,
) -> Vec<String> {
    let family = encoder.family();
    let upscale = class == ResolutionClass::Sd;
    let mut args: Vec<String> = vec!["-y".into(), "-nostdin".into()];

    // Input-side hardware context
    match family {
        EncoderFamily::Nvenc if upscale => {
            args.extend(["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"].map(String::from));
        }
        EncoderFamily::Qsv if upscale => {
            args.extend(["-hwaccel", "qsv", "-hwaccel_output_format", "qsv"].map(String::from));
        }
        EncoderFamily::Vaapi => {
            args.push("-vaapi_device".into());
            args.push(settings.vaapi_device.to_string_lossy().into_owned());
        }
        _ => {}
    }

    args.push("-i".into());
    args.push(input.to_string_lossy().into_owned());

    // Stream mapping: video track 0, every audio track, subtitles per mode
    args.extend(["-map", "0:v:0", "-map", "0:a?"].map(String::from));
    match settings.subtitles {
        SubtitleMode::All => args.extend(["-map", "0:s?", "-c:s", "copy"].map(String::from)),
        SubtitleMode::First => args.extend(["-map", "0:s:0?", "-c:s", "copy"].map(String::from)),
        SubtitleMode::None => args.push("-sn".into()),
    }

    // Video codec and the family's quality flag
    args.push("-c:v".into());
    args.push(encoder.ffmpeg_name().into());
    let q = settings.quality.to_string();
    match family {
        EncoderFamily::Nvenc => args.extend(["-cq".into(), q]),
        EncoderFamily::Vaapi => args.extend(["-qp".into(), q]),
        EncoderFamily::Amf => args.extend(["-qp_i".into(), q.clone(), "-qp_p".into(), q]),
        EncoderFamily::Qsv => args.extend(["-global_quality".into(), q]),
        EncoderFamily::SoftX265 | EncoderFamily::SoftX264 => args.extend(["-crf".into(), q]),
    }

    // Filter graph
    if let Some(vf) = filter_graph(family, upscale) {
        args.push("-vf".into());
        args.push(vf);
    }

    // Audio policy
    match settings.audio {
        AudioEncoder::Copy => args.extend(["-c:a", "copy"].map(String::from)),
        other => {
            args.push("-c:a".into());
            args.push(other.ffmpeg_name().into());
            args.extend(["-b:a", "192k"].map(String::from));
        }
    }

    args.push(output.to_string_lossy().into_owned());
    args
}

fn filter_graph(family: EncoderFamily, upscale: bool) -> Option<String> {
    match family {
        // VAAPI frames must be uploaded before the encoder regardless of scaling
        EncoderFamily::Vaapi => {
            let mut vf = "format=nv12,hwupload".to_string();
            if upscale {
                vf.push_str(",scale_vaapi=w=1280:h=720");
            }
            Some(vf)
        }
        EncoderFamily::Nvenc if upscale => Some("scale_cuda=1280:720".to_string()),
        EncoderFamily::Qsv if upscale => Some("vpp_qsv=w=1280:h=720".to_string()),
        EncoderFamily::Amf | EncoderFamily::SoftX265 | EncoderFamily::SoftX264 if upscale => {
            Some("scale=1280:720".to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripline_config::EncodingConfig;
    use tempfile::TempDir;

    fn settings() -> EncodeSettings {
        EncodeSettings::from_config(&EncodingConfig::default()).unwrap()
    }

    fn settings_with(encoder: &str) -> EncodeSettings {
        let mut cfg = EncodingConfig::default();
        cfg.video_encoder = encoder.to_string();
        EncodeSettings::from_config(&cfg).unwrap()
    }

    fn toolchain() -> Toolchain {
        Toolchain {
            ffmpeg: PathBuf::from("/usr/bin/ffmpeg"),
            ffprobe: PathBuf::from("/usr/bin/ffprobe"),
            handbrake: Some(PathBuf::from("/usr/bin/HandBrakeCLI")),
        }
    }

    fn info(width: u32, height: u32) -> MediaInfo {
        MediaInfo {
            width,
            height,
            duration_secs: 5400.0,
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_classify_audio_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("track01.flac"), b"x").unwrap();
        std::fs::write(dir.path().join("track02.flac"), b"x").unwrap();

        let class = classify_source(dir.path(), "Best Of").unwrap();
        assert_eq!(class, Classification::Audio);
    }

    #[test]
    fn test_classify_audio_wins_over_video() {
        // One stray audio track makes the directory AUDIO even next to video
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("title.mkv"), b"x").unwrap();
        std::fs::write(dir.path().join("bonus.mp3"), b"x").unwrap();

        let class = classify_source(dir.path(), "Concert").unwrap();
        assert_eq!(class, Classification::Audio);
    }

    #[test]
    fn test_classify_tv_by_episode_token() {
        let dir = TempDir::new().unwrap();
        let show = dir.path().join("Show S01E03");
        std::fs::create_dir(&show).unwrap();
        std::fs::write(show.join("title.mkv"), b"x").unwrap();

        assert_eq!(classify_source(&show, "Show").unwrap(), Classification::Tv);

        // Token in the title alone also counts
        let movie_dir = dir.path().join("plain");
        std::fs::create_dir(&movie_dir).unwrap();
        assert_eq!(
            classify_source(&movie_dir, "Show s2e11").unwrap(),
            Classification::Tv
        );
    }

    #[test]
    fn test_classify_movie_default() {
        let dir = TempDir::new().unwrap();
        let movie = dir.path().join("Inception (2010)");
        std::fs::create_dir(&movie).unwrap();
        std::fs::write(movie.join("title.mkv"), b"x").unwrap();

        assert_eq!(
            classify_source(&movie, "Inception (2010)").unwrap(),
            Classification::Movie
        );
    }

    #[test]
    fn test_classify_ambiguous_title_is_movie() {
        let dir = TempDir::new().unwrap();
        let d = dir.path().join("Series Finale (2020)");
        std::fs::create_dir(&d).unwrap();
        assert_eq!(
            classify_source(&d, "Series Finale (2020)").unwrap(),
            Classification::Movie
        );
    }

    #[test]
    fn test_find_main_video_picks_largest() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("extras.mkv"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("title.mkv"), vec![0u8; 1000]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), vec![0u8; 5000]).unwrap();

        let main = find_main_video(dir.path()).unwrap();
        assert_eq!(main.file_name().unwrap(), "title.mkv");
    }

    #[test]
    fn test_find_main_video_none() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert!(matches!(
            find_main_video(dir.path()),
            Err(PlanError::NoVideoFile(_))
        ));
    }

    #[test]
    fn test_list_audio_files_sorted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.flac"), b"x").unwrap();
        std::fs::write(dir.path().join("a.mp3"), b"x").unwrap();
        std::fs::write(dir.path().join("cover.jpg"), b"x").unwrap();

        let files = list_audio_files(dir.path());
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.mp3", "b.flac"]);
    }

    #[test]
    fn test_resolve_encoder_fallback() {
        let none = GpuCaps {
            nvenc: false,
            vaapi: false,
            qsv: false,
            amf: false,
        };
        let (enc, warning) = resolve_encoder(&settings(), none);
        assert_eq!(enc, VideoEncoder::X265);
        assert!(warning.unwrap().contains("nvenc"));

        let (enc, warning) = resolve_encoder(&settings(), GpuCaps::all());
        assert_eq!(enc, VideoEncoder::NvencH265);
        assert!(warning.is_none());
    }

    #[test]
    fn test_plan_nvenc_preset_path_uses_handbrake() {
        let mut s = settings();
        s.preset = Some("H.265 NVENC 1080p".to_string());
        s.preset_4k = Some("H.265 NVENC 2160p 4K".to_string());

        let (plan, _) = plan_encode(
            &s,
            GpuCaps::all(),
            &info(1920, 1080),
            &toolchain(),
            Path::new("/raw/m/title.mkv"),
            Path::new("/work/job_1/out.mkv"),
        );
        assert_eq!(plan.tool, PlanTool::Handbrake);
        assert_eq!(plan.program, PathBuf::from("/usr/bin/HandBrakeCLI"));
        assert!(has_pair(&plan.args, "--preset", "H.265 NVENC 1080p"));
        assert!(has_pair(&plan.args, "-i", "/raw/m/title.mkv"));
        assert!(has_pair(&plan.args, "-o", "/work/job_1/out.mkv"));
    }

    #[test]
    fn test_plan_uhd_selects_4k_preset() {
        let mut s = settings();
        s.preset = Some("H.265 NVENC 1080p".to_string());
        s.preset_4k = Some("H.265 NVENC 2160p 4K".to_string());

        let (plan, _) = plan_encode(
            &s,
            GpuCaps::all(),
            &info(3840, 2160),
            &toolchain(),
            Path::new("/in.mkv"),
            Path::new("/out.mkv"),
        );
        assert!(has_pair(&plan.args, "--preset", "H.265 NVENC 2160p 4K"));
    }

    #[test]
    fn test_plan_nvenc_without_preset_uses_ffmpeg() {
        let (plan, _) = plan_encode(
            &settings(),
            GpuCaps::all(),
            &info(1920, 1080),
            &toolchain(),
            Path::new("/in.mkv"),
            Path::new("/out.mkv"),
        );
        assert_eq!(plan.tool, PlanTool::Ffmpeg);
        assert!(has_pair(&plan.args, "-c:v", "hevc_nvenc"));
        assert!(has_pair(&plan.args, "-cq", "22"));
        // HD preserves resolution: no filter
        assert!(!plan.args.iter().any(|a| a == "-vf"));
    }

    #[test]
    fn test_plan_nvenc_preset_missing_handbrake_falls_back() {
        let mut s = settings();
        s.preset = Some("H.265 NVENC 1080p".to_string());
        let mut tc = toolchain();
        tc.handbrake = None;

        let (plan, _) = plan_encode(
            &s,
            GpuCaps::all(),
            &info(1920, 1080),
            &tc,
            Path::new("/in.mkv"),
            Path::new("/out.mkv"),
        );
        assert_eq!(plan.tool, PlanTool::Ffmpeg);
    }

    #[test]
    fn test_plan_sd_upscale_filters_per_family() {
        let cases = [
            ("nvenc_h265", "scale_cuda=1280:720"),
            ("vaapi_h265", "format=nv12,hwupload,scale_vaapi=w=1280:h=720"),
            ("qsv_h265", "vpp_qsv=w=1280:h=720"),
            ("amf_h265", "scale=1280:720"),
            ("x265", "scale=1280:720"),
            ("x264", "scale=1280:720"),
        ];
        for (encoder, expected_vf) in cases {
            let (plan, _) = plan_encode(
                &settings_with(encoder),
                GpuCaps::all(),
                &info(720, 480),
                &toolchain(),
                Path::new("/in.mkv"),
                Path::new("/out.mkv"),
            );
            assert!(
                has_pair(&plan.args, "-vf", expected_vf),
                "{}: expected -vf {} in {:?}",
                encoder,
                expected_vf,
                plan.args
            );
        }
    }

    #[test]
    fn test_plan_quality_flags_per_family() {
        let cases = [
            ("nvenc_h264", "-cq"),
            ("vaapi_h264", "-qp"),
            ("qsv_h264", "-global_quality"),
            ("x265", "-crf"),
            ("x264", "-crf"),
        ];
        for (encoder, flag) in cases {
            let (plan, _) = plan_encode(
                &settings_with(encoder),
                GpuCaps::all(),
                &info(1920, 1080),
                &toolchain(),
                Path::new("/in.mkv"),
                Path::new("/out.mkv"),
            );
            assert!(
                has_pair(&plan.args, flag, "22"),
                "{}: expected {} 22 in {:?}",
                encoder,
                flag,
                plan.args
            );
        }

        // AMF sets both I- and P-frame quantizers
        let (plan, _) = plan_encode(
            &settings_with("amf_h265"),
            GpuCaps::all(),
            &info(1920, 1080),
            &toolchain(),
            Path::new("/in.mkv"),
            Path::new("/out.mkv"),
        );
        assert!(has_pair(&plan.args, "-qp_i", "22"));
        assert!(has_pair(&plan.args, "-qp_p", "22"));
    }

    #[test]
    fn test_plan_stream_mapping_and_audio() {
        let (plan, _) = plan_encode(
            &settings(),
            GpuCaps::all(),
            &info(1920, 1080),
            &toolchain(),
            Path::new("/in.mkv"),
            Path::new("/out.mkv"),
        );
        assert!(has_pair(&plan.args, "-map", "0:v:0"));
        assert!(has_pair(&plan.args, "-map", "0:a?"));
        assert!(has_pair(&plan.args, "-map", "0:s?"));
        assert!(has_pair(&plan.args, "-c:a", "copy"));
    }

    #[test]
    fn test_plan_audio_transcode_and_subtitle_modes() {
        let mut cfg = EncodingConfig::default();
        cfg.audio_encoder = "aac".to_string();
        cfg.subtitle_mode = "none".to_string();
        let s = EncodeSettings::from_config(&cfg).unwrap();

        let (plan, _) = plan_encode(
            &s,
            GpuCaps::all(),
            &info(1920, 1080),
            &toolchain(),
            Path::new("/in.mkv"),
            Path::new("/out.mkv"),
        );
        assert!(has_pair(&plan.args, "-c:a", "aac"));
        assert!(has_pair(&plan.args, "-b:a", "192k"));
        assert!(plan.args.iter().any(|a| a == "-sn"));
        assert!(!plan.args.iter().any(|a| a == "0:s?"));

        let mut cfg = EncodingConfig::default();
        cfg.subtitle_mode = "first".to_string();
        let s = EncodeSettings::from_config(&cfg).unwrap();
        let (plan, _) = plan_encode(
            &s,
            GpuCaps::all(),
            &info(1920, 1080),
            &toolchain(),
            Path::new("/in.mkv"),
            Path::new("/out.mkv"),
        );
        assert!(has_pair(&plan.args, "-map", "0:s:0?"));
    }

    #[test]
    fn test_plan_output_is_last_argument() {
        let (plan, _) = plan_encode(
            &settings_with("x265"),
            GpuCaps::all(),
            &info(1920, 1080),
            &toolchain(),
            Path::new("/in.mkv"),
            Path::new("/out dir/out.mkv"),
        );
        assert_eq!(plan.args.last().map(String::as_str), Some("/out dir/out.mkv"));
    }
}
