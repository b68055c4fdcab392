//! Publishing artifacts into the classified output tree.
//!
//! Transcodes land in a per-job scratch directory; on success the artifact
//! moves into `completed_root/<classification>/` under a filesystem-safe
//! name. Audio sources are copied file-by-file instead of moved.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Errors that can occur while publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Failed to create the destination directory.
    #[error("failed to create destination directory: {0}")]
    CreateDirFailed(std::io::Error),

    /// Failed to move the artifact into place.
    #[error("failed to move artifact: {0}")]
    MoveFailed(std::io::Error),

    /// Failed to copy a file into place.
    #[error("failed to copy file: {0}")]
    CopyFailed(std::io::Error),
}

/// Maximum length of a cleaned title, in characters.
const MAX_TITLE_CHARS: usize = 240;

/// Characters replaced with `_` because some filesystem refuses them.
const RESERVED_CHARS: &str = "<>:\"/\\|?*";

/// Turn a display title into a filesystem-safe name: control characters
/// stripped, whitespace collapsed, reserved characters replaced, capped at
/// 240 characters.
pub fn clean_title(title: &str) -> String {
    let stripped: String = title.chars().filter(|c| (*c as u32) >= 0x20).collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let replaced: String = collapsed
        .chars()
        .map(|c| if RESERVED_CHARS.contains(c) { '_' } else { c })
        .collect();
    let trimmed: String = replaced.chars().take(MAX_TITLE_CHARS).collect();
    let trimmed = trimmed.trim().to_string();

    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed
    }
}

/// Move a finished transcode into the destination directory.
///
/// Rename first; a cross-filesystem move falls back to copy and remove.
/// An existing file of the same name gets a numbered suffix rather than
/// being clobbered.
pub fn publish_artifact(
    artifact: &Path,
    dest_dir: &Path,
    file_name: &str,
) -> Result<PathBuf, PublishError> {
    fs::create_dir_all(dest_dir).map_err(PublishError::CreateDirFailed)?;
    let dest = next_free_path(dest_dir, file_name);

    if fs::rename(artifact, &dest).is_err() {
        fs::copy(artifact, &dest).map_err(PublishError::MoveFailed)?;
        fs::remove_file(artifact).map_err(PublishError::MoveFailed)?;
    }
    Ok(dest)
}

/// Copy the audio files of a passthrough job into the destination
/// directory. Sources are copied, not moved.
pub fn publish_audio_files(
    files: &[PathBuf],
    dest_dir: &Path,
) -> Result<PathBuf, PublishError> {
    fs::create_dir_all(dest_dir).map_err(PublishError::CreateDirFailed)?;
    for file in files {
        let Some(name) = file.file_name() else { continue };
        fs::copy(file, dest_dir.join(name)).map_err(PublishError::CopyFailed)?;
    }
    Ok(dest_dir.to_path_buf())
}

/// First destination path that does not collide: `name.ext`, then
/// `name (1).ext`, and so on.
fn next_free_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), Some(ext.to_string())),
        None => (file_name.to_string(), None),
    };
    for n in 1.. {
        let name = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

/// Remove the source directory after a successful publish. Failures are
/// logged and never fail the job.
pub fn cleanup_source(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        warn!(path = %dir.display(), error = %e, "source cleanup failed");
    }
}
