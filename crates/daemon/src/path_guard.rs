//! Path validation for webhook-supplied directory hints.
//!
//! Every filesystem path that reaches a subprocess or a publish step flows
//! through `resolve`: the hint is scrubbed for hostile bytes, joined onto
//! the configured base, canonicalized, and checked for containment after
//! canonicalization so symlink escapes are caught.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for path validation
#[derive(Debug, Error)]
pub enum PathGuardError {
    /// The hint contains a byte or token that is never allowed.
    #[error("path hint rejected: {0}")]
    Hostile(&'static str),

    /// The canonicalized candidate is outside the base directory.
    #[error("path escapes the base directory")]
    Escape,

    /// The candidate does not exist under the base.
    #[error("path does not exist: {0}")]
    NotFound(PathBuf),

    /// IO error during canonicalization.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Check a directory hint for hostile content without touching the
/// filesystem. Used at admission time, before a job is even created.
pub fn scrub_hint(hint: &str) -> Result<(), PathGuardError> {
    if hint.is_empty() {
        return Err(PathGuardError::Hostile("empty hint"));
    }
    if hint.bytes().any(|b| b == 0) {
        return Err(PathGuardError::Hostile("null byte"));
    }
    if hint.chars().any(|c| (c as u32) < 0x20) {
        return Err(PathGuardError::Hostile("control character"));
    }
    if hint.contains('\\') {
        return Err(PathGuardError::Hostile("backslash"));
    }
    if hint.starts_with('/') {
        return Err(PathGuardError::Hostile("absolute path"));
    }
    if has_drive_letter(hint) {
        return Err(PathGuardError::Hostile("drive letter"));
    }
    if hint.split('/').any(|segment| segment == "..") {
        return Err(PathGuardError::Hostile("parent traversal"));
    }
    // Tokens with shell or expansion meaning are refused outright even
    // though argv is never shell-interpreted.
    if hint.contains('~') {
        return Err(PathGuardError::Hostile("tilde"));
    }
    if hint.contains('$') {
        return Err(PathGuardError::Hostile("dollar sign"));
    }
    if hint.contains('`') {
        return Err(PathGuardError::Hostile("backtick"));
    }
    if hint.contains(';') {
        return Err(PathGuardError::Hostile("semicolon"));
    }
    Ok(())
}

fn has_drive_letter(hint: &str) -> bool {
    let mut chars = hint.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(c), Some(':')) if c.is_ascii_alphabetic()
    )
}

/// Resolve a hint against a base directory.
///
/// The hint is scrubbed, joined onto `base`, and both sides are
/// canonicalized; the candidate must be the base itself or a descendant.
/// The candidate must exist (canonicalization requires it), which is what
/// the worker wants: a hint naming a directory that has not arrived yet
/// surfaces as `NotFound`.
pub fn resolve(base: &Path, hint: &str) -> Result<PathBuf, PathGuardError> {
    scrub_hint(hint)?;

    let base_canon = base.canonicalize()?;
    let candidate = match base_canon.join(hint).canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PathGuardError::NotFound(base_canon.join(hint)));
        }
        Err(e) => return Err(PathGuardError::Io(e)),
    };

    if candidate == base_canon || candidate.starts_with(&base_canon) {
        Ok(candidate)
    } else {
        Err(PathGuardError::Escape)
    }
}
