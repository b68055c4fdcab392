//! Stability checking: verifying a source directory is no longer being
//! written to.
//!
//! A rip arriving over the shared mount grows for minutes. Before anything
//! touches it we sample the tree, collapsing the sorted (path, size, mtime)
//! tuples of every file into one hash, and declare the source stable once
//! the hash has held still for the configured window. A hard ceiling bounds
//! the whole wait.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::{Duration, Instant, UNIX_EPOCH};
use walkdir::WalkDir;

/// Interval between tree samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on the entire stabilization wait.
pub const HARD_CEILING: Duration = Duration::from_secs(30 * 60);

/// Outcome of waiting for a source directory to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilizeOutcome {
    /// The tree held still for the whole window.
    Stable,
    /// The tree kept changing until the ceiling.
    Unstable,
    /// The directory never appeared before the ceiling.
    Missing,
}

/// Hash the sorted (path, size, mtime) tuples of every file under `dir`.
///
/// Returns None when the directory does not exist. Unreadable entries are
/// skipped rather than failing the sample; a vanished file changes the
/// tuple set and resets the window anyway.
pub fn snapshot_tree(dir: &Path) -> Option<u64> {
    if !dir.exists() {
        return None;
    }

    let mut tuples: Vec<(String, u64, u128)> = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        tuples.push((
            entry.path().to_string_lossy().into_owned(),
            meta.len(),
            mtime,
        ));
    }
    tuples.sort();

    let mut hasher = DefaultHasher::new();
    for (path, size, mtime) in &tuples {
        path.hash(&mut hasher);
        size.hash(&mut hasher);
        mtime.hash(&mut hasher);
    }
    Some(hasher.finish())
}

/// Wait until the tree under `dir` has been unchanged for `quiet_window`.
///
/// Samples every `interval`, gives up at `ceiling`. A directory that never
/// appears reports `Missing`; one that keeps changing reports `Unstable`.
pub async fn wait_for_stable(
    dir: &Path,
    quiet_window: Duration,
    interval: Duration,
    ceiling: Duration,
) -> StabilizeOutcome {
    let started = Instant::now();
    let mut last_hash: Option<u64> = None;
    let mut quiet_since: Option<Instant> = None;

    loop {
        let hash = snapshot_tree(dir);

        match (hash, last_hash) {
            (Some(h), Some(prev)) if h == prev => {
                if let Some(since) = quiet_since {
                    if since.elapsed() >= quiet_window {
                        return StabilizeOutcome::Stable;
                    }
                }
            }
            (Some(h), _) => {
                last_hash = Some(h);
                quiet_since = Some(Instant::now());
            }
            (None, _) => {
                last_hash = None;
                quiet_since = None;
            }
        }

        if started.elapsed() >= ceiling {
            return if last_hash.is_none() {
                StabilizeOutcome::Missing
            } else {
                StabilizeOutcome::Unstable
            };
        }

        tokio::time::sleep(interval).await;
    }
}
