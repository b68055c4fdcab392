//! Webhook admission: parsing, validation, and the accept/ignore decision.
//!
//! The ripper's notifier speaks two shapes. Shape A is a generic
//! notification whose body carries "<title> rip complete"; Shape B names
//! the source directory explicitly. Broadcast notifiers fire on every
//! event, so payloads that are not about a finished rip are acknowledged
//! and dropped rather than rejected.

use serde::Deserialize;
use std::sync::OnceLock;
use thiserror::Error;

use crate::path_guard;

/// Admission body size cap.
pub const MAX_BODY_BYTES: usize = 10 * 1024;

const MAX_TITLE_LEN: usize = 500;
const MAX_BODY_LEN: usize = 2000;
const MAX_PATH_LEN: usize = 1000;
const MAX_JOB_ID_LEN: usize = 50;

/// Error type for rejected notifications; each maps to a 4xx.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("request body exceeds {MAX_BODY_BYTES} bytes")]
    Oversized,

    #[error("malformed notification: {0}")]
    Malformed(String),

    #[error("webhook secret mismatch")]
    Unauthorized,
}

/// What to do with a syntactically valid notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Create a job for this title and source directory hint.
    Accept { title: String, source_hint: String },
    /// Acknowledge with 2xx but create nothing.
    Ignore,
}

/// Raw wire payload covering both shapes.
#[derive(Debug, Deserialize)]
struct RawNotification {
    title: Option<String>,
    body: Option<String>,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: Option<String>,
    path: Option<String>,
    job_id: Option<String>,
    status: Option<String>,
}

fn rip_complete_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)^(.+?)\s+(?:rip|processing) complete").expect("static regex")
    })
}

/// Extract the source directory name from a Shape A body.
///
/// Matches "<name> rip complete" or "<name> processing complete",
/// case-insensitively, anchored at the start of the body.
pub fn extract_rip_hint(body: &str) -> Option<String> {
    rip_complete_re()
        .captures(body)
        .map(|caps| caps[1].trim().to_string())
}

/// Verify the webhook secret header. Always enforced when configured.
pub fn check_webhook_secret(
    configured: &str,
    header: Option<&str>,
) -> Result<(), AdmissionError> {
    if configured.is_empty() {
        return Ok(());
    }
    match header {
        Some(value) if value == configured => Ok(()),
        _ => Err(AdmissionError::Unauthorized),
    }
}

/// Statuses a structured notifier uses for a successful rip.
fn status_is_success(status: &str) -> bool {
    matches!(
        status.to_lowercase().as_str(),
        "success" | "complete" | "completed" | "ok"
    )
}

/// Parse and validate a notification body into an admission decision.
pub fn parse_notification(body: &[u8]) -> Result<AdmissionOutcome, AdmissionError> {
    if body.len() > MAX_BODY_BYTES {
        return Err(AdmissionError::Oversized);
    }

    let raw: RawNotification = serde_json::from_slice(body)
        .map_err(|e| AdmissionError::Malformed(format!("invalid JSON: {}", e)))?;

    let title = match &raw.title {
        Some(t) if !t.is_empty() => {
            if t.chars().count() > MAX_TITLE_LEN {
                return Err(AdmissionError::Malformed("title too long".into()));
            }
            t.clone()
        }
        _ => return Err(AdmissionError::Malformed("missing title".into())),
    };

    if let Some(body_text) = &raw.body {
        if body_text.chars().count() > MAX_BODY_LEN {
            return Err(AdmissionError::Malformed("body too long".into()));
        }
    }
    if let Some(job_id) = &raw.job_id {
        if job_id.chars().count() > MAX_JOB_ID_LEN {
            return Err(AdmissionError::Malformed("job_id too long".into()));
        }
    }

    // A non-success status only passes when the body independently
    // announces a finished rip.
    if let Some(status) = &raw.status {
        if !status_is_success(status) {
            return match raw.body.as_deref().and_then(extract_rip_hint) {
                Some(hint) => {
                    validate_hint(&hint)?;
                    Ok(AdmissionOutcome::Accept {
                        title,
                        source_hint: hint,
                    })
                }
                None => Ok(AdmissionOutcome::Ignore),
            };
        }
    }

    // Shape B: explicit directory basename under the raw root
    if let Some(path) = &raw.path {
        if path.chars().count() > MAX_PATH_LEN {
            return Err(AdmissionError::Malformed("path too long".into()));
        }
        validate_hint(path)?;
        return Ok(AdmissionOutcome::Accept {
            title,
            source_hint: path.clone(),
        });
    }

    // Shape A: the body has to announce a finished rip
    match raw.body.as_deref().and_then(extract_rip_hint) {
        Some(hint) => {
            validate_hint(&hint)?;
            Ok(AdmissionOutcome::Accept {
                title,
                source_hint: hint,
            })
        }
        None => Ok(AdmissionOutcome::Ignore),
    }
}

/// A hint names exactly one directory under the raw root: no separators,
/// no traversal, no hostile bytes.
fn validate_hint(hint: &str) -> Result<(), AdmissionError> {
    if hint.contains('/') {
        return Err(AdmissionError::Malformed(
            "path must be a directory basename".into(),
        ));
    }
    path_guard::scrub_hint(hint)
        .map_err(|e| AdmissionError::Malformed(e.to_string()))
}
