//! Stable error kinds shared between job records and API responses.
//!
//! Every failure a client or operator can observe carries one of these
//! machine-readable kind strings, either in the job's `error_kind` column
//! or in the `error_kind` field of a 4xx response body.

use serde::{Deserialize, Serialize};

/// Machine-readable failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request body could not be parsed or failed validation.
    Malformed,
    /// Missing or wrong credential.
    Unauthorized,
    /// Request body exceeded the admission size cap.
    Oversized,
    /// Source directory never appeared under the raw root.
    Missing,
    /// Source files kept changing past the stabilization ceiling.
    Unstable,
    /// Not enough free space on the work filesystem.
    Nospace,
    /// Encoder subprocess exited nonzero.
    Encode,
    /// Moving the artifact into the completed tree failed.
    Publish,
    /// Job was interrupted by daemon shutdown; requeued automatically.
    Shutdown,
    /// Job was found RUNNING at startup; requeued automatically.
    Interrupted,
    /// Retry ceiling reached; the job stays FAILED.
    RetryExhausted,
}

impl ErrorKind {
    /// The stable string stored on jobs and returned to clients.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Malformed => "malformed",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Oversized => "oversized",
            ErrorKind::Missing => "missing",
            ErrorKind::Unstable => "unstable",
            ErrorKind::Nospace => "nospace",
            ErrorKind::Encode => "encode",
            ErrorKind::Publish => "publish",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::RetryExhausted => "retry_exhausted",
        }
    }

    /// Whether the control-plane retry endpoint may requeue a job that
    /// failed with this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Missing
                | ErrorKind::Unstable
                | ErrorKind::Nospace
                | ErrorKind::Encode
                | ErrorKind::Publish
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
