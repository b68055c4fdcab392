//! Durable job records backed by an embedded SQLite database.
//!
//! The store is the only shared mutable state in the daemon. Admission
//! inserts, the worker drives status transitions, and the control plane
//! retries and deletes; everything serializes through one connection and
//! every transaction is a handful of point queries. No transaction ever
//! spans a subprocess execution.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::command_guard::EncoderFamily;
use crate::error::ErrorKind;
use crate::planner::Classification;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database error
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Job id does not exist
    #[error("job {0} not found")]
    NotFound(i64),

    /// The requested transition is not legal from the job's current status
    #[error("job {id} is {status}, cannot {action}")]
    InvalidTransition {
        id: i64,
        status: JobStatus,
        action: &'static str,
    },

    /// Retry ceiling reached
    #[error("job {0} has exhausted its retries")]
    RetryExhausted(i64),
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses only leave via explicit retry or delete.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted notification and everything that happened to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub title: String,
    pub source_hint: String,
    pub source_resolved: Option<PathBuf>,
    pub status: JobStatus,
    pub progress: f64,
    pub retry_count: u32,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub output_path: Option<PathBuf>,
    pub classification: Option<Classification>,
    pub encoder_family: Option<EncoderFamily>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate counters for the stats endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_processed: u64,
    pub avg_duration_secs: Option<f64>,
}

const JOB_COLUMNS: &str = "id, title, source_hint, source_resolved, status, progress, \
     retry_count, error, error_kind, output_path, classification, encoder_family, \
     created_at, updated_at, started_at, completed_at";

/// Decide whether a progress update is worth a database write.
///
/// A commit happens when the value reaches 100, moves at least 5 points
/// past the last committed value, or at least 10 seconds have passed since
/// the last commit. Regressions are dropped: progress is non-decreasing
/// within a running episode.
pub fn should_commit_progress(last: f64, new: f64, secs_since_commit: Option<i64>) -> bool {
    if new < last {
        return false;
    }
    if new >= 100.0 || new >= last + 5.0 {
        return true;
    }
    match secs_since_commit {
        Some(secs) => secs >= 10,
        // No commit yet this episode: take the first sample as the baseline
        None => true,
    }
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the job database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                title            TEXT NOT NULL,
                source_hint      TEXT NOT NULL,
                source_resolved  TEXT,
                status           TEXT NOT NULL DEFAULT 'pending',
                progress         REAL NOT NULL DEFAULT 0,
                retry_count      INTEGER NOT NULL DEFAULT 0,
                error            TEXT,
                error_kind       TEXT,
                output_path      TEXT,
                classification   TEXT,
                encoder_family   TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                started_at       TEXT,
                completed_at     TEXT,
                last_progress_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status_order
                ON jobs (status, created_at, id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new PENDING job. Returns the stored record with its id.
    pub fn insert(&self, title: &str, source_hint: &str) -> Result<Job, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO jobs (title, source_hint, status, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?3)",
            params![title, source_hint, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        Self::get_locked(&conn, id)
    }

    /// Fetch a job by id.
    pub fn get(&self, id: i64) -> Result<Job, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::get_locked(&conn, id)
    }

    fn get_locked(conn: &Connection, id: i64) -> Result<Job, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id],
            job_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound(id))
    }

    /// Atomically claim the oldest PENDING job: mark it RUNNING and stamp
    /// started_at. Returns None when the queue is empty.
    pub fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let job = tx
            .query_row(
                &format!(
                    "SELECT {} FROM jobs WHERE status = 'pending'
                     ORDER BY created_at, id LIMIT 1",
                    JOB_COLUMNS
                ),
                [],
                job_from_row,
            )
            .optional()?;

        let Some(mut job) = job else {
            return Ok(None);
        };

        let now = Utc::now();
        tx.execute(
            "UPDATE jobs SET status = 'running', progress = 0,
                    started_at = ?1, updated_at = ?1, last_progress_at = NULL
             WHERE id = ?2",
            params![now.to_rfc3339(), job.id],
        )?;
        tx.commit()?;

        job.status = JobStatus::Running;
        job.progress = 0.0;
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job))
    }

    /// Record the resolved source directory once stabilization has finished.
    pub fn set_source_resolved(&self, id: i64, path: &Path) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs SET source_resolved = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                path.to_string_lossy().into_owned(),
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Record the planner's classification and resolved encoder family.
    pub fn set_plan(
        &self,
        id: i64,
        classification: Classification,
        family: EncoderFamily,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs SET classification = ?1, encoder_family = ?2, updated_at = ?3
             WHERE id = ?4",
            params![
                classification.as_str(),
                family.as_str(),
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Apply a throttled progress update. Returns whether a write happened.
    pub fn update_progress(&self, id: i64, progress: f64) -> Result<bool, StoreError> {
        let progress = progress.clamp(0.0, 100.0);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let row: Option<(String, f64, Option<String>)> = tx
            .query_row(
                "SELECT status, progress, last_progress_at FROM jobs WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((status, last, last_commit)) = row else {
            return Err(StoreError::NotFound(id));
        };
        if status != "running" {
            // Progress is only meaningful inside a running episode
            return Ok(false);
        }

        let now = Utc::now();
        let elapsed = last_commit
            .as_deref()
            .and_then(parse_ts_opt)
            .map(|t| (now - t).num_seconds());

        if !should_commit_progress(last, progress, elapsed) {
            return Ok(false);
        }

        tx.execute(
            "UPDATE jobs SET progress = ?1, updated_at = ?2, last_progress_at = ?2
             WHERE id = ?3",
            params![progress, now.to_rfc3339(), id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Transition a RUNNING job to a terminal status.
    pub fn finish(
        &self,
        id: i64,
        status: JobStatus,
        error_kind: Option<ErrorKind>,
        error: Option<&str>,
        output_path: Option<&Path>,
    ) -> Result<Job, StoreError> {
        debug_assert!(status.is_terminal());
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let current = Self::status_of(&tx, id)?;
        if current != JobStatus::Running {
            return Err(StoreError::InvalidTransition {
                id,
                status: current,
                action: "finish",
            });
        }

        let now = Utc::now().to_rfc3339();
        let progress_sql = if status == JobStatus::Completed {
            // Completion implies full progress
            "100.0"
        } else {
            "progress"
        };
        tx.execute(
            &format!(
                "UPDATE jobs SET status = ?1, error = ?2, error_kind = ?3,
                        output_path = ?4, progress = {}, completed_at = ?5, updated_at = ?5
                 WHERE id = ?6",
                progress_sql
            ),
            params![
                status.as_str(),
                error,
                error_kind.map(|k| k.as_str()),
                output_path.map(|p| p.to_string_lossy().into_owned()),
                now,
                id
            ],
        )?;
        tx.commit()?;
        Self::get_locked(&conn, id)
    }

    /// Requeue a FAILED job, incrementing its retry counter. Refused once
    /// the counter has reached the configured ceiling.
    pub fn requeue(&self, id: i64, max_retry_count: u32) -> Result<Job, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let (current, retry_count): (JobStatus, u32) = {
            let row: Option<(String, u32)> = tx
                .query_row(
                    "SELECT status, retry_count FROM jobs WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((status, retries)) = row else {
                return Err(StoreError::NotFound(id));
            };
            let status = JobStatus::parse(&status).unwrap_or(JobStatus::Failed);
            (status, retries)
        };

        if current != JobStatus::Failed {
            return Err(StoreError::InvalidTransition {
                id,
                status: current,
                action: "retry",
            });
        }
        if retry_count >= max_retry_count {
            return Err(StoreError::RetryExhausted(id));
        }

        tx.execute(
            "UPDATE jobs SET status = 'pending', retry_count = retry_count + 1,
                    error = NULL, error_kind = NULL, progress = 0,
                    output_path = NULL, started_at = NULL, completed_at = NULL,
                    last_progress_at = NULL, updated_at = ?1
             WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        tx.commit()?;
        Self::get_locked(&conn, id)
    }

    /// Push a RUNNING job back to PENDING without touching its retry
    /// counter. Used for shutdown and startup recovery.
    pub fn reset_to_pending(&self, id: i64, kind: ErrorKind) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs SET status = 'pending', error = ?1, error_kind = ?1,
                    progress = 0, started_at = NULL, completed_at = NULL,
                    last_progress_at = NULL, updated_at = ?2
             WHERE id = ?3 AND status = 'running'",
            params![kind.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Startup recovery: every job left RUNNING by a previous process
    /// instance goes back to PENDING with error "interrupted". Returns how
    /// many jobs were recovered.
    pub fn recover_orphans(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs SET status = 'pending', error = ?1, error_kind = ?1,
                    progress = 0, started_at = NULL, last_progress_at = NULL,
                    updated_at = ?2
             WHERE status = 'running'",
            params![ErrorKind::Interrupted.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(n)
    }

    /// Delete a job. Refused while the job is RUNNING.
    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let current = Self::status_of(&tx, id)?;
        if current == JobStatus::Running {
            return Err(StoreError::InvalidTransition {
                id,
                status: current,
                action: "delete",
            });
        }
        tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// Paginated listing, newest first, optionally filtered by status.
    /// The limit is capped at 500.
    pub fn list(
        &self,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Job>, u64), StoreError> {
        let limit = limit.min(500);
        let conn = self.conn.lock().unwrap();

        let (total, jobs) = match status {
            Some(status) => {
                let total: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                    params![status.as_str()],
                    |row| row.get(0),
                )?;
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM jobs WHERE status = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                    JOB_COLUMNS
                ))?;
                let jobs = stmt
                    .query_map(params![status.as_str(), limit, offset], job_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                (total, jobs)
            }
            None => {
                let total: u64 =
                    conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM jobs
                     ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                    JOB_COLUMNS
                ))?;
                let jobs = stmt
                    .query_map(params![limit, offset], job_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                (total, jobs)
            }
        };

        Ok((jobs, total))
    }

    /// Counts per status plus the average completed-job duration.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock().unwrap();

        let mut stats = StoreStats {
            pending: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            total_processed: 0,
            avg_duration_secs: None,
        };

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                "pending" => stats.pending = count,
                "running" => stats.running = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "cancelled" => stats.cancelled = count,
                _ => {}
            }
        }
        stats.total_processed = stats.completed + stats.failed + stats.cancelled;

        let mut stmt = conn.prepare(
            "SELECT started_at, completed_at FROM jobs
             WHERE status = 'completed' AND started_at IS NOT NULL
               AND completed_at IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut sum = 0.0;
        let mut n = 0u64;
        for row in rows {
            let (started, completed) = row?;
            if let (Some(s), Some(c)) = (parse_ts_opt(&started), parse_ts_opt(&completed)) {
                sum += (c - s).num_milliseconds() as f64 / 1000.0;
                n += 1;
            }
        }
        if n > 0 {
            stats.avg_duration_secs = Some(sum / n as f64);
        }

        Ok(stats)
    }

    /// Number of PENDING jobs, reported by the health endpoint.
    pub fn count_pending(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?)
    }

    fn status_of(conn: &Connection, id: i64) -> Result<JobStatus, StoreError> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(status) = status else {
            return Err(StoreError::NotFound(id));
        };
        Ok(JobStatus::parse(&status).unwrap_or(JobStatus::Failed))
    }
}

fn parse_ts_opt(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn required_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts_opt(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("bad timestamp: {}", s).into(),
        )
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status_str: String = row.get(4)?;
    let status = JobStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("bad status: {}", status_str).into(),
        )
    })?;

    Ok(Job {
        id: row.get(0)?,
        title: row.get(1)?,
        source_hint: row.get(2)?,
        source_resolved: row.get::<_, Option<String>>(3)?.map(PathBuf::from),
        status,
        progress: row.get(5)?,
        retry_count: row.get(6)?,
        error: row.get(7)?,
        error_kind: row.get(8)?,
        output_path: row.get::<_, Option<String>>(9)?.map(PathBuf::from),
        classification: row
            .get::<_, Option<String>>(10)?
            .as_deref()
            .and_then(Classification::parse),
        encoder_family: row
            .get::<_, Option<String>>(11)?
            .as_deref()
            .and_then(EncoderFamily::parse),
        created_at: required_ts(12, row.get(12)?)?,
        updated_at: required_ts(13, row.get(13)?)?,
        started_at: row
            .get::<_, Option<String>>(14)?
            .as_deref()
            .and_then(parse_ts_opt),
        completed_at: row
            .get::<_, Option<String>>(15)?
            .as_deref()
            .and_then(parse_ts_opt),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store() -> Store {
        Store::open_in_memory().expect("in-memory store")
    }

    #[test]
    fn test_insert_and_get() {
        let store = store();
        let job = store.insert("Inception (2010)", "Inception (2010)").unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.retry_count, 0);
        assert!(job.error.is_none());
        assert!(job.started_at.is_none());
        assert_eq!(job.created_at, job.updated_at);

        let fetched = store.get(job.id).unwrap();
        assert_eq!(fetched, job);
    }

    #[test]
    fn test_get_missing_job() {
        let store = store();
        assert!(matches!(store.get(42), Err(StoreError::NotFound(42))));
    }

    #[test]
    fn test_claim_next_oldest_first() {
        let store = store();
        let j1 = store.insert("first", "first").unwrap();
        let j2 = store.insert("second", "second").unwrap();

        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, j1.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, j2.id);

        assert!(store.claim_next().unwrap().is_none());
    }

    #[test]
    fn test_claim_skips_terminal_jobs() {
        let store = store();
        let j1 = store.insert("a", "a").unwrap();
        store.claim_next().unwrap().unwrap();
        store
            .finish(j1.id, JobStatus::Failed, Some(ErrorKind::Encode), Some("boom"), None)
            .unwrap();

        let j2 = store.insert("b", "b").unwrap();
        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, j2.id);
    }

    #[test]
    fn test_progress_throttle() {
        let store = store();
        let job = store.insert("t", "t").unwrap();
        store.claim_next().unwrap().unwrap();

        // First sample sets the baseline
        assert!(store.update_progress(job.id, 3.0).unwrap());
        // Small step inside the window is dropped
        assert!(!store.update_progress(job.id, 4.0).unwrap());
        assert_eq!(store.get(job.id).unwrap().progress, 3.0);
        // Five points past the committed value goes through
        assert!(store.update_progress(job.id, 8.5).unwrap());
        // 100 always goes through
        assert!(store.update_progress(job.id, 100.0).unwrap());
        assert_eq!(store.get(job.id).unwrap().progress, 100.0);
    }

    #[test]
    fn test_progress_never_decreases() {
        let store = store();
        let job = store.insert("t", "t").unwrap();
        store.claim_next().unwrap().unwrap();

        assert!(store.update_progress(job.id, 50.0).unwrap());
        assert!(!store.update_progress(job.id, 20.0).unwrap());
        assert_eq!(store.get(job.id).unwrap().progress, 50.0);
    }

    #[test]
    fn test_progress_ignored_unless_running() {
        let store = store();
        let job = store.insert("t", "t").unwrap();
        assert!(!store.update_progress(job.id, 50.0).unwrap());
        assert_eq!(store.get(job.id).unwrap().progress, 0.0);
    }

    #[test]
    fn test_finish_completed_sets_output_and_progress() {
        let store = store();
        let job = store.insert("t", "t").unwrap();
        store.claim_next().unwrap().unwrap();

        let done = store
            .finish(
                job.id,
                JobStatus::Completed,
                None,
                None,
                Some(Path::new("/completed/movies/t.mkv")),
            )
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100.0);
        assert_eq!(
            done.output_path,
            Some(PathBuf::from("/completed/movies/t.mkv"))
        );
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_finish_requires_running() {
        let store = store();
        let job = store.insert("t", "t").unwrap();
        assert!(matches!(
            store.finish(job.id, JobStatus::Failed, Some(ErrorKind::Encode), None, None),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_requeue_until_exhausted() {
        let store = store();
        let job = store.insert("t", "t").unwrap();
        let max = 2;

        for attempt in 1..=max {
            store.claim_next().unwrap().unwrap();
            store
                .finish(job.id, JobStatus::Failed, Some(ErrorKind::Encode), Some("rc=1"), None)
                .unwrap();
            let requeued = store.requeue(job.id, max).unwrap();
            assert_eq!(requeued.status, JobStatus::Pending);
            assert_eq!(requeued.retry_count, attempt);
            assert!(requeued.error.is_none());
            assert_eq!(requeued.progress, 0.0);
        }

        store.claim_next().unwrap().unwrap();
        store
            .finish(job.id, JobStatus::Failed, Some(ErrorKind::Encode), Some("rc=1"), None)
            .unwrap();
        assert!(matches!(
            store.requeue(job.id, max),
            Err(StoreError::RetryExhausted(_))
        ));
        assert_eq!(store.get(job.id).unwrap().retry_count, max);
    }

    #[test]
    fn test_requeue_requires_failed() {
        let store = store();
        let job = store.insert("t", "t").unwrap();
        assert!(matches!(
            store.requeue(job.id, 3),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_recover_orphans() {
        let store = store();
        let j1 = store.insert("a", "a").unwrap();
        let j2 = store.insert("b", "b").unwrap();
        store.claim_next().unwrap().unwrap();
        store.claim_next().unwrap().unwrap();
        store.update_progress(j1.id, 37.0).unwrap();

        let recovered = store.recover_orphans().unwrap();
        assert_eq!(recovered, 2);

        for id in [j1.id, j2.id] {
            let job = store.get(id).unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.progress, 0.0);
            assert_eq!(job.error.as_deref(), Some("interrupted"));
            assert_eq!(job.retry_count, 0);
            assert!(job.started_at.is_none());
        }
    }

    #[test]
    fn test_reset_to_pending_on_shutdown() {
        let store = store();
        let job = store.insert("t", "t").unwrap();
        store.claim_next().unwrap().unwrap();

        store.reset_to_pending(job.id, ErrorKind::Shutdown).unwrap();
        let job = store.get(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.error.as_deref(), Some("shutdown"));
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn test_delete_refused_while_running() {
        let store = store();
        let job = store.insert("t", "t").unwrap();
        store.claim_next().unwrap().unwrap();

        assert!(matches!(
            store.delete(job.id),
            Err(StoreError::InvalidTransition { .. })
        ));

        store
            .finish(job.id, JobStatus::Cancelled, None, None, None)
            .unwrap();
        store.delete(job.id).unwrap();
        assert!(matches!(store.get(job.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_list_filter_and_pagination() {
        let store = store();
        for i in 0..5 {
            store.insert(&format!("job{}", i), "hint").unwrap();
        }
        store.claim_next().unwrap().unwrap();

        let (all, total) = store.list(None, 500, 0).unwrap();
        assert_eq!(total, 5);
        assert_eq!(all.len(), 5);

        let (pending, total) = store.list(Some(JobStatus::Pending), 2, 0).unwrap();
        assert_eq!(total, 4);
        assert_eq!(pending.len(), 2);

        let (page2, _) = store.list(Some(JobStatus::Pending), 2, 2).unwrap();
        assert_eq!(page2.len(), 2);
        assert_ne!(pending[0].id, page2[0].id);

        let (running, total) = store.list(Some(JobStatus::Running), 500, 0).unwrap();
        assert_eq!(total, 1);
        assert_eq!(running.len(), 1);
    }

    #[test]
    fn test_stats_counts_and_average() {
        let store = store();
        let j1 = store.insert("a", "a").unwrap();
        store.insert("b", "b").unwrap();
        store.claim_next().unwrap().unwrap();
        store
            .finish(
                j1.id,
                JobStatus::Completed,
                None,
                None,
                Some(Path::new("/out.mkv")),
            )
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total_processed, 1);
        // started and completed within this test, duration is tiny but present
        let avg = stats.avg_duration_secs.unwrap();
        assert!(avg >= 0.0 && avg < 60.0);
    }

    #[test]
    fn test_count_pending() {
        let store = store();
        store.insert("a", "a").unwrap();
        store.insert("b", "b").unwrap();
        assert_eq!(store.count_pending().unwrap(), 2);
        store.claim_next().unwrap().unwrap();
        assert_eq!(store.count_pending().unwrap(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // The throttle's three admission rules, stated directly.
        #[test]
        fn prop_progress_throttle_rules(
            last in 0.0f64..100.0,
            new in 0.0f64..100.0,
            elapsed in proptest::option::of(0i64..120),
        ) {
            let committed = should_commit_progress(last, new, elapsed);
            if new < last {
                prop_assert!(!committed);
            } else if new >= 100.0 || new >= last + 5.0 {
                prop_assert!(committed);
            } else {
                let expected = match elapsed {
                    Some(secs) => secs >= 10,
                    None => true,
                };
                prop_assert_eq!(committed, expected);
            }
        }

        // No interleaving of failures and requeues pushes retry_count past
        // the ceiling.
        #[test]
        fn prop_retry_count_never_exceeds_cap(max in 0u32..5, attempts in 0usize..12) {
            let store = Store::open_in_memory().unwrap();
            let job = store.insert("t", "t").unwrap();

            for _ in 0..attempts {
                if store.claim_next().unwrap().is_none() {
                    break;
                }
                store
                    .finish(job.id, JobStatus::Failed, Some(ErrorKind::Encode), Some("x"), None)
                    .unwrap();
                let _ = store.requeue(job.id, max);
            }

            prop_assert!(store.get(job.id).unwrap().retry_count <= max);
        }
    }
}
