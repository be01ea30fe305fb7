//! SQLite-backed job store.
//!
//! The store is the only coordination point between worker processes; see
//! [`JobStore::claim_next`] for the claim protocol. SQLite has no native
//! locked-row-skip read, so claiming uses an atomic conditional update that
//! stamps a worker token on the single best ready row inside an immediate
//! transaction. Writers contending for the claim observe `SQLITE_BUSY`,
//! surfaced as [`Error::StoreBusy`] for the caller's bounded backoff.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::executor::BackendKind;
use crate::scheduler::job::{Job, JobStatus, WorkloadSpec};

/// Read-only queue aggregates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs currently sitting in the queue (queued or awaiting retry).
    pub depth: usize,
    /// Jobs claimable right now.
    pub ready_now: usize,
    /// Jobs scheduled for a future time.
    pub scheduled_future: usize,
    /// Jobs currently running.
    pub running: usize,
    /// Jobs parked as permanently failed.
    pub failed: usize,
}

const READY_PREDICATE: &str = "status IN ('queued', 'retrying') \
     AND queued_at IS NOT NULL \
     AND launched_at IS NULL \
     AND claimed_by IS NULL \
     AND (retry_count = 0 OR retry_count < max_retries) \
     AND (scheduled_for IS NULL OR scheduled_for <= ?1)";

pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                retry_count INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                backend TEXT NOT NULL,
                workload TEXT NOT NULL,
                requester TEXT,
                execution_id TEXT,
                target_id TEXT,
                claimed_by TEXT,
                claimed_at INTEGER,
                last_error TEXT,
                last_error_at INTEGER,
                created_at INTEGER NOT NULL,
                queued_at INTEGER,
                scheduled_for INTEGER,
                launched_at INTEGER,
                completed_at INTEGER,
                exit_code INTEGER,
                output TEXT,
                metadata TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_ready
            ON jobs (status, priority, queued_at);
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("connection mutex poisoned".to_string()))
    }

    pub fn insert(&self, job: &Job) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO jobs (id, name, status, priority, retry_count, max_retries,
                backend, workload, requester, execution_id, target_id, claimed_by,
                claimed_at, last_error, last_error_at, created_at, queued_at,
                scheduled_for, launched_at, completed_at, exit_code, output, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            params![
                job.id.to_string(),
                job.name,
                job.status.as_str(),
                job.priority,
                job.retry_count,
                job.max_retries,
                job.backend.as_str(),
                serde_json::to_string(&job.workload)?,
                job.requester,
                job.execution_id,
                job.target_id.map(|t| t.to_string()),
                job.claimed_by,
                job.claimed_at.map(|t| t.timestamp_millis()),
                job.last_error,
                job.last_error_at.map(|t| t.timestamp_millis()),
                job.created_at.timestamp_millis(),
                job.queued_at.map(|t| t.timestamp_millis()),
                job.scheduled_for.map(|t| t.timestamp_millis()),
                job.launched_at.map(|t| t.timestamp_millis()),
                job.completed_at.map(|t| t.timestamp_millis()),
                job.exit_code,
                job.output,
                serde_json::to_string(&job.metadata)?,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Job> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![id.to_string()],
            row_to_job,
        )
        .optional()?
        .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    /// Persist a job. Status changes are re-validated against the state
    /// machine before the write lands, as a last line of defense against
    /// callers that mutated fields directly: terminal rows are immutable and
    /// the new status must be reachable from the persisted one through legal
    /// transitions (helpers may chain two, e.g. failed -> retrying).
    pub fn update(&self, job: &Job) -> Result<()> {
        let conn = self.lock()?;
        let persisted: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![job.id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let persisted =
            persisted.ok_or_else(|| Error::JobNotFound(job.id.to_string()))?;
        let from = JobStatus::parse(&persisted)?;
        if from != job.status && !reachable(from, job.status) {
            return Err(Error::InvalidStateTransition {
                from,
                to: job.status,
                legal: from.legal_transitions().to_vec(),
            });
        }

        conn.execute(
            "UPDATE jobs SET name = ?2, status = ?3, priority = ?4, retry_count = ?5,
                max_retries = ?6, backend = ?7, workload = ?8, requester = ?9,
                execution_id = ?10, target_id = ?11, claimed_by = ?12, claimed_at = ?13,
                last_error = ?14, last_error_at = ?15, queued_at = ?16,
                scheduled_for = ?17, launched_at = ?18, completed_at = ?19,
                exit_code = ?20, output = ?21, metadata = ?22
             WHERE id = ?1",
            params![
                job.id.to_string(),
                job.name,
                job.status.as_str(),
                job.priority,
                job.retry_count,
                job.max_retries,
                job.backend.as_str(),
                serde_json::to_string(&job.workload)?,
                job.requester,
                job.execution_id,
                job.target_id.map(|t| t.to_string()),
                job.claimed_by,
                job.claimed_at.map(|t| t.timestamp_millis()),
                job.last_error,
                job.last_error_at.map(|t| t.timestamp_millis()),
                job.queued_at.map(|t| t.timestamp_millis()),
                job.scheduled_for.map(|t| t.timestamp_millis()),
                job.launched_at.map(|t| t.timestamp_millis()),
                job.completed_at.map(|t| t.timestamp_millis()),
                job.exit_code,
                job.output,
                serde_json::to_string(&job.metadata)?,
            ],
        )?;
        Ok(())
    }

    /// Lazy ordered view of claimable jobs: priority descending, then
    /// enqueue order (FIFO tie-break).
    pub fn ready_jobs(
        &self,
        now: DateTime<Utc>,
        limit: Option<usize>,
        exclude: &[Uuid],
    ) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT * FROM jobs WHERE {READY_PREDICATE}
             ORDER BY priority DESC, queued_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![now.timestamp_millis()], row_to_job)?;

        let excluded: Vec<String> = exclude.iter().map(|id| id.to_string()).collect();
        let cap = limit.unwrap_or(usize::MAX);
        let mut jobs = Vec::new();
        for row in rows {
            let job = row?;
            if excluded.contains(&job.id.to_string()) {
                continue;
            }
            jobs.push(job);
            if jobs.len() >= cap {
                break;
            }
        }
        Ok(jobs)
    }

    /// Claim the single best ready job for `worker`.
    ///
    /// Runs inside an immediate transaction so the select and the claim
    /// stamp are atomic against other connections; the update re-checks
    /// `claimed_by IS NULL` to defend against a race between selection and
    /// the write. Returns `None` when no unclaimed ready job exists.
    pub fn claim_next(&self, now: DateTime<Utc>, worker: &str) -> Result<Option<Job>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let candidate: Option<String> = tx
            .query_row(
                &format!(
                    "SELECT id FROM jobs WHERE {READY_PREDICATE}
                     ORDER BY priority DESC, queued_at ASC LIMIT 1"
                ),
                params![now.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?;

        let id = match candidate {
            Some(id) => id,
            None => {
                tx.commit()?;
                return Ok(None);
            }
        };

        let stamped = tx.execute(
            "UPDATE jobs SET claimed_by = ?1, claimed_at = ?2
             WHERE id = ?3 AND claimed_by IS NULL",
            params![worker, now.timestamp_millis(), id],
        )?;
        if stamped == 0 {
            // Lost the race after selection; treat as nothing available.
            tx.commit()?;
            return Ok(None);
        }

        let job = tx.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)?;
        tx.commit()?;
        Ok(Some(job))
    }

    /// Release a claim without any other change (launch could not proceed).
    pub fn release_claim(&self, id: Uuid) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE jobs SET claimed_by = NULL, claimed_at = NULL WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    pub fn running_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE status = 'running'")?;
        let rows = stmt.query_map([], row_to_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    pub fn running_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'running'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn queued_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs
             WHERE status IN ('queued', 'retrying') AND queued_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let conn = self.lock()?;
        let count = |sql: &str, with_now: bool| -> Result<usize> {
            let n: i64 = if with_now {
                conn.query_row(sql, params![now.timestamp_millis()], |row| row.get(0))?
            } else {
                conn.query_row(sql, [], |row| row.get(0))?
            };
            Ok(n as usize)
        };

        Ok(QueueStats {
            depth: count(
                "SELECT COUNT(*) FROM jobs
                 WHERE status IN ('queued', 'retrying') AND queued_at IS NOT NULL",
                false,
            )?,
            ready_now: count(
                &format!("SELECT COUNT(*) FROM jobs WHERE {READY_PREDICATE}"),
                true,
            )?,
            scheduled_future: count(
                "SELECT COUNT(*) FROM jobs
                 WHERE status IN ('queued', 'retrying') AND queued_at IS NOT NULL
                   AND scheduled_for IS NOT NULL AND scheduled_for > ?1",
                true,
            )?,
            running: count("SELECT COUNT(*) FROM jobs WHERE status = 'running'", false)?,
            failed: count("SELECT COUNT(*) FROM jobs WHERE status = 'failed'", false)?,
        })
    }
}

/// Reachable through at most two legal transitions. Helpers chain edges
/// (failed -> retrying, retrying -> queued), so a persisted write may jump
/// one intermediate state.
fn reachable(from: JobStatus, to: JobStatus) -> bool {
    if from.can_transition_to(to) {
        return true;
    }
    from.legal_transitions()
        .iter()
        .any(|mid| mid.can_transition_to(to))
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn json_err(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn uuid_err(err: uuid::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    let backend: String = row.get("backend")?;
    let workload: String = row.get("workload")?;
    let metadata: String = row.get("metadata")?;
    let target_id: Option<String> = row.get("target_id")?;

    Ok(Job {
        id: Uuid::parse_str(&id).map_err(uuid_err)?,
        name: row.get("name")?,
        status: JobStatus::parse(&status).map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "status".to_string(), rusqlite::types::Type::Text)
        })?,
        priority: row.get("priority")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        backend: BackendKind::parse(&backend).map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                0,
                "backend".to_string(),
                rusqlite::types::Type::Text,
            )
        })?,
        workload: serde_json::from_str::<WorkloadSpec>(&workload).map_err(json_err)?,
        requester: row.get("requester")?,
        execution_id: row.get("execution_id")?,
        target_id: target_id
            .map(|t| Uuid::parse_str(&t).map_err(uuid_err))
            .transpose()?,
        claimed_by: row.get("claimed_by")?,
        claimed_at: row.get::<_, Option<i64>>("claimed_at")?.map(millis_to_datetime),
        last_error: row.get("last_error")?,
        last_error_at: row
            .get::<_, Option<i64>>("last_error_at")?
            .map(millis_to_datetime),
        created_at: millis_to_datetime(row.get("created_at")?),
        queued_at: row.get::<_, Option<i64>>("queued_at")?.map(millis_to_datetime),
        scheduled_for: row
            .get::<_, Option<i64>>("scheduled_for")?
            .map(millis_to_datetime),
        launched_at: row
            .get::<_, Option<i64>>("launched_at")?
            .map(millis_to_datetime),
        completed_at: row
            .get::<_, Option<i64>>("completed_at")?
            .map(millis_to_datetime),
        exit_code: row.get("exit_code")?,
        output: row.get("output")?,
        metadata: serde_json::from_str::<HashMap<String, String>>(&metadata).map_err(json_err)?,
    })
}
