//! Durable job table behind the background queue. Delivery is
//! at-least-once: a claimed job holds a lease, and a job whose lease runs
//! out is handed to the next worker that asks.

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{JobRow, JobStatus};
use crate::{Database, Result, format_timestamp};

const JOB_COLUMNS: &str = "id, kind, payload, priority, status, attempts, max_attempts, run_at, last_error, created_at, finished_at";

/// How long finished jobs stay around for inspection.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub completed_age: Duration,
    pub completed_keep: u32,
    pub failed_age: Duration,
    pub failed_keep: u32,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed_age: Duration::hours(24),
            completed_keep: 100,
            failed_age: Duration::days(7),
            failed_keep: 200,
        }
    }
}

impl Database {
    // -- Jobs --

    pub fn enqueue_job(
        &self,
        kind: &str,
        payload: &Value,
        priority: i64,
        max_attempts: u32,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let ts = format_timestamp(&Utc::now());
        let payload = serde_json::to_string(payload)?;
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, kind, payload, priority, max_attempts, run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)",
                params![id.to_string(), kind, payload, priority, max_attempts, ts],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn claim_job(&self, lease: Duration) -> Result<Option<JobRow>> {
        self.claim_job_at(Utc::now(), lease)
    }

    /// Claim the next ready job: pending and due, or running with an
    /// expired lease. Lower `priority` values run first. Expired leases on
    /// jobs with no attempts left are failed instead of reclaimed.
    pub fn claim_job_at(&self, now: DateTime<Utc>, lease: Duration) -> Result<Option<JobRow>> {
        let ts = format_timestamp(&now);
        let locked_until = format_timestamp(&(now + lease));
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            tx.execute(
                "UPDATE jobs SET status = 'failed', last_error = 'lease expired',
                        locked_until = NULL, finished_at = ?1, updated_at = ?1
                 WHERE status = 'running' AND locked_until < ?1 AND attempts >= max_attempts",
                [&ts],
            )?;

            let id: Option<String> = tx
                .query_row(
                    "SELECT id FROM jobs
                     WHERE (status = 'pending' AND run_at <= ?1)
                        OR (status = 'running' AND locked_until < ?1)
                     ORDER BY priority, run_at, id
                     LIMIT 1",
                    [&ts],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(id) = id else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE jobs SET status = 'running', attempts = attempts + 1,
                        locked_until = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![locked_until, ts, id],
            )?;
            let job = tx.query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                [&id],
                read_job,
            )?;
            tx.commit()?;
            Ok(Some(job))
        })
    }

    // The finishers below take the attempt number the worker claimed and
    // only touch the row while that claim is still the running one. They
    // return false when the lease was lost to another worker.

    pub fn complete_job(&self, id: &str, attempt: u32) -> Result<bool> {
        let ts = format_timestamp(&Utc::now());
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE jobs SET status = 'completed', locked_until = NULL,
                        finished_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'running' AND attempts = ?3",
                params![ts, id, attempt],
            )?;
            Ok(n == 1)
        })
    }

    /// Put a failed attempt back in the queue, due at `run_at`.
    pub fn retry_job(
        &self,
        id: &str,
        attempt: u32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<bool> {
        let ts = format_timestamp(&Utc::now());
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE jobs SET status = 'pending', locked_until = NULL, last_error = ?1,
                        run_at = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'running' AND attempts = ?5",
                params![error, format_timestamp(&run_at), ts, id, attempt],
            )?;
            Ok(n == 1)
        })
    }

    pub fn fail_job(&self, id: &str, attempt: u32, error: &str) -> Result<bool> {
        let ts = format_timestamp(&Utc::now());
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE jobs SET status = 'failed', locked_until = NULL, last_error = ?1,
                        finished_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND status = 'running' AND attempts = ?4",
                params![error, ts, id, attempt],
            )?;
            Ok(n == 1)
        })
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRow>> {
        self.with_conn(|conn| {
            let job = conn
                .query_row(
                    &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                    [id],
                    read_job,
                )
                .optional()?;
            Ok(job)
        })
    }

    /// Most recently failed jobs first.
    pub fn failed_jobs(&self, limit: u32) -> Result<Vec<JobRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM jobs WHERE status = 'failed'
                 ORDER BY finished_at DESC, id DESC LIMIT ?1",
                JOB_COLUMNS
            ))?;
            let rows = stmt
                .query_map([limit], read_job)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn prune_jobs(&self, retention: &Retention) -> Result<usize> {
        self.prune_jobs_at(Utc::now(), retention)
    }

    /// Delete finished jobs that are older than the retention age or fall
    /// outside the newest `keep` of their status.
    pub fn prune_jobs_at(&self, now: DateTime<Utc>, retention: &Retention) -> Result<usize> {
        let rules = [
            (
                JobStatus::Completed,
                format_timestamp(&(now - retention.completed_age)),
                retention.completed_keep,
            ),
            (
                JobStatus::Failed,
                format_timestamp(&(now - retention.failed_age)),
                retention.failed_keep,
            ),
        ];
        self.with_conn_mut(|conn| {
            let mut pruned = 0;
            for (status, cutoff, keep) in &rules {
                pruned += conn.execute(
                    "DELETE FROM jobs
                     WHERE status = ?1
                       AND (finished_at < ?2
                            OR id NOT IN (SELECT id FROM jobs WHERE status = ?1
                                          ORDER BY finished_at DESC, id DESC LIMIT ?3))",
                    params![status.as_str(), cutoff, keep],
                )?;
            }
            Ok(pruned)
        })
    }
}

fn read_job(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    let payload: String = row.get(2)?;
    let payload: Value = serde_json::from_str(&payload)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let status: String = row.get(4)?;
    let status = JobStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            format!("unknown job status '{}'", status).into(),
        )
    })?;

    Ok(JobRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        payload,
        priority: row.get(3)?,
        status,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        run_at: row.get(7)?,
        last_error: row.get(8)?,
        created_at: row.get(9)?,
        finished_at: row.get(10)?,
    })
}
