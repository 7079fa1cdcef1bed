//! Sync job orchestration.
//!
//! A job moves `pending -> running -> completed | failed`, and may be
//! cancelled before it finishes. Terminal states are final. At most one job
//! per folder is `pending` or `running` at any time.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::{now, parse_column, Database};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    DriveSync,
    FaceProcess,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::DriveSync => "drive_sync",
            JobType::FaceProcess => "face_process",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "drive_sync" => Some(JobType::DriveSync),
            "face_process" => Some(JobType::FaceProcess),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (
                JobStatus::Pending,
                JobStatus::Running | JobStatus::Failed | JobStatus::Cancelled
            ) | (
                JobStatus::Running,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
            )
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncJob {
    pub id: i64,
    pub user_id: i64,
    pub folder_id: i64,
    pub job_type: JobType,
    pub status: JobStatus,
    pub total_items: i64,
    pub processed_items: i64,
    pub failed_items: i64,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = r#"
    id, user_id, folder_id, job_type, status, total_items, processed_items, failed_items,
    last_error, started_at, completed_at, created_at, updated_at
"#;

pub(crate) const STUCK_JOB_ERROR: &str = "job timed out";

impl Database {
    /// Queue a job for a folder. Fails with [`Error::Conflict`] while another
    /// job for the same folder is pending or running.
    pub fn create_sync_job(&self, user_id: i64, folder_id: i64, job_type: JobType) -> Result<SyncJob> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let active: Option<i64> = tx
            .query_row(
                "SELECT id FROM sync_jobs WHERE folder_id = ? AND status IN ('pending', 'running') LIMIT 1",
                [folder_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(active) = active {
            return Err(Error::Conflict(format!(
                "folder {} already has active sync job {}",
                folder_id, active
            )));
        }

        let ts = now();
        let job = tx.query_row(
            &format!(
                r#"
                INSERT INTO sync_jobs (user_id, folder_id, job_type, status, created_at, updated_at)
                VALUES (?, ?, ?, 'pending', ?, ?)
                RETURNING {JOB_COLUMNS}
                "#
            ),
            params![user_id, folder_id, job_type.as_str(), ts, ts],
            row_to_job,
        )?;
        tx.commit()?;
        Ok(job)
    }

    pub fn has_pending_or_running_job_for_folder(&self, folder_id: i64) -> Result<bool> {
        Ok(self.active_sync_job_for_folder(folder_id)?.is_some())
    }

    pub fn active_sync_job_for_folder(&self, folder_id: i64) -> Result<Option<SyncJob>> {
        let job = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE folder_id = ? AND status IN ('pending', 'running') ORDER BY id LIMIT 1"
                ),
                [folder_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn get_sync_job(&self, job_id: i64) -> Result<SyncJob> {
        self.conn()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = ?"),
                [job_id],
                row_to_job,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("sync job", job_id))
    }

    /// Record progress of an active job.
    ///
    /// Counters only move forward: each stored value becomes the larger of
    /// the stored and the reported one, so a late or reordered write cannot
    /// roll progress back. Fails once the job is finished.
    pub fn update_sync_progress(&self, job_id: i64, processed: i64, failed: i64) -> Result<()> {
        if processed < 0 || failed < 0 {
            return Err(Error::invalid("progress", "counters must not be negative"));
        }
        let changed = self.conn().execute(
            r#"
            UPDATE sync_jobs
            SET processed_items = MAX(processed_items, ?),
                failed_items = MAX(failed_items, ?),
                updated_at = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
            params![processed, failed, now(), job_id],
        )?;
        if changed == 0 {
            let job = self.get_sync_job(job_id)?;
            return Err(Error::Conflict(format!(
                "sync job {} is {}",
                job_id,
                job.status.as_str()
            )));
        }
        Ok(())
    }

    /// Record how many items the run will visit. Fails with
    /// [`Error::Conflict`] once the job is finished.
    pub fn set_sync_total(&self, job_id: i64, total: i64) -> Result<()> {
        let changed = self.conn().execute(
            r#"
            UPDATE sync_jobs SET total_items = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
            params![total, now(), job_id],
        )?;
        if changed == 0 {
            let job = self.get_sync_job(job_id)?;
            return Err(Error::Conflict(format!(
                "sync job {} is {}",
                job_id,
                job.status.as_str()
            )));
        }
        Ok(())
    }

    /// Move a job to `status`. Illegal transitions, including any move out of
    /// a terminal state, fail with [`Error::Conflict`]. Progress counters are
    /// never reset here.
    pub fn update_sync_status(
        &self,
        job_id: i64,
        status: JobStatus,
        last_error: Option<&str>,
    ) -> Result<SyncJob> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: String = tx
            .query_row("SELECT status FROM sync_jobs WHERE id = ?", [job_id], |row| row.get(0))
            .optional()?
            .ok_or_else(|| Error::not_found("sync job", job_id))?;
        let current = JobStatus::from_str(&current)
            .ok_or_else(|| Error::Conflict(format!("sync job {} has unknown status {}", job_id, current)))?;
        if !current.can_transition_to(status) {
            return Err(Error::Conflict(format!(
                "sync job {} cannot move from {} to {}",
                job_id,
                current.as_str(),
                status.as_str()
            )));
        }

        let ts = now();
        let started_at = (status == JobStatus::Running).then_some(ts);
        let completed_at = status.is_terminal().then_some(ts);
        let job = tx.query_row(
            &format!(
                r#"
                UPDATE sync_jobs
                SET status = ?,
                    last_error = COALESCE(?, last_error),
                    started_at = COALESCE(?, started_at),
                    completed_at = COALESCE(?, completed_at),
                    updated_at = ?
                WHERE id = ?
                RETURNING {JOB_COLUMNS}
                "#
            ),
            params![status.as_str(), last_error, started_at, completed_at, ts, job_id],
            row_to_job,
        )?;
        tx.commit()?;
        Ok(job)
    }

    /// Most recent job of a type for a user, for status polling.
    pub fn get_latest_sync_job(&self, user_id: i64, job_type: JobType) -> Result<Option<SyncJob>> {
        let job = self
            .conn()
            .query_row(
                &format!(
                    r#"
                    SELECT {JOB_COLUMNS} FROM sync_jobs
                    WHERE user_id = ? AND job_type = ?
                    ORDER BY created_at DESC, id DESC
                    LIMIT 1
                    "#
                ),
                params![user_id, job_type.as_str()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Queued jobs of a type, oldest first.
    pub fn get_pending_sync_jobs(&self, job_type: JobType, limit: usize) -> Result<Vec<SyncJob>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM sync_jobs
            WHERE job_type = ? AND status = 'pending'
            ORDER BY created_at, id
            LIMIT ?
            "#
        ))?;
        let jobs = stmt
            .query_map(params![job_type.as_str(), limit as i64], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Fail active jobs that have not been updated for `threshold_minutes`.
    /// Their folders are flagged with the same error. Running it again
    /// changes nothing.
    pub fn fail_stuck_sync_jobs(&self, threshold_minutes: i64) -> Result<Vec<SyncJob>> {
        if threshold_minutes < 0 {
            return Err(Error::invalid("threshold_minutes", "must not be negative"));
        }
        let ts = now();
        let cutoff = ts - Duration::minutes(threshold_minutes);

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let failed = {
            let mut stmt = tx.prepare(&format!(
                r#"
                UPDATE sync_jobs
                SET status = 'failed', last_error = ?, completed_at = ?, updated_at = ?
                WHERE status IN ('pending', 'running') AND updated_at < ?
                RETURNING {JOB_COLUMNS}
                "#
            ))?;
            let jobs = stmt
                .query_map(params![STUCK_JOB_ERROR, ts, ts, cutoff], row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            jobs
        };
        for job in &failed {
            tx.execute(
                r#"
                UPDATE shared_folders SET sync_status = 'error', last_error = ?, updated_at = ?
                WHERE id = ? AND sync_status = 'syncing'
                "#,
                params![STUCK_JOB_ERROR, ts, job.folder_id],
            )?;
        }
        tx.commit()?;
        Ok(failed)
    }
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<SyncJob> {
    let job_type: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(SyncJob {
        id: row.get(0)?,
        user_id: row.get(1)?,
        folder_id: row.get(2)?,
        job_type: parse_column(3, &job_type, JobType::from_str)?,
        status: parse_column(4, &status, JobStatus::from_str)?,
        total_items: row.get(5)?,
        processed_items: row.get(6)?,
        failed_items: row.get(7)?,
        last_error: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}
