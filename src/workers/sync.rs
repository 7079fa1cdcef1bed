//! Sync worker: runs queued drive sync jobs.
//!
//! One run lists the folder, inserts new photos in batches, refreshes the
//! location of known ones and trashes photos no longer present. A batch that
//! fails to insert is retried one photo at a time; photos that still fail are
//! counted in `failed_items` and do not fail the job.

use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{is_image_mime_type, DriveFile, DriveSource};
use crate::config::SyncConfig;
use crate::db::{
    ActivityType, Database, JobStatus, JobType, NewPhoto, SharedFolder, SyncJob, SyncStatus,
};
use crate::error::{Error, Result};

/// Counters of one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub total: usize,
    pub processed: usize,
    pub new_photos: usize,
    pub updated: usize,
    pub trashed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

pub struct SyncWorker {
    db: Arc<Database>,
    drive: Arc<dyn DriveSource>,
    config: SyncConfig,
}

impl SyncWorker {
    pub fn new(db: Arc<Database>, drive: Arc<dyn DriveSource>, config: SyncConfig) -> Self {
        Self { db, drive, config }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        info!(batch_size = self.config.batch_size, "Sync worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let worker = self.clone();
            let token = cancel.clone();
            match tokio::task::spawn_blocking(move || worker.run_pending(&token)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Sync poll failed: {}", e),
                Err(e) => error!("Sync worker task panicked: {}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Sync worker stopped");
    }

    /// Run the oldest pending drive sync jobs. Returns how many were run.
    pub fn run_pending(&self, cancel: &CancellationToken) -> Result<usize> {
        let jobs = self
            .db
            .get_pending_sync_jobs(JobType::DriveSync, self.config.jobs_per_poll)?;
        let mut ran = 0;
        for job in jobs {
            if cancel.is_cancelled() {
                break;
            }
            if self.run_job(&job, cancel)?.is_some() {
                ran += 1;
            }
        }
        Ok(ran)
    }

    /// Drive one job to a terminal state. Returns `None` when the job was
    /// already taken or finished by someone else.
    pub fn run_job(&self, job: &SyncJob, cancel: &CancellationToken) -> Result<Option<SyncOutcome>> {
        let job = match self.db.update_sync_status(job.id, JobStatus::Running, None) {
            Ok(job) => job,
            Err(e) if e.is_conflict() => {
                debug!(job_id = job.id, "Sync job no longer pending: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let folder = match self.db.get_shared_folder(job.folder_id) {
            Ok(folder) => folder,
            Err(e) => {
                self.fail_job(&job, &e.to_string());
                return Err(e);
            }
        };

        let started = Instant::now();
        info!(job_id = job.id, folder_id = folder.id, folder = %folder.name, "Sync started");
        self.db
            .update_folder_sync_status(folder.id, SyncStatus::Syncing, None)?;
        self.log(folder.id, ActivityType::SyncStarted, json!({ "job_id": job.id }));

        match self.ingest(&job, &folder, cancel) {
            Ok(outcome) if outcome.cancelled => {
                if !self.finish(job.id, JobStatus::Cancelled)? {
                    return Ok(None);
                }
                self.db
                    .update_folder_sync_status(folder.id, SyncStatus::Idle, None)?;
                info!(job_id = job.id, processed = outcome.processed, "Sync cancelled");
                Ok(Some(outcome))
            }
            Ok(outcome) => {
                if !self.finish(job.id, JobStatus::Completed)? {
                    return Ok(None);
                }
                self.db
                    .update_folder_sync_status(folder.id, SyncStatus::Idle, None)?;
                self.log(
                    folder.id,
                    ActivityType::SyncCompleted,
                    json!({
                        "job_id": job.id,
                        "total": outcome.total,
                        "new": outcome.new_photos,
                        "updated": outcome.updated,
                        "trashed": outcome.trashed,
                        "failed": outcome.failed,
                        "duration_ms": started.elapsed().as_millis() as u64,
                    }),
                );
                info!(
                    job_id = job.id,
                    total = outcome.total,
                    new = outcome.new_photos,
                    updated = outcome.updated,
                    trashed = outcome.trashed,
                    failed = outcome.failed,
                    "Sync completed"
                );
                Ok(Some(outcome))
            }
            Err(e) if e.is_recoverable_stuck() => {
                debug!(job_id = job.id, "Abandoning sync run: {}", e);
                Ok(None)
            }
            Err(e) => {
                self.fail_job(&job, &e.to_string());
                Err(e)
            }
        }
    }

    fn ingest(&self, job: &SyncJob, folder: &SharedFolder, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let files: Vec<DriveFile> = self
            .drive
            .list_images(folder)
            .map_err(|e| Error::upstream("failed to list files", e))?
            .into_iter()
            .filter(|f| is_image_mime_type(&f.mime_type))
            .collect();

        let mut outcome = SyncOutcome {
            total: files.len(),
            ..Default::default()
        };
        self.db
            .set_sync_total(job.id, files.len() as i64)
            .map_err(|e| no_longer_active(job.id, e))?;

        let batch_size = self.config.batch_size.max(1);
        let mut present = HashSet::with_capacity(files.len());
        let mut batch: Vec<NewPhoto> = Vec::with_capacity(batch_size);

        for file in &files {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            present.insert(file.id.clone());

            match self.db.get_photo_by_drive_file_id(folder.id, &file.id) {
                Ok(Some(existing)) => {
                    match self
                        .db
                        .update_photo_location(existing.id, &file.name, &file.folder_path)
                    {
                        Ok(true) => outcome.updated += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(drive_file_id = %file.id, "Failed to update photo: {}", e);
                            outcome.failed += 1;
                        }
                    }
                }
                Ok(None) => batch.push(NewPhoto {
                    drive_file_id: file.id.clone(),
                    file_name: file.name.clone(),
                    mime_type: file.mime_type.clone(),
                    drive_folder_path: file.folder_path.clone(),
                }),
                Err(e) => {
                    warn!(drive_file_id = %file.id, "Failed to look up photo: {}", e);
                    outcome.failed += 1;
                }
            }
            outcome.processed += 1;

            if batch.len() >= batch_size {
                self.flush(folder.id, &mut batch, &mut outcome);
                self.report_progress(job.id, &outcome)?;
            }
        }

        self.flush(folder.id, &mut batch, &mut outcome);
        self.report_progress(job.id, &outcome)?;

        // A partial listing must not trash what was not reached.
        if !outcome.cancelled {
            match self.db.trash_missing_photos(folder.id, &present) {
                Ok(trashed) => {
                    outcome.trashed = trashed;
                    if trashed > 0 {
                        self.log(folder.id, ActivityType::PhotosTrashed, json!({ "count": trashed }));
                    }
                }
                Err(e) => warn!(folder_id = folder.id, "Failed to clean up missing photos: {}", e),
            }
        }
        Ok(outcome)
    }

    fn flush(&self, folder_id: i64, batch: &mut Vec<NewPhoto>, outcome: &mut SyncOutcome) {
        if batch.is_empty() {
            return;
        }
        let inserted = match self.db.insert_photos(folder_id, batch) {
            Ok(inserted) => inserted,
            Err(e) => {
                warn!(
                    folder_id,
                    count = batch.len(),
                    "Photo batch insert failed, retrying one by one: {}",
                    e
                );
                let mut inserted = 0;
                for photo in batch.iter() {
                    match self.db.insert_photos(folder_id, std::slice::from_ref(photo)) {
                        Ok(n) => inserted += n,
                        Err(e) => {
                            warn!(
                                folder_id,
                                drive_file_id = %photo.drive_file_id,
                                "Failed to insert photo: {}",
                                e
                            );
                            outcome.failed += 1;
                        }
                    }
                }
                inserted
            }
        };
        batch.clear();
        outcome.new_photos += inserted;
        if inserted > 0 {
            debug!(folder_id, inserted, "Photo batch inserted");
            self.log(folder_id, ActivityType::PhotosAdded, json!({ "count": inserted }));
        }
    }

    fn report_progress(&self, job_id: i64, outcome: &SyncOutcome) -> Result<()> {
        self.db
            .update_sync_progress(job_id, outcome.processed as i64, outcome.failed as i64)
            .map_err(|e| no_longer_active(job_id, e))
    }

    /// Move the job to a terminal status. `false` when it already ended
    /// elsewhere, for instance failed by the stuck-job reaper.
    fn finish(&self, job_id: i64, status: JobStatus) -> Result<bool> {
        match self.db.update_sync_status(job_id, status, None) {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => {
                debug!(job_id, "Sync job already finished: {}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn fail_job(&self, job: &SyncJob, message: &str) {
        error!(job_id = job.id, folder_id = job.folder_id, "Sync failed: {}", message);
        if let Err(e) = self
            .db
            .update_sync_status(job.id, JobStatus::Failed, Some(message))
        {
            warn!(job_id = job.id, "Failed to mark sync job failed: {}", e);
        }
        if let Err(e) = self
            .db
            .update_folder_sync_status(job.folder_id, SyncStatus::Error, Some(message))
        {
            warn!(folder_id = job.folder_id, "Failed to flag folder: {}", e);
        }
        self.log(job.folder_id, ActivityType::SyncFailed, json!({ "job_id": job.id, "error": message }));
    }

    fn log(&self, folder_id: i64, activity_type: ActivityType, payload: serde_json::Value) {
        if let Err(e) = self.db.log_activity(folder_id, activity_type, &payload) {
            warn!(folder_id, "Failed to record activity: {}", e);
        }
    }
}

fn no_longer_active(job_id: i64, e: Error) -> Error {
    if e.is_conflict() {
        Error::RecoverableStuck(format!("sync job {} is no longer active", job_id))
    } else {
        e
    }
}
