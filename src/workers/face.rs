//! Face worker: claims pending photos and runs them through the detector.

use anyhow::Context;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{is_retryable_error, sleep_unless_cancelled, CircuitBreaker, DetectedFace, DriveSource, FaceDetector};
use crate::config::FaceConfig;
use crate::db::{Database, NewFace, Photo};
use crate::error::{Error, Result};

/// Tally of one claimed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaceBatchOutcome {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Handed back to `pending` because of cancellation.
    pub released: usize,
    /// Results dropped because the photo left `processing` meanwhile.
    pub abandoned: usize,
    pub faces: usize,
    /// Nothing was claimed because the breaker is open or the detector is down.
    pub skipped: bool,
}

enum PhotoOutcome {
    Completed(usize),
    Failed,
    Released,
    Abandoned,
}

pub struct FaceWorker {
    db: Arc<Database>,
    drive: Arc<dyn DriveSource>,
    detector: Arc<dyn FaceDetector>,
    config: FaceConfig,
    breaker: CircuitBreaker,
    pool: rayon::ThreadPool,
}

impl FaceWorker {
    pub fn new(
        db: Arc<Database>,
        drive: Arc<dyn DriveSource>,
        detector: Arc<dyn FaceDetector>,
        config: FaceConfig,
    ) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.concurrency.max(1))
            .thread_name(|i| format!("face-worker-{}", i))
            .build()
            .context("failed to build face worker pool")?;
        let breaker = CircuitBreaker::new(
            config.breaker_threshold,
            Duration::from_secs(config.breaker_reset_secs),
        );
        Ok(Self {
            db,
            drive,
            detector,
            config,
            breaker,
            pool,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Poll for pending photos until `cancel` fires. A full batch is followed
    /// immediately by the next one; an empty one waits for the poll interval.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        info!(
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "Face worker started"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let worker = self.clone();
            let token = cancel.clone();
            let busy = match tokio::task::spawn_blocking(move || worker.process_batch(&token)).await {
                Ok(Ok(outcome)) => outcome.claimed > 0,
                Ok(Err(e)) => {
                    error!("Face batch failed: {}", e);
                    false
                }
                Err(e) => {
                    error!("Face worker task panicked: {}", e);
                    false
                }
            };
            if busy {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Face worker stopped");
    }

    /// Claim one batch and process it on the worker pool. Blocking.
    pub fn process_batch(&self, cancel: &CancellationToken) -> Result<FaceBatchOutcome> {
        let mut outcome = FaceBatchOutcome::default();
        if self.breaker.is_open() {
            warn!(
                failures = self.breaker.failures(),
                "Circuit breaker open, skipping face processing"
            );
            outcome.skipped = true;
            return Ok(outcome);
        }
        if !self.detector.is_available() {
            self.breaker.record_failure();
            warn!("Face detector not available");
            outcome.skipped = true;
            return Ok(outcome);
        }

        let photos = self.db.claim_pending_photos(self.config.batch_size, None)?;
        if photos.is_empty() {
            return Ok(outcome);
        }
        outcome.claimed = photos.len();
        debug!(count = photos.len(), "Claimed photos for face detection");

        let results: Vec<PhotoOutcome> = self.pool.install(|| {
            photos
                .par_iter()
                .map(|photo| self.process_claimed(photo, cancel))
                .collect()
        });
        for result in results {
            match result {
                PhotoOutcome::Completed(faces) => {
                    outcome.completed += 1;
                    outcome.faces += faces;
                }
                PhotoOutcome::Failed => outcome.failed += 1,
                PhotoOutcome::Released => outcome.released += 1,
                PhotoOutcome::Abandoned => outcome.abandoned += 1,
            }
        }
        info!(
            completed = outcome.completed,
            failed = outcome.failed,
            released = outcome.released,
            abandoned = outcome.abandoned,
            faces = outcome.faces,
            "Face batch complete"
        );
        Ok(outcome)
    }

    fn process_claimed(&self, photo: &Photo, cancel: &CancellationToken) -> PhotoOutcome {
        let mut last_error: Option<anyhow::Error> = None;
        for attempt in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                return self.release(photo);
            }
            if attempt > 0 {
                let delay = self.retry_delay(attempt);
                debug!(photo_id = photo.id, attempt, ?delay, "Retrying face detection");
                if !sleep_unless_cancelled(cancel, delay) {
                    return self.release(photo);
                }
            }

            match self.detect(photo) {
                Ok(faces) => return self.store(photo, faces),
                Err(e) => {
                    warn!(
                        photo_id = photo.id,
                        attempt = attempt + 1,
                        "Face detection failed: {:#}",
                        e
                    );
                    let retryable = is_retryable_error(&e);
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        self.breaker.record_failure();
        let reason = last_error
            .map(|e| format!("{:#}", e))
            .unwrap_or_else(|| "face detection failed".to_string());
        self.fail(photo, &reason)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
        Duration::from_millis(self.config.retry_base_delay_ms.saturating_mul(factor))
    }

    fn detect(&self, photo: &Photo) -> anyhow::Result<Vec<DetectedFace>> {
        let folder = self
            .db
            .get_shared_folder(photo.shared_folder_id)
            .context("failed to load shared folder")?;
        let image = self
            .drive
            .download(&folder, &photo.drive_file_id)
            .context("failed to download image")?;
        self.detector
            .detect(&image, &photo.mime_type)
            .context("face extraction failed")
    }

    fn store(&self, photo: &Photo, faces: Vec<DetectedFace>) -> PhotoOutcome {
        let faces: Vec<NewFace> = faces
            .into_iter()
            .map(|face| NewFace {
                bbox: face.bbox,
                confidence: face.confidence,
                embedding: face.embedding,
            })
            .collect();
        match self.db.complete_face_processing(photo.id, &faces) {
            Ok(count) => {
                self.breaker.record_success();
                debug!(photo_id = photo.id, faces = count, "Photo processed");
                PhotoOutcome::Completed(count)
            }
            Err(e) if e.is_recoverable_stuck() => {
                debug!(photo_id = photo.id, "Dropping detection result: {}", e);
                PhotoOutcome::Abandoned
            }
            Err(e @ Error::InvalidArgument { .. }) => self.fail(photo, &e.to_string()),
            Err(e) => {
                error!(photo_id = photo.id, "Failed to store faces: {}", e);
                PhotoOutcome::Abandoned
            }
        }
    }

    fn fail(&self, photo: &Photo, reason: &str) -> PhotoOutcome {
        match self.db.fail_face_processing(photo.id, reason) {
            Ok(()) => PhotoOutcome::Failed,
            Err(e) if e.is_recoverable_stuck() => {
                debug!(photo_id = photo.id, "Not marking photo failed: {}", e);
                PhotoOutcome::Abandoned
            }
            Err(e) => {
                error!(photo_id = photo.id, "Failed to mark photo failed: {}", e);
                PhotoOutcome::Abandoned
            }
        }
    }

    fn release(&self, photo: &Photo) -> PhotoOutcome {
        if let Err(e) = self.db.release_photo_claim(photo.id) {
            error!(photo_id = photo.id, "Failed to release photo: {}", e);
        }
        PhotoOutcome::Released
    }
}
