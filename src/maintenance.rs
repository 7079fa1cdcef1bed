//! Periodic store upkeep: reclaim stuck photos, fail stale sync jobs and
//! prune old activity entries.

use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::MaintenanceConfig;
use crate::db::{ActivityType, Database};
use crate::error::Result;
use crate::schedule::{job_task, validate_cron_expression, Scheduler};

pub const RESET_STUCK_PHOTOS: &str = "reset-stuck-photos";
pub const FAIL_STUCK_SYNC_JOBS: &str = "fail-stuck-sync-jobs";
pub const PRUNE_ACTIVITY: &str = "prune-activity";

/// Photos left `processing` longer than the threshold go back to `pending`.
pub fn reset_stuck_photos(db: &Database, threshold_minutes: i64) -> Result<usize> {
    let reset = db.reset_stuck_processing_to_pending(threshold_minutes)?;
    if reset > 0 {
        warn!(reset, threshold_minutes, "Reset stuck photos to pending");
    }
    Ok(reset)
}

/// Fail sync jobs with no progress for longer than the threshold and record
/// a failure entry for each affected folder.
pub fn fail_stuck_sync_jobs(db: &Database, threshold_minutes: i64) -> Result<usize> {
    let failed = db.fail_stuck_sync_jobs(threshold_minutes)?;
    for job in &failed {
        warn!(job_id = job.id, folder_id = job.folder_id, "Sync job timed out");
        let payload = json!({
            "job_id": job.id,
            "error": job.last_error,
            "processed": job.processed_items,
            "failed": job.failed_items,
        });
        if let Err(e) = db.log_activity(job.folder_id, ActivityType::SyncFailed, &payload) {
            warn!(folder_id = job.folder_id, "Failed to record activity: {}", e);
        }
    }
    Ok(failed.len())
}

pub fn prune_activity(db: &Database, retention_days: i64) -> Result<usize> {
    let removed = db.prune_activity_older_than(retention_days)?;
    if removed > 0 {
        info!(removed, retention_days, "Pruned activity log");
    }
    Ok(removed)
}

/// Run every upkeep step once, in order.
pub fn run_all(db: &Database, config: &MaintenanceConfig) -> Result<()> {
    reset_stuck_photos(db, config.stuck_photo_minutes)?;
    fail_stuck_sync_jobs(db, config.stuck_sync_minutes)?;
    prune_activity(db, config.activity_retention_days)?;
    Ok(())
}

/// Register the upkeep jobs on `scheduler`. Nothing is registered when any
/// expression is invalid.
pub fn register(
    scheduler: &Scheduler,
    db: Arc<Database>,
    config: &MaintenanceConfig,
) -> Result<()> {
    validate_cron_expression(&config.stuck_photo_cron)?;
    validate_cron_expression(&config.stuck_sync_cron)?;
    validate_cron_expression(&config.activity_prune_cron)?;

    let jobs: [(&str, &str, fn(&Database, i64) -> Result<usize>, i64); 3] = [
        (
            RESET_STUCK_PHOTOS,
            config.stuck_photo_cron.as_str(),
            reset_stuck_photos,
            config.stuck_photo_minutes,
        ),
        (
            FAIL_STUCK_SYNC_JOBS,
            config.stuck_sync_cron.as_str(),
            fail_stuck_sync_jobs,
            config.stuck_sync_minutes,
        ),
        (
            PRUNE_ACTIVITY,
            config.activity_prune_cron.as_str(),
            prune_activity,
            config.activity_retention_days,
        ),
    ];

    for (id, cron_expr, step, arg) in jobs {
        let db = db.clone();
        scheduler.add_job(
            id,
            cron_expr,
            job_task(move || {
                let db = db.clone();
                async move {
                    tokio::task::spawn_blocking(move || step(&db, arg)).await??;
                    Ok(())
                }
            }),
        )?;
    }
    info!("Registered maintenance jobs");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::*;
    use crate::db::{FaceStatus, JobStatus, JobType, SyncStatus};
    use std::time::Duration;

    fn config() -> MaintenanceConfig {
        MaintenanceConfig {
            stuck_photo_minutes: 5,
            stuck_sync_minutes: 30,
            activity_retention_days: 7,
            ..MaintenanceConfig::default()
        }
    }

    fn age_job(db: &Database, job_id: i64, minutes: i64) {
        let at = chrono::Utc::now() - chrono::Duration::minutes(minutes);
        db.conn()
            .execute(
                "UPDATE sync_jobs SET updated_at = ? WHERE id = ?",
                rusqlite::params![at, job_id],
            )
            .unwrap();
    }

    #[test]
    fn test_run_all_reclaims_stuck_work() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["old", "fresh"]);
        force_status(&db, ids[0], FaceStatus::Processing);
        force_status(&db, ids[1], FaceStatus::Processing);
        age_photo(&db, ids[0], 10);

        let stale = db.create_sync_job(ann, f, JobType::DriveSync).unwrap();
        db.update_sync_status(stale.id, JobStatus::Running, None).unwrap();
        db.update_folder_sync_status(f, SyncStatus::Syncing, None).unwrap();
        age_job(&db, stale.id, 45);

        run_all(&db, &config()).unwrap();

        assert_eq!(db.get_photo(ids[0]).unwrap().face_status, FaceStatus::Pending);
        assert_eq!(db.get_photo(ids[1]).unwrap().face_status, FaceStatus::Processing);
        let job = db.get_sync_job(stale.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(db.get_shared_folder(f).unwrap().sync_status, SyncStatus::Error);
        let logged = db.list_activity(f, Some(ActivityType::SyncFailed), 10).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].payload["job_id"], stale.id);

        // A second pass finds nothing left to do.
        assert_eq!(reset_stuck_photos(&db, 5).unwrap(), 0);
        assert_eq!(fail_stuck_sync_jobs(&db, 30).unwrap(), 0);
        assert_eq!(db.list_activity(f, None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_register_adds_jobs() {
        let db = Arc::new(test_db());
        let scheduler = Scheduler::new();
        register(&scheduler, db, &config()).unwrap();

        let ids: Vec<String> = scheduler.list_jobs().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![FAIL_STUCK_SYNC_JOBS, PRUNE_ACTIVITY, RESET_STUCK_PHOTOS]);
        let info = scheduler.get_job(RESET_STUCK_PHOTOS).unwrap();
        assert_eq!(info.cron_expr, config().stuck_photo_cron);
    }

    #[test]
    fn test_register_rejects_bad_expression() {
        let db = Arc::new(test_db());
        let scheduler = Scheduler::new();
        let bad = MaintenanceConfig {
            activity_prune_cron: "every day".to_string(),
            ..config()
        };
        assert!(register(&scheduler, db, &bad).is_err());
        assert!(scheduler.list_jobs().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scheduled_reset_runs() {
        let db = Arc::new(test_db());
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["old"]);
        force_status(&db, ids[0], FaceStatus::Processing);
        age_photo(&db, ids[0], 10);

        let scheduler = Scheduler::new();
        let every_second = MaintenanceConfig {
            stuck_photo_cron: "* * * * * *".to_string(),
            ..config()
        };
        register(&scheduler, db.clone(), &every_second).unwrap();
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(scheduler.shutdown(Duration::from_secs(5)).await);

        assert_eq!(db.get_photo(ids[0]).unwrap().face_status, FaceStatus::Pending);
        assert!(scheduler.get_job(RESET_STUCK_PHOTOS).unwrap().last_run.is_some());
    }
}
