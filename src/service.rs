//! Caller-facing operations. Every operation resolves the caller's folder set
//! before touching photos or faces.

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{
    ActivityType, Database, FaceMatch, FaceProcessingStats, JobType, Photo, Scope,
    SimilarityQuery, SyncJob,
};
use crate::error::{Error, Result};

/// Webhook resource states that mean the folder content may have changed.
const SYNC_STATES: [&str; 3] = ["sync", "change", "update"];

pub struct PhotoService {
    db: Arc<Database>,
}

impl PhotoService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Queue a sync of `folder_id` on behalf of `user_id`.
    pub fn trigger_sync(&self, user_id: i64, folder_id: i64) -> Result<SyncJob> {
        if !self.db.has_access(user_id, folder_id)? {
            return Err(Error::Unauthorized(format!("no access to folder {}", folder_id)));
        }
        let job = self
            .db
            .create_sync_job(user_id, folder_id, JobType::DriveSync)?;
        info!(job_id = job.id, folder_id, user_id, "Sync job created");
        Ok(job)
    }

    /// Handle a drive change notification. Returns the queued job, or `None`
    /// when the state is not a content change or a sync is already queued.
    pub fn handle_webhook(&self, token: &str, resource_state: &str) -> Result<Option<SyncJob>> {
        let folder = self
            .db
            .get_folder_by_webhook_token(token)?
            .ok_or_else(|| Error::not_found("webhook token", "<redacted>"))?;

        if !SYNC_STATES.contains(&resource_state) {
            debug!(folder_id = folder.id, resource_state, "Ignoring webhook");
            return Ok(None);
        }

        match self
            .db
            .create_sync_job(folder.owner_id, folder.id, JobType::DriveSync)
        {
            Ok(job) => {
                info!(job_id = job.id, folder_id = folder.id, resource_state, "Webhook sync job created");
                Ok(Some(job))
            }
            Err(e) if e.is_conflict() => {
                debug!(folder_id = folder.id, "Sync already queued for folder");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Send failed photos back to `pending`, in one folder or in every
    /// folder the user can read. Returns the number reset.
    pub fn retry_failed_photos(&self, user_id: i64, folder_id: Option<i64>) -> Result<usize> {
        let accessible = self.db.accessible_folders(user_id)?;
        let folders = match folder_id {
            Some(folder_id) if !accessible.contains(&folder_id) => {
                return Err(Error::Unauthorized(format!("no access to folder {}", folder_id)));
            }
            Some(folder_id) => vec![folder_id],
            None => accessible,
        };

        let mut total = 0;
        for folder in folders {
            let count = self.db.retry_failed_photos(&[folder])?;
            if count > 0 {
                if let Err(e) = self.db.log_activity(
                    folder,
                    ActivityType::FacesRetried,
                    &json!({ "count": count, "user_id": user_id }),
                ) {
                    warn!(folder_id = folder, "Failed to record activity: {}", e);
                }
            }
            total += count;
        }
        info!(user_id, reset = total, "Failed photos reset to pending");
        Ok(total)
    }

    /// Faces similar to `embedding` within the user's folders, optionally
    /// restricted to a drive path prefix.
    pub fn search_by_embedding(
        &self,
        user_id: i64,
        embedding: Vec<f32>,
        limit: i64,
        threshold: f32,
        path_prefix: Option<&str>,
    ) -> Result<Vec<FaceMatch>> {
        let folders = self.db.accessible_folders(user_id)?;
        let scope = match path_prefix {
            Some(prefix) => Scope::PathPrefix {
                folders,
                prefix: prefix.to_string(),
            },
            None => Scope::Folders(folders),
        };
        self.db.search_similar_faces(&SimilarityQuery {
            scope,
            embedding,
            limit,
            threshold,
            exclude_face_id: None,
        })
    }

    /// Faces similar to an existing face, excluding that face. A face in a
    /// folder the user cannot read is reported as not found.
    pub fn search_by_face(
        &self,
        user_id: i64,
        face_id: i64,
        limit: i64,
        threshold: f32,
    ) -> Result<Vec<FaceMatch>> {
        let face = self.db.get_face(face_id)?;
        let photo = self.db.get_photo(face.photo_id)?;
        if !self.db.has_access(user_id, photo.shared_folder_id)? {
            return Err(Error::not_found("face", face_id));
        }
        self.db.search_similar_faces(&SimilarityQuery {
            scope: Scope::Folders(self.db.accessible_folders(user_id)?),
            embedding: face.embedding,
            limit,
            threshold,
            exclude_face_id: Some(face_id),
        })
    }

    pub fn processing_stats(&self, user_id: i64) -> Result<FaceProcessingStats> {
        let folders = self.db.accessible_folders(user_id)?;
        self.db.face_processing_stats(&folders)
    }

    pub fn list_photos(
        &self,
        user_id: i64,
        path_prefix: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Photo>> {
        let folders = self.db.accessible_folders(user_id)?;
        let scope = match path_prefix {
            Some(prefix) => Scope::PathPrefix {
                folders,
                prefix: prefix.to_string(),
            },
            None => Scope::Folders(folders),
        };
        self.db.list_photos(&scope, limit, offset)
    }

    pub fn latest_sync_job(&self, user_id: i64) -> Result<Option<SyncJob>> {
        self.db.get_latest_sync_job(user_id, JobType::DriveSync)
    }
}
