//! Photos and the per-photo face processing state machine.
//!
//! ```text
//! pending -> processing -> completed
//!                       -> failed -> pending      (retry)
//! processing -> pending                          (stuck reset)
//! completed  -> pending                          (explicit reprocess)
//! ```
//!
//! Ownership of a `processing` photo is implicit in its status. Claims are a
//! single conditional update, and every worker write re-checks that the photo
//! is still `processing`, so a reset by the reaper makes a slow worker's
//! result bounce instead of overwriting newer state.

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, ToSql};
use std::collections::HashSet;

use super::faces::{delete_faces_of_photo, insert_face, NewFace};
use super::{id_values, now, parse_column, placeholders, Database, Scope};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaceStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl FaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaceStatus::Pending => "pending",
            FaceStatus::Processing => "processing",
            FaceStatus::Completed => "completed",
            FaceStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FaceStatus::Pending),
            "processing" => Some(FaceStatus::Processing),
            "completed" => Some(FaceStatus::Completed),
            "failed" => Some(FaceStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Photo {
    pub id: i64,
    pub shared_folder_id: i64,
    pub drive_file_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub drive_folder_path: String,
    pub face_status: FaceStatus,
    pub face_count: i64,
    pub face_error: Option<String>,
    pub is_trashed: bool,
    pub created_at: DateTime<Utc>,
    /// Time of the last face status transition.
    pub updated_at: DateTime<Utc>,
}

/// A drive file about to be ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPhoto {
    pub drive_file_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub drive_folder_path: String,
}

/// Per-status photo counts over a set of folders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaceProcessingStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total_faces: i64,
}

impl FaceProcessingStats {
    pub fn total_photos(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

const PHOTO_FIELDS: [&str; 12] = [
    "id",
    "shared_folder_id",
    "drive_file_id",
    "file_name",
    "mime_type",
    "drive_folder_path",
    "face_status",
    "face_count",
    "face_error",
    "is_trashed",
    "created_at",
    "updated_at",
];

/// Photo column list, optionally qualified with a table alias.
pub(crate) fn photo_columns(alias: Option<&str>) -> String {
    PHOTO_FIELDS
        .iter()
        .map(|field| match alias {
            Some(alias) => format!("{alias}.{field}"),
            None => field.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl Database {
    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Insert a batch of photos as `pending` in one transaction. Files already
    /// present in the folder are skipped; returns the number inserted.
    pub fn insert_photos(&self, folder_id: i64, photos: &[NewPhoto]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let ts = now();
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO photos
                    (shared_folder_id, drive_file_id, file_name, mime_type, drive_folder_path,
                     face_status, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)
                ON CONFLICT (shared_folder_id, drive_file_id) DO NOTHING
                "#,
            )?;
            for photo in photos {
                inserted += stmt.execute(params![
                    folder_id,
                    photo.drive_file_id,
                    photo.file_name,
                    photo.mime_type,
                    photo.drive_folder_path,
                    ts,
                    ts,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Refresh name and path of an existing photo. Returns whether anything
    /// changed. Does not count as a status transition.
    pub fn update_photo_location(
        &self,
        photo_id: i64,
        file_name: &str,
        drive_folder_path: &str,
    ) -> Result<bool> {
        let changed = self.conn().execute(
            r#"
            UPDATE photos SET file_name = ?1, drive_folder_path = ?2, is_trashed = 0
            WHERE id = ?3
              AND (file_name != ?1 OR drive_folder_path != ?2 OR is_trashed != 0)
            "#,
            params![file_name, drive_folder_path, photo_id],
        )?;
        Ok(changed > 0)
    }

    pub fn get_photo(&self, photo_id: i64) -> Result<Photo> {
        let result = self.conn().query_row(
            &format!("SELECT {} FROM photos WHERE id = ?", photo_columns(None)),
            [photo_id],
            row_to_photo,
        );
        match result {
            Ok(photo) => Ok(photo),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(Error::not_found("photo", photo_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_photo_by_drive_file_id(
        &self,
        folder_id: i64,
        drive_file_id: &str,
    ) -> Result<Option<Photo>> {
        let result = self.conn().query_row(
            &format!(
                "SELECT {} FROM photos WHERE shared_folder_id = ? AND drive_file_id = ?",
                photo_columns(None)
            ),
            params![folder_id, drive_file_id],
            row_to_photo,
        );
        match result {
            Ok(photo) => Ok(Some(photo)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Non-trashed photos in scope, newest first.
    pub fn list_photos(&self, scope: &Scope, limit: usize, offset: usize) -> Result<Vec<Photo>> {
        let Some((filter, values)) = scope.photo_filter("p") else {
            return Ok(Vec::new());
        };
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM photos p
            WHERE p.is_trashed = 0 AND {filter}
            ORDER BY p.created_at DESC, p.id DESC
            LIMIT ? OFFSET ?
            "#,
            photo_columns(Some("p"))
        ))?;
        let mut args = values;
        args.push(Value::Integer(limit as i64));
        args.push(Value::Integer(offset as i64));
        let photos = stmt
            .query_map(params_from_iter(args), row_to_photo)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }

    /// Soft delete. Trashed photos are never claimed or searched.
    pub fn trash_photo(&self, photo_id: i64) -> Result<()> {
        let changed = self
            .conn()
            .execute("UPDATE photos SET is_trashed = 1 WHERE id = ?", [photo_id])?;
        if changed == 0 {
            return Err(Error::not_found("photo", photo_id));
        }
        Ok(())
    }

    /// Trash every photo of the folder whose drive file is not in `present`.
    pub fn trash_missing_photos(&self, folder_id: i64, present: &HashSet<String>) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let missing: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id, drive_file_id FROM photos WHERE shared_folder_id = ? AND is_trashed = 0",
            )?;
            let rows = stmt
                .query_map([folder_id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .filter(|(_, drive_id)| !present.contains(drive_id))
                .map(|(id, _)| id)
                .collect()
        };
        for id in &missing {
            tx.execute("UPDATE photos SET is_trashed = 1 WHERE id = ?", [id])?;
        }
        tx.commit()?;
        Ok(missing.len())
    }

    // ========================================================================
    // Face processing transitions
    // ========================================================================

    /// Atomically move up to `limit` pending photos to `processing` and return
    /// them, oldest first. With `folders`, only photos in those folders are
    /// claimed; an empty folder list claims nothing.
    pub fn claim_pending_photos(&self, limit: usize, folders: Option<&[i64]>) -> Result<Vec<Photo>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut folder_filter = String::new();
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(now())];
        if let Some(folders) = folders {
            if folders.is_empty() {
                return Ok(Vec::new());
            }
            folder_filter = format!("AND p.shared_folder_id IN ({})", placeholders(folders.len()));
            args.extend(id_values(folders).into_iter().map(|v| Box::new(v) as Box<dyn ToSql>));
        }
        args.push(Box::new(limit as i64));

        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            r#"
            UPDATE photos
            SET face_status = 'processing', face_error = NULL, updated_at = ?
            WHERE face_status = 'pending'
              AND id IN (
                SELECT p.id FROM photos p
                WHERE p.face_status = 'pending' AND p.is_trashed = 0 {folder_filter}
                ORDER BY p.created_at, p.id
                LIMIT ?
              )
            RETURNING {}
            "#,
            photo_columns(None)
        ))?;
        let mut claimed = stmt
            .query_map(params_from_iter(args.iter()), row_to_photo)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(claimed)
    }

    /// `processing -> completed`: store the detected faces and set the face
    /// count in one transaction. Faces left over from an earlier run of the
    /// same photo are replaced.
    ///
    /// Fails with [`Error::RecoverableStuck`] when the photo is no longer
    /// `processing`; nothing is written in that case.
    pub fn complete_face_processing(&self, photo_id: i64, faces: &[NewFace]) -> Result<usize> {
        for face in faces {
            self.validate_embedding(&face.embedding)?;
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let ts = now();
        let changed = tx.execute(
            r#"
            UPDATE photos
            SET face_status = 'completed', face_count = ?, face_error = NULL, updated_at = ?
            WHERE id = ? AND face_status = 'processing'
            "#,
            params![faces.len() as i64, ts, photo_id],
        )?;
        if changed == 0 {
            return Err(not_processing(&tx, photo_id)?);
        }

        delete_faces_of_photo(&tx, photo_id)?;
        for face in faces {
            insert_face(&tx, photo_id, face, ts)?;
        }
        tx.commit()?;
        Ok(faces.len())
    }

    /// `processing -> failed` with the reason recorded on the photo.
    pub fn fail_face_processing(&self, photo_id: i64, reason: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            r#"
            UPDATE photos SET face_status = 'failed', face_error = ?, updated_at = ?
            WHERE id = ? AND face_status = 'processing'
            "#,
            params![reason, now(), photo_id],
        )?;
        if changed == 0 {
            return Err(not_processing(&tx, photo_id)?);
        }
        tx.commit()?;
        Ok(())
    }

    /// Hand a claimed photo back (`processing -> pending`) without a result.
    /// Returns false when the photo had already left `processing`.
    pub fn release_photo_claim(&self, photo_id: i64) -> Result<bool> {
        let changed = self.conn().execute(
            r#"
            UPDATE photos SET face_status = 'pending', updated_at = ?
            WHERE id = ? AND face_status = 'processing'
            "#,
            params![now(), photo_id],
        )?;
        Ok(changed > 0)
    }

    /// `failed -> pending` for the given folders. Completed, pending and
    /// processing photos are untouched.
    pub fn retry_failed_photos(&self, folders: &[i64]) -> Result<usize> {
        if folders.is_empty() {
            return Ok(0);
        }
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(now())];
        args.extend(id_values(folders).into_iter().map(|v| Box::new(v) as Box<dyn ToSql>));
        let changed = self.conn().execute(
            &format!(
                r#"
                UPDATE photos SET face_status = 'pending', face_error = NULL, updated_at = ?
                WHERE face_status = 'failed' AND shared_folder_id IN ({})
                "#,
                placeholders(folders.len())
            ),
            params_from_iter(args.iter()),
        )?;
        Ok(changed)
    }

    /// Send a finished photo back through detection.
    pub fn reprocess_photo(&self, photo_id: i64) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(
            r#"
            UPDATE photos SET face_status = 'pending', face_error = NULL, updated_at = ?
            WHERE id = ? AND face_status IN ('completed', 'failed')
            "#,
            params![now(), photo_id],
        )?;
        if changed == 0 {
            let status: Option<String> = match conn.query_row(
                "SELECT face_status FROM photos WHERE id = ?",
                [photo_id],
                |row| row.get(0),
            ) {
                Ok(status) => Some(status),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };
            return match status.as_deref() {
                None => Err(Error::not_found("photo", photo_id)),
                Some("pending") => Ok(()),
                Some(other) => Err(Error::Conflict(format!(
                    "photo {} is {}, cannot reprocess",
                    photo_id, other
                ))),
            };
        }
        Ok(())
    }

    /// `processing -> pending` for photos whose last transition is older than
    /// `threshold_minutes`. Running it again changes nothing.
    pub fn reset_stuck_processing_to_pending(&self, threshold_minutes: i64) -> Result<usize> {
        if threshold_minutes < 0 {
            return Err(Error::invalid("threshold_minutes", "must not be negative"));
        }
        let ts = now();
        let cutoff = ts - Duration::minutes(threshold_minutes);
        let changed = self.conn().execute(
            r#"
            UPDATE photos SET face_status = 'pending', updated_at = ?
            WHERE face_status = 'processing' AND updated_at < ?
            "#,
            params![ts, cutoff],
        )?;
        Ok(changed)
    }

    pub fn face_processing_stats(&self, folders: &[i64]) -> Result<FaceProcessingStats> {
        let mut stats = FaceProcessingStats::default();
        if folders.is_empty() {
            return Ok(stats);
        }
        let conn = self.conn();
        let in_list = placeholders(folders.len());

        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT face_status, COUNT(*) FROM photos
            WHERE is_trashed = 0 AND shared_folder_id IN ({in_list})
            GROUP BY face_status
            "#
        ))?;
        let counts = stmt
            .query_map(params_from_iter(folders.iter()), |row| {
                let status: String = row.get(0)?;
                Ok((parse_column(0, &status, FaceStatus::from_str)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (status, count) in counts {
            match status {
                FaceStatus::Pending => stats.pending = count,
                FaceStatus::Processing => stats.processing = count,
                FaceStatus::Completed => stats.completed = count,
                FaceStatus::Failed => stats.failed = count,
            }
        }

        stats.total_faces = conn.query_row(
            &format!(
                r#"
                SELECT COUNT(*) FROM faces f JOIN photos p ON p.id = f.photo_id
                WHERE p.is_trashed = 0 AND p.shared_folder_id IN ({in_list})
                "#
            ),
            params_from_iter(folders.iter()),
            |row| row.get(0),
        )?;
        Ok(stats)
    }
}

/// Explain why a conditional `processing` write matched no row.
fn not_processing(conn: &rusqlite::Connection, photo_id: i64) -> Result<Error> {
    let status: String = match conn.query_row(
        "SELECT face_status FROM photos WHERE id = ?",
        [photo_id],
        |row| row.get(0),
    ) {
        Ok(status) => status,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(Error::not_found("photo", photo_id)),
        Err(e) => return Err(e.into()),
    };
    Ok(Error::RecoverableStuck(format!(
        "photo {} is {} instead of processing",
        photo_id, status
    )))
}

pub(crate) fn row_to_photo(row: &rusqlite::Row) -> rusqlite::Result<Photo> {
    photo_from_row(row, 0)
}

/// Map a row selected with [`photo_columns`] starting at `offset`.
pub(crate) fn photo_from_row(row: &rusqlite::Row, offset: usize) -> rusqlite::Result<Photo> {
    let status: String = row.get(offset + 6)?;
    Ok(Photo {
        id: row.get(offset)?,
        shared_folder_id: row.get(offset + 1)?,
        drive_file_id: row.get(offset + 2)?,
        file_name: row.get(offset + 3)?,
        mime_type: row.get(offset + 4)?,
        drive_folder_path: row.get(offset + 5)?,
        face_status: parse_column(offset + 6, &status, FaceStatus::from_str)?,
        face_count: row.get(offset + 7)?,
        face_error: row.get(offset + 8)?,
        is_trashed: row.get(offset + 9)?,
        created_at: row.get(offset + 10)?,
        updated_at: row.get(offset + 11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    fn statuses(db: &Database, ids: &[i64]) -> Vec<FaceStatus> {
        ids.iter().map(|id| db.get_photo(*id).unwrap().face_status).collect()
    }

    #[test]
    fn test_insert_skips_existing_drive_files() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        photos(&db, f, &["a", "b"]);

        let again = vec![
            NewPhoto {
                drive_file_id: "b".to_string(),
                file_name: "b.jpg".to_string(),
                mime_type: "image/jpeg".to_string(),
                drive_folder_path: String::new(),
            },
            NewPhoto {
                drive_file_id: "c".to_string(),
                file_name: "c.jpg".to_string(),
                mime_type: "image/jpeg".to_string(),
                drive_folder_path: "Trips".to_string(),
            },
        ];
        assert_eq!(db.insert_photos(f, &again).unwrap(), 1);

        let listed = db.list_photos(&Scope::Folders(vec![f]), 10, 0).unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|p| p.face_status == FaceStatus::Pending));
    }

    #[test]
    fn test_claim_is_exclusive() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["a", "b", "c"]);

        let first = db.claim_pending_photos(2, None).unwrap();
        let second = db.claim_pending_photos(2, None).unwrap();
        let third = db.claim_pending_photos(2, None).unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());

        let mut all: Vec<i64> = first.iter().chain(second.iter()).map(|p| p.id).collect();
        all.sort();
        assert_eq!(all, ids);
        assert!(first.iter().all(|p| p.face_status == FaceStatus::Processing));
    }

    #[test]
    fn test_claim_scoped_to_folders_and_skips_trashed() {
        let db = test_db();
        let ann = user(&db, "ann");
        let fa = folder(&db, ann, "drive-a");
        let fb = folder(&db, ann, "drive-b");
        let a = photos(&db, fa, &["a1", "a2"]);
        photos(&db, fb, &["b1"]);
        db.trash_photo(a[1]).unwrap();

        assert!(db.claim_pending_photos(10, Some(&[][..])).unwrap().is_empty());

        let claimed = db.claim_pending_photos(10, Some(&[fa][..])).unwrap();
        assert_eq!(claimed.iter().map(|p| p.id).collect::<Vec<_>>(), vec![a[0]]);
        assert_eq!(db.get_photo(a[1]).unwrap().face_status, FaceStatus::Pending);
    }

    #[test]
    fn test_claim_oldest_first() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["new", "old"]);
        age_photo(&db, ids[1], 60);

        let claimed = db.claim_pending_photos(1, None).unwrap();
        assert_eq!(claimed[0].id, ids[1]);
    }

    #[test]
    fn test_complete_sets_face_count() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["a"]);
        db.claim_pending_photos(1, None).unwrap();

        let stored = db
            .complete_face_processing(
                ids[0],
                &[face(vec![1.0, 0.0, 0.0, 0.0]), face(vec![0.0, 1.0, 0.0, 0.0])],
            )
            .unwrap();
        assert_eq!(stored, 2);

        let photo = db.get_photo(ids[0]).unwrap();
        assert_eq!(photo.face_status, FaceStatus::Completed);
        assert_eq!(photo.face_count, 2);
        assert_eq!(db.faces_for_photo(ids[0]).unwrap().len(), 2);
    }

    #[test]
    fn test_complete_requires_processing() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["a"]);

        let err = db
            .complete_face_processing(ids[0], &[face(vec![1.0, 0.0, 0.0, 0.0])])
            .unwrap_err();
        assert!(err.is_recoverable_stuck());
        assert!(db.faces_for_photo(ids[0]).unwrap().is_empty());
        assert_eq!(db.get_photo(ids[0]).unwrap().face_count, 0);

        assert!(db
            .complete_face_processing(ids[0] + 99, &[])
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_complete_rejects_wrong_dimension() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["a"]);
        db.claim_pending_photos(1, None).unwrap();

        let err = db
            .complete_face_processing(ids[0], &[face(vec![1.0, 0.0])])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(db.get_photo(ids[0]).unwrap().face_status, FaceStatus::Processing);
    }

    #[test]
    fn test_worker_write_after_reaper_reset_is_dropped() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["a"]);
        db.claim_pending_photos(1, None).unwrap();
        age_photo(&db, ids[0], 30);

        assert_eq!(db.reset_stuck_processing_to_pending(10).unwrap(), 1);

        let err = db
            .complete_face_processing(ids[0], &[face(vec![1.0, 0.0, 0.0, 0.0])])
            .unwrap_err();
        assert!(err.is_recoverable_stuck());
        assert!(db.fail_face_processing(ids[0], "late").unwrap_err().is_recoverable_stuck());

        let photo = db.get_photo(ids[0]).unwrap();
        assert_eq!(photo.face_status, FaceStatus::Pending);
        assert_eq!(photo.face_count, 0);
    }

    #[test]
    fn test_reset_stuck_only_touches_old_processing() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["pending", "completed", "failed", "stuck", "fresh"]);

        force_status(&db, ids[1], FaceStatus::Completed);
        force_status(&db, ids[2], FaceStatus::Failed);
        force_status(&db, ids[3], FaceStatus::Processing);
        force_status(&db, ids[4], FaceStatus::Processing);
        for id in &ids[..4] {
            age_photo(&db, *id, 120);
        }

        assert_eq!(db.reset_stuck_processing_to_pending(30).unwrap(), 1);
        assert_eq!(
            statuses(&db, &ids),
            vec![
                FaceStatus::Pending,
                FaceStatus::Completed,
                FaceStatus::Failed,
                FaceStatus::Pending,
                FaceStatus::Processing,
            ]
        );

        // Idempotent
        assert_eq!(db.reset_stuck_processing_to_pending(30).unwrap(), 0);
        assert!(db.reset_stuck_processing_to_pending(-1).is_err());
    }

    #[test]
    fn test_retry_only_flips_failed() {
        let db = test_db();
        let ann = user(&db, "ann");
        let fa = folder(&db, ann, "drive-a");
        let fb = folder(&db, ann, "drive-b");
        let ids = photos(&db, fa, &["p", "r", "c", "f1", "f2"]);
        let other = photos(&db, fb, &["f3"]);

        force_status(&db, ids[1], FaceStatus::Processing);
        force_status(&db, ids[2], FaceStatus::Completed);
        force_status(&db, ids[3], FaceStatus::Failed);
        force_status(&db, ids[4], FaceStatus::Failed);
        force_status(&db, other[0], FaceStatus::Failed);

        assert_eq!(db.retry_failed_photos(&[fa]).unwrap(), 2);
        assert_eq!(
            statuses(&db, &ids),
            vec![
                FaceStatus::Pending,
                FaceStatus::Processing,
                FaceStatus::Completed,
                FaceStatus::Pending,
                FaceStatus::Pending,
            ]
        );
        assert_eq!(db.get_photo(other[0]).unwrap().face_status, FaceStatus::Failed);

        assert_eq!(db.retry_failed_photos(&[fa]).unwrap(), 0);
        assert_eq!(db.retry_failed_photos(&[]).unwrap(), 0);
    }

    #[test]
    fn test_fail_records_reason() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["a"]);
        db.claim_pending_photos(1, None).unwrap();

        db.fail_face_processing(ids[0], "corrupt jpeg").unwrap();
        let photo = db.get_photo(ids[0]).unwrap();
        assert_eq!(photo.face_status, FaceStatus::Failed);
        assert_eq!(photo.face_error.as_deref(), Some("corrupt jpeg"));
    }

    #[test]
    fn test_reprocess_replaces_faces() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["a"]);
        db.claim_pending_photos(1, None).unwrap();
        db.complete_face_processing(
            ids[0],
            &[face(vec![1.0, 0.0, 0.0, 0.0]), face(vec![0.0, 1.0, 0.0, 0.0])],
        )
        .unwrap();
        let person = db.create_person(ann, "Kim").unwrap();
        let first_face = db.faces_for_photo(ids[0]).unwrap()[0].id;
        db.assign_face_to_person(first_face, person.id).unwrap();

        db.reprocess_photo(ids[0]).unwrap();
        db.claim_pending_photos(1, None).unwrap();
        db.complete_face_processing(ids[0], &[face(vec![0.0, 0.0, 1.0, 0.0])])
            .unwrap();

        assert_eq!(db.get_photo(ids[0]).unwrap().face_count, 1);
        assert_eq!(db.faces_for_photo(ids[0]).unwrap().len(), 1);
        assert_eq!(db.get_person(person.id).unwrap().face_count, 0);
    }

    #[test]
    fn test_reprocess_rejects_processing() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["a"]);
        db.reprocess_photo(ids[0]).unwrap();
        db.claim_pending_photos(1, None).unwrap();
        assert!(db.reprocess_photo(ids[0]).unwrap_err().is_conflict());
        assert!(db.reprocess_photo(ids[0] + 5).unwrap_err().is_not_found());
    }

    #[test]
    fn test_trash_missing_photos() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["keep", "gone"]);

        let present: HashSet<String> = ["keep".to_string()].into_iter().collect();
        assert_eq!(db.trash_missing_photos(f, &present).unwrap(), 1);
        assert!(db.get_photo(ids[1]).unwrap().is_trashed);
        assert!(!db.get_photo(ids[0]).unwrap().is_trashed);
        assert_eq!(db.trash_missing_photos(f, &present).unwrap(), 0);
    }

    #[test]
    fn test_list_photos_by_path_prefix() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["a", "b", "c"]);
        db.update_photo_location(ids[0], "a.jpg", "Trips").unwrap();
        db.update_photo_location(ids[1], "b.jpg", "Trips/Rome").unwrap();
        db.update_photo_location(ids[2], "c.jpg", "Trips2").unwrap();

        let scope = Scope::PathPrefix {
            folders: vec![f],
            prefix: "Trips/".to_string(),
        };
        let mut found: Vec<i64> = db
            .list_photos(&scope, 10, 0)
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        found.sort();
        assert_eq!(found, vec![ids[0], ids[1]]);
    }

    #[test]
    fn test_scoped_listing_never_leaks_other_folders() {
        let db = test_db();
        let ann = user(&db, "ann");
        let bob = user(&db, "bob");
        let carl = user(&db, "carl");
        let fa = folder(&db, ann, "drive-a");
        let fb = folder(&db, bob, "drive-b");
        let fc = folder(&db, carl, "drive-c");
        photos(&db, fa, &["a1", "a2"]);
        photos(&db, fb, &["b1"]);
        photos(&db, fc, &["c1"]);
        db.grant_folder_access(ann, fb).unwrap();

        let allowed = db.accessible_folders(ann).unwrap();
        let listed = db.list_photos(&Scope::Folders(allowed.clone()), 100, 0).unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|p| allowed.contains(&p.shared_folder_id)));

        let own = db.list_photos(&Scope::OwnedBy(ann), 100, 0).unwrap();
        assert!(own.iter().all(|p| p.shared_folder_id == fa));
    }

    #[test]
    fn test_processing_stats() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["a", "b", "c", "d"]);
        force_status(&db, ids[1], FaceStatus::Failed);
        force_status(&db, ids[2], FaceStatus::Processing);
        db.complete_face_processing(ids[2], &[face(vec![1.0, 0.0, 0.0, 0.0])])
            .unwrap();

        let stats = db.face_processing_stats(&[f]).unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.total_faces, 1);
        assert_eq!(stats.total_photos(), 4);
        assert_eq!(db.face_processing_stats(&[]).unwrap(), FaceProcessingStats::default());
    }

    #[test]
    fn test_release_claim() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let ids = photos(&db, f, &["a"]);

        assert!(!db.release_photo_claim(ids[0]).unwrap());
        let claimed = db.claim_pending_photos(10, None).unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(db.release_photo_claim(ids[0]).unwrap());
        assert_eq!(db.get_photo(ids[0]).unwrap().face_status, FaceStatus::Pending);
        assert_eq!(db.claim_pending_photos(10, None).unwrap().len(), 1);
    }
}
