//! Per-folder activity trail.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, ToSql};

use super::{now, parse_column, Database};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityType {
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    PhotosAdded,
    PhotosTrashed,
    FacesRetried,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::SyncStarted => "sync_started",
            ActivityType::SyncCompleted => "sync_completed",
            ActivityType::SyncFailed => "sync_failed",
            ActivityType::PhotosAdded => "photos_added",
            ActivityType::PhotosTrashed => "photos_trashed",
            ActivityType::FacesRetried => "faces_retried",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sync_started" => Some(ActivityType::SyncStarted),
            "sync_completed" => Some(ActivityType::SyncCompleted),
            "sync_failed" => Some(ActivityType::SyncFailed),
            "photos_added" => Some(ActivityType::PhotosAdded),
            "photos_trashed" => Some(ActivityType::PhotosTrashed),
            "faces_retried" => Some(ActivityType::FacesRetried),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityLog {
    pub id: i64,
    pub folder_id: i64,
    pub activity_type: ActivityType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Database {
    pub fn log_activity(
        &self,
        folder_id: i64,
        activity_type: ActivityType,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO activity_logs (folder_id, activity_type, payload, created_at) VALUES (?, ?, ?, ?)",
            params![folder_id, activity_type.as_str(), payload.to_string(), now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest entries first, optionally restricted to one type.
    pub fn list_activity(
        &self,
        folder_id: i64,
        activity_type: Option<ActivityType>,
        limit: usize,
    ) -> Result<Vec<ActivityLog>> {
        let mut sql = String::from(
            "SELECT id, folder_id, activity_type, payload, created_at FROM activity_logs WHERE folder_id = ?",
        );
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(folder_id)];
        if let Some(activity_type) = activity_type {
            sql.push_str(" AND activity_type = ?");
            args.push(Box::new(activity_type.as_str()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        args.push(Box::new(limit as i64));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                let activity_type: String = row.get(2)?;
                let payload: String = row.get(3)?;
                Ok(ActivityLog {
                    id: row.get(0)?,
                    folder_id: row.get(1)?,
                    activity_type: parse_column(2, &activity_type, ActivityType::from_str)?,
                    // Entries are written by this crate; fall back to null rather
                    // than hide the row.
                    payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    /// Delete entries older than `days`. Returns the number removed.
    pub fn prune_activity_older_than(&self, days: i64) -> Result<usize> {
        if days < 0 {
            return Err(Error::invalid("days", "must not be negative"));
        }
        let cutoff = now() - Duration::days(days);
        let removed = self
            .conn()
            .execute("DELETE FROM activity_logs WHERE created_at < ?", params![cutoff])?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_and_list() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let other = folder(&db, ann, "drive-b");

        db.log_activity(f, ActivityType::SyncStarted, &json!({"job_id": 1}))
            .unwrap();
        db.log_activity(f, ActivityType::PhotosAdded, &json!({"count": 12}))
            .unwrap();
        db.log_activity(other, ActivityType::SyncStarted, &json!({}))
            .unwrap();

        let all = db.list_activity(f, None, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].activity_type, ActivityType::PhotosAdded);
        assert_eq!(all[0].payload["count"], 12);

        let started = db
            .list_activity(f, Some(ActivityType::SyncStarted), 10)
            .unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].payload["job_id"], 1);

        assert_eq!(db.list_activity(f, None, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_prune_by_age() {
        let db = test_db();
        let ann = user(&db, "ann");
        let f = folder(&db, ann, "drive-a");
        let old = db
            .log_activity(f, ActivityType::SyncCompleted, &json!({}))
            .unwrap();
        db.log_activity(f, ActivityType::SyncFailed, &json!({"error": "quota"}))
            .unwrap();
        db.conn()
            .execute(
                "UPDATE activity_logs SET created_at = ? WHERE id = ?",
                params![now() - Duration::days(120), old],
            )
            .unwrap();

        assert_eq!(db.prune_activity_older_than(90).unwrap(), 1);
        assert_eq!(db.prune_activity_older_than(90).unwrap(), 0);
        let left = db.list_activity(f, None, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].activity_type, ActivityType::SyncFailed);
        assert!(db.prune_activity_older_than(-1).is_err());
    }
}
