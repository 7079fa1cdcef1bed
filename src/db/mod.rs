pub mod activity;
pub mod faces;
pub mod folders;
pub mod photos;
pub mod search;
pub mod sync_jobs;
pub mod users;

mod schema;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::Result;

pub use activity::{ActivityLog, ActivityType};
pub use faces::{BoundingBox, Face, NewFace, Person};
pub use folders::{SharedFolder, SyncStatus};
pub use photos::{FaceProcessingStats, FaceStatus, NewPhoto, Photo};
pub use schema::SCHEMA;
pub use search::{FaceMatch, SimilarityQuery};
pub use sync_jobs::{JobStatus, JobType, SyncJob};
pub use users::User;

/// Handle to the SQLite store.
///
/// One connection guarded by a mutex; every operation is a short blocking
/// call. Share it between tasks behind an `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
    embedding_dim: usize,
}

impl Database {
    pub fn open(path: &Path, embedding_dim: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Ok(Self::from_connection(conn, embedding_dim))
    }

    pub fn open_in_memory(embedding_dim: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn, embedding_dim))
    }

    fn from_connection(conn: Connection, embedding_dim: usize) -> Self {
        Self {
            conn: Mutex::new(conn),
            embedding_dim,
        }
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Length every stored and queried embedding must have.
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written;
        // the connection itself stays usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Which folders a multi-folder read may see.
///
/// For non-admin callers the folder list comes from
/// [`Database::accessible_folders`]; the store never widens it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Folders the user owns. Grants are not included.
    OwnedBy(i64),
    Folders(Vec<i64>),
    /// Photos inside `prefix` (or any sub-path of it) within `folders`.
    PathPrefix { folders: Vec<i64>, prefix: String },
}

impl Scope {
    /// SQL condition on a photos alias plus its parameters. `None` when the
    /// scope can match nothing.
    pub(crate) fn photo_filter(&self, alias: &str) -> Option<(String, Vec<Value>)> {
        match self {
            Scope::OwnedBy(user_id) => Some((
                format!(
                    "{alias}.shared_folder_id IN (SELECT id FROM shared_folders WHERE owner_id = ?)"
                ),
                vec![Value::Integer(*user_id)],
            )),
            Scope::Folders(folders) => {
                if folders.is_empty() {
                    return None;
                }
                Some((
                    format!("{alias}.shared_folder_id IN ({})", placeholders(folders.len())),
                    id_values(folders),
                ))
            }
            Scope::PathPrefix { folders, prefix } => {
                if folders.is_empty() {
                    return None;
                }
                let mut sql =
                    format!("{alias}.shared_folder_id IN ({})", placeholders(folders.len()));
                let mut values = id_values(folders);
                let prefix = prefix.trim_end_matches('/');
                if !prefix.is_empty() {
                    sql.push_str(&format!(
                        " AND ({alias}.drive_folder_path = ? OR {alias}.drive_folder_path LIKE ? ESCAPE '\\')"
                    ));
                    values.push(Value::Text(prefix.to_string()));
                    values.push(Value::Text(format!("{}/%", escape_like(prefix))));
                }
                Some((sql, values))
            }
        }
    }
}

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub(crate) fn id_values(ids: &[i64]) -> Vec<Value> {
    ids.iter().map(|id| Value::Integer(*id)).collect()
}

fn escape_like(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Map a stored enum string through `parse`, failing the row on unknown values.
pub(crate) fn parse_column<T>(
    idx: usize,
    raw: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unexpected value {:?}", raw).into(),
        )
    })
}

/// Shared fixtures for the store tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub const DIM: usize = 4;

    pub fn test_db() -> Database {
        let db = Database::open_in_memory(DIM).unwrap();
        db.initialize().unwrap();
        db
    }

    pub fn user(db: &Database, name: &str) -> i64 {
        db.create_user(&format!("{name}@example.com"), name).unwrap().id
    }

    pub fn folder(db: &Database, owner_id: i64, drive_id: &str) -> i64 {
        db.create_shared_folder(owner_id, drive_id, drive_id).unwrap().id
    }

    pub fn photos(db: &Database, folder_id: i64, drive_ids: &[&str]) -> Vec<i64> {
        let new: Vec<NewPhoto> = drive_ids
            .iter()
            .map(|id| NewPhoto {
                drive_file_id: id.to_string(),
                file_name: format!("{id}.jpg"),
                mime_type: "image/jpeg".to_string(),
                drive_folder_path: String::new(),
            })
            .collect();
        db.insert_photos(folder_id, &new).unwrap();
        drive_ids
            .iter()
            .map(|id| db.get_photo_by_drive_file_id(folder_id, id).unwrap().unwrap().id)
            .collect()
    }

    /// Set a photo's status directly, bypassing the state machine.
    pub fn force_status(db: &Database, photo_id: i64, status: FaceStatus) {
        db.conn()
            .execute(
                "UPDATE photos SET face_status = ? WHERE id = ?",
                rusqlite::params![status.as_str(), photo_id],
            )
            .unwrap();
    }

    pub fn age_photo(db: &Database, photo_id: i64, minutes: i64) {
        let at = now() - chrono::Duration::minutes(minutes);
        db.conn()
            .execute(
                "UPDATE photos SET updated_at = ?, created_at = ? WHERE id = ?",
                rusqlite::params![at, at, photo_id],
            )
            .unwrap();
    }

    pub fn face(embedding: Vec<f32>) -> NewFace {
        NewFace {
            bbox: BoundingBox {
                x: 10.0,
                y: 20.0,
                width: 30.0,
                height: 40.0,
            },
            confidence: 0.99,
            embedding,
        }
    }
}
