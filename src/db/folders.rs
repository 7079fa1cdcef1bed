//! Shared folders and the folder access resolver.
//!
//! A user may read a folder when they own it or hold a grant row in
//! `user_folder_access`. Every multi-folder read is filtered through
//! [`Database::accessible_folders`].

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{now, parse_column, Database};
use crate::error::{Error, Result};

/// Sync state of a shared folder as shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(SyncStatus::Idle),
            "syncing" => Some(SyncStatus::Syncing),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SharedFolder {
    pub id: i64,
    pub owner_id: i64,
    pub drive_folder_id: String,
    pub name: String,
    pub webhook_token: String,
    pub sync_status: SyncStatus,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SharedFolder {
    /// Whether the owning account's drive credentials are present.
    pub fn has_tokens(&self) -> bool {
        self.access_token.is_some() || self.refresh_token.is_some()
    }
}

const FOLDER_COLUMNS: &str = r#"
    id, owner_id, drive_folder_id, name, webhook_token, sync_status, last_error,
    last_synced_at, access_token, refresh_token, token_expiry, created_at, updated_at
"#;

impl Database {
    // ========================================================================
    // Folder records
    // ========================================================================

    /// Register a drive folder for `owner_id` with a fresh webhook token.
    pub fn create_shared_folder(
        &self,
        owner_id: i64,
        drive_folder_id: &str,
        name: &str,
    ) -> Result<SharedFolder> {
        let token = uuid::Uuid::new_v4().to_string();
        let ts = now();
        let result = self.conn().query_row(
            &format!(
                r#"
                INSERT INTO shared_folders
                    (owner_id, drive_folder_id, name, webhook_token, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                RETURNING {FOLDER_COLUMNS}
                "#
            ),
            params![owner_id, drive_folder_id, name, token, ts, ts],
            row_to_folder,
        );
        match result {
            Ok(folder) => Ok(folder),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::Conflict(format!(
                    "drive folder {} already linked by user {}",
                    drive_folder_id, owner_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_shared_folder(&self, folder_id: i64) -> Result<SharedFolder> {
        let result = self.conn().query_row(
            &format!("SELECT {FOLDER_COLUMNS} FROM shared_folders WHERE id = ?"),
            [folder_id],
            row_to_folder,
        );
        match result {
            Ok(folder) => Ok(folder),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(Error::not_found("shared folder", folder_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the folder a drive push notification belongs to.
    pub fn get_folder_by_webhook_token(&self, token: &str) -> Result<Option<SharedFolder>> {
        let result = self.conn().query_row(
            &format!("SELECT {FOLDER_COLUMNS} FROM shared_folders WHERE webhook_token = ?"),
            [token],
            row_to_folder,
        );
        match result {
            Ok(folder) => Ok(Some(folder)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Folders the user can read, owned first, then granted, by name.
    pub fn list_accessible_folders(&self, user_id: i64) -> Result<Vec<SharedFolder>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {FOLDER_COLUMNS} FROM shared_folders
            WHERE owner_id = ?1
               OR id IN (SELECT folder_id FROM user_folder_access WHERE user_id = ?1)
            ORDER BY owner_id != ?1, name, id
            "#
        ))?;
        let folders = stmt
            .query_map([user_id], row_to_folder)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(folders)
    }

    pub fn update_folder_sync_status(
        &self,
        folder_id: i64,
        status: SyncStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let ts = now();
        let synced_at = (status == SyncStatus::Idle).then_some(ts);
        let changed = self.conn().execute(
            r#"
            UPDATE shared_folders
            SET sync_status = ?, last_error = ?,
                last_synced_at = COALESCE(?, last_synced_at), updated_at = ?
            WHERE id = ?
            "#,
            params![status.as_str(), last_error, synced_at, ts, folder_id],
        )?;
        if changed == 0 {
            return Err(Error::not_found("shared folder", folder_id));
        }
        Ok(())
    }

    /// Store drive credentials obtained by the OAuth collaborator.
    pub fn set_folder_tokens(
        &self,
        folder_id: i64,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        token_expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let changed = self.conn().execute(
            r#"
            UPDATE shared_folders
            SET access_token = ?, refresh_token = ?, token_expiry = ?, updated_at = ?
            WHERE id = ?
            "#,
            params![access_token, refresh_token, token_expiry, now(), folder_id],
        )?;
        if changed == 0 {
            return Err(Error::not_found("shared folder", folder_id));
        }
        Ok(())
    }

    // ========================================================================
    // Access resolver
    // ========================================================================

    /// Grant read access. Granting twice is a no-op.
    pub fn grant_folder_access(&self, user_id: i64, folder_id: i64) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO user_folder_access (user_id, folder_id, granted_at)
            VALUES (?, ?, ?)
            ON CONFLICT (user_id, folder_id) DO NOTHING
            "#,
            params![user_id, folder_id, now()],
        )?;
        Ok(())
    }

    /// Returns whether a grant existed.
    pub fn revoke_folder_access(&self, user_id: i64, folder_id: i64) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM user_folder_access WHERE user_id = ? AND folder_id = ?",
            params![user_id, folder_id],
        )?;
        Ok(removed > 0)
    }

    /// Ids of every folder the user owns or has been granted, ascending.
    pub fn accessible_folders(&self, user_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id FROM shared_folders WHERE owner_id = ?1
            UNION
            SELECT folder_id FROM user_folder_access WHERE user_id = ?1
            ORDER BY 1
            "#,
        )?;
        let ids = stmt
            .query_map([user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    pub fn has_access(&self, user_id: i64, folder_id: i64) -> Result<bool> {
        let allowed: bool = self.conn().query_row(
            r#"
            SELECT EXISTS (SELECT 1 FROM shared_folders WHERE id = ?2 AND owner_id = ?1)
                OR EXISTS (SELECT 1 FROM user_folder_access WHERE user_id = ?1 AND folder_id = ?2)
            "#,
            params![user_id, folder_id],
            |row| row.get(0),
        )?;
        Ok(allowed)
    }

    /// Users who may read the folder: the owner plus every grantee.
    pub fn folder_readers(&self, folder_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT owner_id FROM shared_folders WHERE id = ?1
            UNION
            SELECT user_id FROM user_folder_access WHERE folder_id = ?1
            ORDER BY 1
            "#,
        )?;
        let ids = stmt
            .query_map([folder_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }
}

fn row_to_folder(row: &rusqlite::Row) -> rusqlite::Result<SharedFolder> {
    let status: String = row.get(5)?;
    Ok(SharedFolder {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        drive_folder_id: row.get(2)?,
        name: row.get(3)?,
        webhook_token: row.get(4)?,
        sync_status: parse_column(5, &status, SyncStatus::from_str)?,
        last_error: row.get(6)?,
        last_synced_at: row.get(7)?,
        access_token: row.get(8)?,
        refresh_token: row.get(9)?,
        token_expiry: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}
