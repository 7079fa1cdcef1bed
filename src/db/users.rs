use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{now, Database};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub provider: String,
    pub provider_id: Option<String>,
    pub public_slug: Option<String>,
    pub created_at: DateTime<Utc>,
}

const USER_COLUMNS: &str = "id, email, username, provider, provider_id, public_slug, created_at";

impl Database {
    pub fn create_user(&self, email: &str, username: &str) -> Result<User> {
        let conn = self.conn();
        let user = conn.query_row(
            &format!(
                "INSERT INTO users (email, username, created_at) VALUES (?, ?, ?) RETURNING {USER_COLUMNS}"
            ),
            params![email, username, now()],
            row_to_user,
        );
        match user {
            Ok(user) => Ok(user),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::Conflict(format!("user {} already exists", email)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_user(&self, user_id: i64) -> Result<User> {
        let result = self.conn().query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"),
            [user_id],
            row_to_user,
        );
        match result {
            Ok(user) => Ok(user),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(Error::not_found("user", user_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let result = self.conn().query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?"),
            [email],
            row_to_user,
        );
        match result {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        username: row.get(2)?,
        provider: row.get(3)?,
        provider_id: row.get(4)?,
        public_slug: row.get(5)?,
        created_at: row.get(6)?,
    })
}
