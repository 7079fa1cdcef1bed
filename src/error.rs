//! Error types shared by the store, the scheduler and the workers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Photo, face, person, job or folder absent
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Duplicate active sync job, duplicate scheduler job id, or an illegal
    /// state transition
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid {field}: {message}")]
    InvalidArgument {
        field: &'static str,
        message: String,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A collaborator (drive, face detector) failed
    #[error("{context}: {source}")]
    Upstream {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// The row left the state this writer expected, usually because the
    /// stuck-work reaper reset it. Handled by the worker, never shown to users.
    #[error("recoverable stuck state: {0}")]
    RecoverableStuck(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field,
            message: message.into(),
        }
    }

    pub fn upstream(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Upstream {
            context: context.into(),
            source,
        }
    }

    pub fn is_recoverable_stuck(&self) -> bool {
        matches!(self, Self::RecoverableStuck(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
