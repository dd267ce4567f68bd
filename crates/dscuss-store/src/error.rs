use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cannot open database {path}: {reason}")]
    CantOpenDb { path: String, reason: String },

    #[error("Database operation failed: {0}")]
    DbOperFailed(String),

    /// A stored row no longer passes entity validation.
    #[error("Inconsistent database: {0}")]
    InconsistentDb(String),

    /// The referenced entity is not stored. A routine outcome for lookups.
    #[error("No such entity")]
    NoSuchEntity,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("User is already a moderator")]
    AlreadyModerator,

    #[error("User is not a moderator")]
    NoSuchModerator,

    /// The owner is an implicit moderator and cannot be added or removed.
    #[error("Forbidden operation")]
    ForbiddenOperation,
}

impl StoreError {
    pub(crate) fn from_query(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NoSuchEntity,
            other => StoreError::Sqlite(other),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
