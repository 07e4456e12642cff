//! Error types for checkpoint operations

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Checkpoint or thread not found
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// Transaction could not be serialized against a concurrent writer
    #[error("Storage conflict after {attempts} attempt(s): {message}")]
    Conflict { attempts: usize, message: String },

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[source] sqlx::Error),

    /// Schema migration of the database failed
    #[error("Schema migration failed: {0}")]
    Schema(#[from] sqlx::migrate::MigrateError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored bytes could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A single migration step failed
    #[error(transparent)]
    MigrationStep(#[from] MigrationStepError),

    /// Invalid checkpoint or key
    #[error("Invalid checkpoint: {0}")]
    Invalid(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    /// Whether a caller-driven retry can succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<sqlx::Error> for CheckpointError {
    fn from(err: sqlx::Error) -> Self {
        if is_busy(&err) {
            Self::Conflict {
                attempts: 1,
                message: err.to_string(),
            }
        } else {
            Self::Storage(err)
        }
    }
}

/// SQLite reports lock contention as SQLITE_BUSY (5) or SQLITE_LOCKED (6),
/// including their extended codes.
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code();
            let primary = code
                .as_deref()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| c & 0xff);
            matches!(primary, Some(5) | Some(6))
                || db.message().contains("database is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Stored value could not be decoded, even after the legacy fallback.
///
/// Carried per channel in a [`CheckpointRecord`](crate::CheckpointRecord) so a
/// single unreadable blob does not fail the whole read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Decode error for {context}: {message}")]
pub struct DecodeError {
    pub context: String,
    pub message: String,
}

impl DecodeError {
    pub fn new(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Attach the channel (or write) the failure belongs to
    pub fn within(mut self, context: impl Into<String>) -> Self {
        self.context = format!("{} ({})", context.into(), self.context);
        self
    }
}

/// One step of the migration chain failed. Logged and skipped by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Migration '{migration}' (schema v{version}) failed: {message}")]
pub struct MigrationStepError {
    pub migration: String,
    pub version: u32,
    pub message: String,
}

impl MigrationStepError {
    pub fn new(migration: impl Into<String>, version: u32, message: impl Into<String>) -> Self {
        Self {
            migration: migration.into(),
            version,
            message: message.into(),
        }
    }
}
