//! Database connection and schema migrations
//!
//! Wraps a SQLite pool configured for concurrent checkpoint writers: WAL
//! journaling and a busy timeout so lock contention waits before surfacing as
//! a conflict.

use crate::config::DatabaseConfig;
use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Type alias for the database connection pool
pub type DatabasePool = SqlitePool;

/// Database connection wrapper
#[derive(Clone, Debug)]
pub struct Database {
    pub(crate) pool: Arc<DatabasePool>,
}

impl Database {
    /// Connect using a database configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let in_memory = is_in_memory(&config.url);
        debug!(url = %config.url, in_memory, "Connecting to database");

        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // every connection to `:memory:` is its own database, so keep exactly one alive
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };

        let pool = pool_options.connect_with(options).await?;

        info!(url = %config.url, "Database connection established");

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Open (or create) a database file
    ///
    /// # Arguments
    /// * `database_path` - Path to the SQLite database file
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let path = database_path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let config = DatabaseConfig {
            url: format!("sqlite:{}", path.display()),
            ..DatabaseConfig::default()
        };
        Self::connect(&config).await
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        };
        Self::connect(&config).await
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Run migrations on the database
    ///
    /// Migrations are embedded in the binary and located in ./migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Perform a health check by running a simple query
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.pool.as_ref()).await?;
        Ok(())
    }

    /// Close the database connection
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection closed");
    }

    /// Connect and apply the schema
    pub async fn initialize(config: &DatabaseConfig) -> Result<Self> {
        let db = Self::connect(config).await?;
        db.run_migrations().await?;
        Ok(db)
    }
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.health_check().await.is_ok());
        db.close().await;
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'checkpoint%' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(names, vec!["checkpoint_blobs", "checkpoint_writes", "checkpoints"]);

        // applying twice is a no-op
        db.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_database_creates_parent_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("store.db");

        let db = Database::new(&path).await.unwrap();
        assert!(db.health_check().await.is_ok());
        assert!(path.exists());
        db.close().await;
    }

    #[test]
    fn test_is_in_memory() {
        assert!(is_in_memory("sqlite::memory:"));
        assert!(is_in_memory("sqlite:file:x?mode=memory&cache=shared"));
        assert!(!is_in_memory("sqlite:checkpoints.db"));
    }
}
