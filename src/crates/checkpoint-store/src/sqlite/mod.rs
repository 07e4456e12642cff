//! SQLite checkpoint backend
//!
//! Three tables, created by the embedded migrations:
//!
//! - `checkpoints` - one row per checkpoint, keyed by `(thread_id, checkpoint_ns, checkpoint_id)`
//! - `checkpoint_blobs` - channel values, see [`BlobStore`]
//! - `checkpoint_writes` - pending writes, see [`WriteLog`]
//!
//! `put`, `put_writes` and `delete_thread` each run in one transaction and are
//! retried on lock conflicts according to the configured [`RetryConfig`].
//! Reads take no locks. Values upgraded by the migration engine during a read
//! are written back in separate statements when write-back is enabled; a
//! failed write-back is logged and never fails the read.

mod blobs;
mod writes;

pub use blobs::BlobStore;
pub use writes::WriteLog;

use crate::checkpoint::{
    ChannelVersions, Checkpoint, CheckpointMetadata, CheckpointRecord, ListFilter, ThreadKey,
};
use crate::config::StoreConfig;
use crate::db::Database;
use crate::error::{CheckpointError, Result};
use crate::loader::{self, referenced_versions, validate_put, StoredCheckpoint, Upgrades};
use crate::retry::{with_retry, RetryConfig};
use crate::serializer::{JsonPlusSerializer, SerializerProtocol, TypedPayload};
use crate::traits::{CheckpointSaver, CheckpointStream, DEFAULT_MAX_PARENT_DEPTH};
use crate::value::StateValue;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sqlx::{QueryBuilder, Sqlite};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

type CheckpointRowTuple = (String, String, String, Option<String>, String, String);

const SELECT_CHECKPOINT: &str = "SELECT thread_id, checkpoint_ns, checkpoint_id, parent_checkpoint_id, checkpoint, metadata
     FROM checkpoints";

fn stored(row: CheckpointRowTuple) -> StoredCheckpoint {
    let (thread_id, checkpoint_ns, checkpoint_id, parent_id, checkpoint, metadata) = row;
    StoredCheckpoint {
        thread_id,
        checkpoint_ns,
        checkpoint_id,
        parent_id,
        checkpoint,
        metadata,
    }
}

/// Durable checkpoint saver on SQLite
#[derive(Clone)]
pub struct SqliteCheckpointSaver {
    db: Database,
    serializer: Arc<dyn SerializerProtocol>,
    retry: RetryConfig,
    write_back: bool,
    max_parent_depth: usize,
}

impl SqliteCheckpointSaver {
    /// Saver over an existing database; applies the schema if needed
    pub async fn new(db: Database) -> Result<Self> {
        db.run_migrations().await?;
        Ok(Self {
            db,
            serializer: Arc::new(JsonPlusSerializer::default()),
            retry: RetryConfig::default(),
            write_back: true,
            max_parent_depth: DEFAULT_MAX_PARENT_DEPTH,
        })
    }

    /// Connect, migrate and apply retry and migration settings from `config`
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let db = Database::connect(&config.database).await?;
        Ok(Self::new(db)
            .await?
            .with_retry(config.retry.clone())
            .with_write_back(config.migration.write_back)
            .with_max_parent_depth(config.migration.max_parent_depth))
    }

    /// Use a custom serializer (type registry, migrations)
    pub fn with_serializer(mut self, serializer: Arc<dyn SerializerProtocol>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_write_back(mut self, write_back: bool) -> Self {
        self.write_back = write_back;
        self
    }

    pub fn with_max_parent_depth(mut self, max_parent_depth: usize) -> Self {
        self.max_parent_depth = max_parent_depth;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn put_once(
        &self,
        key: &ThreadKey,
        checkpoint_id: &str,
        checkpoint_json: &str,
        metadata_json: &str,
        blobs: &[(String, String, TypedPayload)],
        referenced: &ChannelVersions,
    ) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        // the first statement must write so the transaction holds the write lock before any read
        sqlx::query(
            "INSERT INTO checkpoints (thread_id, checkpoint_ns, checkpoint_id, parent_checkpoint_id, checkpoint, metadata)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (thread_id, checkpoint_ns, checkpoint_id) DO UPDATE SET
               parent_checkpoint_id = excluded.parent_checkpoint_id,
               checkpoint = excluded.checkpoint,
               metadata = excluded.metadata",
        )
        .bind(&key.thread_id)
        .bind(&key.checkpoint_ns)
        .bind(checkpoint_id)
        .bind(key.checkpoint_id.as_deref())
        .bind(checkpoint_json)
        .bind(metadata_json)
        .execute(&mut *tx)
        .await?;

        if let Some(parent_id) = &key.checkpoint_id {
            let parent: Option<(i64,)> = sqlx::query_as(
                "SELECT 1 FROM checkpoints WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
            )
            .bind(&key.thread_id)
            .bind(&key.checkpoint_ns)
            .bind(parent_id)
            .fetch_optional(&mut *tx)
            .await?;
            if parent.is_none() {
                return Err(CheckpointError::Invalid(format!(
                    "parent checkpoint {} does not exist in thread {} namespace '{}'",
                    parent_id, key.thread_id, key.checkpoint_ns
                )));
            }
        }

        BlobStore::insert_many(&mut tx, &key.thread_id, &key.checkpoint_ns, blobs).await?;

        for (channel, version) in referenced {
            if !BlobStore::exists(
                &mut tx,
                &key.thread_id,
                &key.checkpoint_ns,
                channel,
                version.as_str(),
            )
            .await?
            {
                return Err(CheckpointError::Invalid(format!(
                    "channel '{}' references version {} which has no stored value",
                    channel, version
                )));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn put_writes_once(
        &self,
        key: &ThreadKey,
        checkpoint_id: &str,
        task_id: &str,
        writes: &[(String, TypedPayload)],
    ) -> Result<u64> {
        let mut tx = self.db.pool().begin().await?;

        // inserts first, for the same lock ordering as `put_once`
        let affected = WriteLog::insert_batch(
            &mut tx,
            &key.thread_id,
            &key.checkpoint_ns,
            checkpoint_id,
            task_id,
            writes,
        )
        .await?;

        let exists: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM checkpoints WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
        )
        .bind(&key.thread_id)
        .bind(&key.checkpoint_ns)
        .bind(checkpoint_id)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_none() {
            // dropping the transaction rolls the inserts back
            return Err(CheckpointError::NotFound(checkpoint_id.to_string()));
        }

        tx.commit().await?;
        Ok(affected)
    }

    async fn load_record(&self, row: StoredCheckpoint) -> Result<CheckpointRecord> {
        let checkpoint_row = row.parse_checkpoint()?;

        let mut conn = self.db.pool().acquire().await?;
        let blobs = BlobStore::load(
            &mut conn,
            &row.thread_id,
            &row.checkpoint_ns,
            &checkpoint_row.channel_versions,
        )
        .await?;
        let writes = WriteLog::load(
            &mut conn,
            &row.thread_id,
            &row.checkpoint_ns,
            &row.checkpoint_id,
        )
        .await?;
        let parent_writes = match row.sends_parent() {
            Some(parent_id) => WriteLog::load(
                &mut conn,
                &row.thread_id,
                &row.checkpoint_ns,
                parent_id,
            )
            .await?,
            None => Vec::new(),
        };
        drop(conn);

        let parent_sends = row.parent_sends(parent_writes);
        let thread_id = row.thread_id.clone();
        let checkpoint_ns = row.checkpoint_ns.clone();
        let assembled = loader::assemble(
            self.serializer.as_ref(),
            row,
            checkpoint_row,
            blobs,
            writes,
            parent_sends,
        )?;

        if !assembled.record.decode_failures.is_empty() {
            warn!(
                thread_id = %thread_id,
                checkpoint_id = ?assembled.record.key.checkpoint_id,
                failures = assembled.record.decode_failures.len(),
                "Checkpoint read with undecodable values"
            );
        }

        if self.write_back && !assembled.upgrades.is_empty() {
            self.write_back(&thread_id, &checkpoint_ns, &assembled.upgrades).await;
        }

        Ok(assembled.record)
    }

    /// Persist upgraded encodings. Each row is its own statement; a failure
    /// leaves the old encoding in place, which later reads migrate again.
    async fn write_back(&self, thread_id: &str, checkpoint_ns: &str, upgrades: &Upgrades) {
        let mut conn = match self.db.pool().acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Skipping write-back, no connection");
                return;
            }
        };

        let mut written = 0;
        for blob in &upgrades.blobs {
            match BlobStore::upgrade(
                &mut conn,
                thread_id,
                checkpoint_ns,
                &blob.channel,
                &blob.version,
                &blob.upgraded,
            )
            .await
            {
                Ok(n) => written += n,
                Err(e) => warn!(
                    thread_id = %thread_id,
                    channel = %blob.channel,
                    error = %e,
                    "Write-back of migrated blob failed"
                ),
            }
        }
        for write in &upgrades.writes {
            match WriteLog::upgrade(
                &mut conn,
                thread_id,
                checkpoint_ns,
                &write.checkpoint_id,
                &write.task_id,
                write.idx,
                &write.original,
                &write.upgraded,
            )
            .await
            {
                Ok(n) => written += n,
                Err(e) => warn!(
                    thread_id = %thread_id,
                    task_id = %write.task_id,
                    error = %e,
                    "Write-back of migrated write failed"
                ),
            }
        }

        debug!(
            thread_id = %thread_id,
            candidates = upgrades.len(),
            written,
            "Migrated rows written back"
        );
    }
}

impl std::fmt::Debug for SqliteCheckpointSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointSaver")
            .field("db", &self.db)
            .field("retry", &self.retry)
            .field("write_back", &self.write_back)
            .field("max_parent_depth", &self.max_parent_depth)
            .finish()
    }
}

#[async_trait]
impl CheckpointSaver for SqliteCheckpointSaver {
    #[instrument(
        skip(self, checkpoint, metadata, new_versions),
        fields(thread_id = %key.thread_id, checkpoint_id = %checkpoint.id),
        err
    )]
    async fn put(
        &self,
        key: &ThreadKey,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<ThreadKey> {
        validate_put(key, &checkpoint, &new_versions)?;

        let checkpoint_json = serde_json::to_string(&checkpoint.to_row())?;
        let metadata_json = serde_json::to_string(&metadata)?;

        let mut blobs = Vec::with_capacity(new_versions.len());
        for (channel, version) in &new_versions {
            let payload = self.serializer.dumps_typed(checkpoint.channel_values.get(channel))?;
            blobs.push((channel.clone(), version.as_str().to_string(), payload));
        }

        let referenced = referenced_versions(&checkpoint, &new_versions);

        with_retry(&self.retry, "put", || {
            self.put_once(
                key,
                &checkpoint.id,
                &checkpoint_json,
                &metadata_json,
                &blobs,
                &referenced,
            )
        })
        .await?;

        debug!(blobs = blobs.len(), parent = ?key.checkpoint_id, "Checkpoint stored");
        Ok(key.at(checkpoint.id.clone()))
    }

    #[instrument(
        skip(self, writes),
        fields(thread_id = %key.thread_id, writes = writes.len()),
        err
    )]
    async fn put_writes(
        &self,
        key: &ThreadKey,
        writes: Vec<(String, StateValue)>,
        task_id: &str,
    ) -> Result<()> {
        let checkpoint_id = key
            .checkpoint_id
            .as_deref()
            .ok_or_else(|| CheckpointError::Invalid("checkpoint_id is required".to_string()))?;

        if writes.is_empty() {
            debug!("Empty write batch, nothing stored");
            return Ok(());
        }

        let mut payloads = Vec::with_capacity(writes.len());
        for (channel, value) in &writes {
            payloads.push((channel.clone(), self.serializer.dumps_typed(Some(value))?));
        }

        let affected = with_retry(&self.retry, "put_writes", || {
            self.put_writes_once(key, checkpoint_id, task_id, &payloads)
        })
        .await?;

        debug!(affected, "Pending writes stored");
        Ok(())
    }

    #[instrument(skip(self), fields(thread_id = %key.thread_id), err)]
    async fn get_tuple(&self, key: &ThreadKey) -> Result<Option<CheckpointRecord>> {
        let row: Option<CheckpointRowTuple> = match &key.checkpoint_id {
            Some(checkpoint_id) => {
                sqlx::query_as(&format!(
                    "{} WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
                    SELECT_CHECKPOINT
                ))
                .bind(&key.thread_id)
                .bind(&key.checkpoint_ns)
                .bind(checkpoint_id)
                .fetch_optional(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "{} WHERE thread_id = ? AND checkpoint_ns = ? ORDER BY checkpoint_id DESC LIMIT 1",
                    SELECT_CHECKPOINT
                ))
                .bind(&key.thread_id)
                .bind(&key.checkpoint_ns)
                .fetch_optional(self.db.pool())
                .await?
            }
        };

        match row {
            Some(row) => Ok(Some(self.load_record(stored(row)).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, filter, before), err)]
    async fn list(
        &self,
        filter: &ListFilter,
        before: Option<&ThreadKey>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let before_id = before.and_then(|key| key.checkpoint_id.clone());

        let mut query = QueryBuilder::<Sqlite>::new(SELECT_CHECKPOINT);
        query.push(" WHERE 1 = 1");
        if let Some(thread_id) = &filter.thread_id {
            query.push(" AND thread_id = ").push_bind(thread_id.clone());
        }
        if let Some(checkpoint_ns) = &filter.checkpoint_ns {
            query.push(" AND checkpoint_ns = ").push_bind(checkpoint_ns.clone());
        }
        if let Some(before_id) = &before_id {
            query.push(" AND checkpoint_id < ").push_bind(before_id.clone());
        }
        query.push(" ORDER BY checkpoint_id DESC");
        // metadata is matched after fetching, so the limit applies afterwards too
        if let (Some(limit), None) = (limit, &filter.metadata) {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<CheckpointRowTuple> = query.build_query_as().fetch_all(self.db.pool()).await?;

        let matching: Vec<StoredCheckpoint> = rows
            .into_iter()
            .map(stored)
            .filter(|row| row.matches(filter, before_id.as_deref()))
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        debug!(count = matching.len(), "Listing checkpoints");

        let saver = self.clone();
        let records = stream::iter(matching).then(move |row| {
            let saver = saver.clone();
            async move { saver.load_record(row).await }
        });

        Ok(Box::pin(records))
    }

    #[instrument(skip(self), err)]
    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let (checkpoints, blobs, writes) = with_retry(&self.retry, "delete_thread", || async {
            let mut tx = self.db.pool().begin().await?;
            let writes = WriteLog::delete_thread(&mut tx, thread_id).await?;
            let blobs = BlobStore::delete_thread(&mut tx, thread_id).await?;
            let checkpoints = sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
                .bind(thread_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;
            Ok::<_, CheckpointError>((checkpoints, blobs, writes))
        })
        .await?;

        info!(thread_id = %thread_id, checkpoints, blobs, writes, "Thread deleted");
        Ok(())
    }

    fn max_parent_depth(&self) -> usize {
        self.max_parent_depth
    }
}
