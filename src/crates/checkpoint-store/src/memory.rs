//! In-memory checkpoint storage for development and testing
//!
//! [`InMemoryCheckpointSaver`] keeps the same three row sets as the SQLite
//! backend (checkpoints, blobs, pending writes) in maps behind a
//! `tokio::sync::RwLock`. Values are stored encoded, so reads go through the
//! same envelope decoding and migration path as a durable store. Nothing
//! survives the process.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Arc<RwLock<Storage>>                                        │
//! │    checkpoints  (thread, ns) → checkpoint_id → row           │
//! │    blobs        (thread, ns, channel, version) → payload     │
//! │    writes       (thread, ns, checkpoint_id)                  │
//! │                   → (task_id, idx) → (channel, payload)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each `put` and `put_writes` validates and mutates under a single write
//! lock, which gives them the same all-or-nothing behavior as a transaction.
//!
//! # Example
//!
//! ```rust
//! use checkpoint_store::{Checkpoint, CheckpointMetadata, CheckpointSaver, InMemoryCheckpointSaver, ThreadKey};
//! use std::collections::HashMap;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let saver = InMemoryCheckpointSaver::new();
//! let key = saver
//!     .put(&ThreadKey::new("session-1"), Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
//!     .await?;
//! assert!(saver.get(&key).await?.is_some());
//! # Ok(())
//! # }
//! ```

use crate::{
    checkpoint::{
        is_overwritable, ChannelVersions, Checkpoint, CheckpointMetadata, CheckpointRecord,
        ListFilter, ThreadKey,
    },
    error::{CheckpointError, Result},
    loader::{self, referenced_versions, validate_put, StoredCheckpoint, StoredWrite, Upgrades},
    serializer::{JsonPlusSerializer, SerializerProtocol, TypedPayload},
    traits::{CheckpointSaver, CheckpointStream, DEFAULT_MAX_PARENT_DEPTH},
    value::StateValue,
};
use async_trait::async_trait;
use futures::stream;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

type ThreadNs = (String, String);
type BlobKey = (String, String, String, String);
type WriteKey = (String, String, String);

#[derive(Debug, Default)]
struct Storage {
    checkpoints: HashMap<ThreadNs, BTreeMap<String, StoredCheckpoint>>,
    blobs: HashMap<BlobKey, TypedPayload>,
    writes: HashMap<WriteKey, BTreeMap<(String, i64), (String, TypedPayload)>>,
}

impl Storage {
    fn writes_for(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Vec<StoredWrite> {
        let key = (thread_id.to_string(), checkpoint_ns.to_string(), checkpoint_id.to_string());
        self.writes
            .get(&key)
            .map(|writes| {
                writes
                    .iter()
                    .map(|((task_id, idx), (channel, payload))| StoredWrite {
                        task_id: task_id.clone(),
                        idx: *idx,
                        channel: channel.clone(),
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn has_checkpoint(&self, thread_id: &str, checkpoint_ns: &str, checkpoint_id: &str) -> bool {
        self.checkpoints
            .get(&(thread_id.to_string(), checkpoint_ns.to_string()))
            .is_some_and(|rows| rows.contains_key(checkpoint_id))
    }
}

/// In-memory checkpoint saver
#[derive(Clone)]
pub struct InMemoryCheckpointSaver {
    storage: Arc<RwLock<Storage>>,
    serializer: Arc<dyn SerializerProtocol>,
    write_back: bool,
    max_parent_depth: usize,
}

impl InMemoryCheckpointSaver {
    /// Create a new in-memory checkpoint saver
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(Storage::default())),
            serializer: Arc::new(JsonPlusSerializer::default()),
            write_back: true,
            max_parent_depth: DEFAULT_MAX_PARENT_DEPTH,
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn SerializerProtocol>) -> Self {
        self.serializer = serializer;
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

    /// Get the number of threads being tracked
    pub async fn thread_count(&self) -> usize {
        let storage = self.storage.read().await;
        let mut threads: Vec<&String> = storage
            .checkpoints
            .keys()
            .map(|(thread, _)| thread)
            .collect();
        threads.sort();
        threads.dedup();
        threads.len()
    }

    /// Get the total number of checkpoints across all threads
    pub async fn checkpoint_count(&self) -> usize {
        self.storage
            .read()
            .await
            .checkpoints
            .values()
            .map(|rows| rows.len())
            .sum()
    }

    /// Number of stored blobs, including explicit empties
    pub async fn blob_count(&self) -> usize {
        self.storage.read().await.blobs.len()
    }

    /// Clear everything (useful for testing)
    pub async fn clear(&self) {
        let mut storage = self.storage.write().await;
        *storage = Storage::default();
    }

    /// Store a blob in its raw stored form, e.g. to seed data written by an
    /// older version of the store
    pub async fn insert_raw_blob(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        channel: &str,
        version: &str,
        payload: TypedPayload,
    ) {
        let key = (
            thread_id.to_string(),
            checkpoint_ns.to_string(),
            channel.to_string(),
            version.to_string(),
        );
        self.storage.write().await.blobs.insert(key, payload);
    }

    /// Raw stored form of a blob
    pub async fn raw_blob(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        channel: &str,
        version: &str,
    ) -> Option<TypedPayload> {
        let key = (
            thread_id.to_string(),
            checkpoint_ns.to_string(),
            channel.to_string(),
            version.to_string(),
        );
        self.storage.read().await.blobs.get(&key).cloned()
    }

    async fn load_record(&self, row: StoredCheckpoint) -> Result<CheckpointRecord> {
        let checkpoint_row = row.parse_checkpoint()?;

        let (blobs, writes, parent_writes) = {
            let storage = self.storage.read().await;
            let mut blobs = HashMap::new();
            for (channel, version) in &checkpoint_row.channel_versions {
                let key = (
                    row.thread_id.clone(),
                    row.checkpoint_ns.clone(),
                    channel.clone(),
                    version.as_str().to_string(),
                );
                if let Some(payload) = storage.blobs.get(&key) {
                    blobs.insert(channel.clone(), payload.clone());
                }
            }
            let writes = storage.writes_for(&row.thread_id, &row.checkpoint_ns, &row.checkpoint_id);
            let parent_writes = row
                .sends_parent()
                .map(|parent| storage.writes_for(&row.thread_id, &row.checkpoint_ns, parent))
                .unwrap_or_default();
            (blobs, writes, parent_writes)
        };

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
                failures = assembled.record.decode_failures.len(),
                "Checkpoint read with undecodable values"
            );
        }

        if self.write_back && !assembled.upgrades.is_empty() {
            self.write_back(&thread_id, &checkpoint_ns, assembled.upgrades).await;
        }

        Ok(assembled.record)
    }

    async fn write_back(&self, thread_id: &str, checkpoint_ns: &str, upgrades: Upgrades) {
        let mut storage = self.storage.write().await;
        let mut written = 0;

        for blob in upgrades.blobs {
            let key = (
                thread_id.to_string(),
                checkpoint_ns.to_string(),
                blob.channel,
                blob.version,
            );
            if let Some(stored) = storage.blobs.get_mut(&key) {
                *stored = blob.upgraded;
                written += 1;
            }
        }

        for write in upgrades.writes {
            let key = (thread_id.to_string(), checkpoint_ns.to_string(), write.checkpoint_id);
            if let Some((_, stored)) = storage
                .writes
                .get_mut(&key)
                .and_then(|writes| writes.get_mut(&(write.task_id, write.idx)))
            {
                // a newer write replaced it in the meantime
                if *stored == write.original {
                    *stored = write.upgraded;
                    written += 1;
                }
            }
        }

        debug!(thread_id = %thread_id, written, "Migrated rows written back");
    }
}

impl Default for InMemoryCheckpointSaver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryCheckpointSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCheckpointSaver")
            .field("write_back", &self.write_back)
            .field("max_parent_depth", &self.max_parent_depth)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    #[instrument(
        skip(self, checkpoint, metadata, new_versions),
        fields(thread_id = %key.thread_id),
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

        let row = StoredCheckpoint {
            thread_id: key.thread_id.clone(),
            checkpoint_ns: key.checkpoint_ns.clone(),
            checkpoint_id: checkpoint.id.clone(),
            parent_id: key.checkpoint_id.clone(),
            checkpoint: serde_json::to_string(&checkpoint.to_row())?,
            metadata: serde_json::to_string(&metadata)?,
        };

        let mut blobs = Vec::with_capacity(new_versions.len());
        for (channel, version) in &new_versions {
            let payload = self.serializer.dumps_typed(checkpoint.channel_values.get(channel))?;
            blobs.push((channel.clone(), version.as_str().to_string(), payload));
        }
        let referenced = referenced_versions(&checkpoint, &new_versions);

        let mut storage = self.storage.write().await;

        if let Some(parent_id) = &key.checkpoint_id {
            if !storage.has_checkpoint(&key.thread_id, &key.checkpoint_ns, parent_id) {
                return Err(CheckpointError::Invalid(format!(
                    "parent checkpoint {} does not exist in thread {} namespace '{}'",
                    parent_id, key.thread_id, key.checkpoint_ns
                )));
            }
        }
        for (channel, version) in &referenced {
            let blob_key = (
                key.thread_id.clone(),
                key.checkpoint_ns.clone(),
                channel.clone(),
                version.as_str().to_string(),
            );
            if !storage.blobs.contains_key(&blob_key) {
                return Err(CheckpointError::Invalid(format!(
                    "channel '{}' references version {} which has no stored value",
                    channel, version
                )));
            }
        }

        for (channel, version, payload) in blobs {
            storage
                .blobs
                .entry((key.thread_id.clone(), key.checkpoint_ns.clone(), channel, version))
                .or_insert(payload);
        }
        storage
            .checkpoints
            .entry((key.thread_id.clone(), key.checkpoint_ns.clone()))
            .or_default()
            .insert(checkpoint.id.clone(), row);

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
            .as_ref()
            .ok_or_else(|| CheckpointError::Invalid("checkpoint_id is required".to_string()))?;

        if writes.is_empty() {
            return Ok(());
        }

        let mut payloads = Vec::with_capacity(writes.len());
        for (channel, value) in &writes {
            payloads.push((channel.clone(), self.serializer.dumps_typed(Some(value))?));
        }

        let mut storage = self.storage.write().await;
        if !storage.has_checkpoint(&key.thread_id, &key.checkpoint_ns, checkpoint_id) {
            return Err(CheckpointError::NotFound(checkpoint_id.clone()));
        }

        let log = storage
            .writes
            .entry((key.thread_id.clone(), key.checkpoint_ns.clone(), checkpoint_id.clone()))
            .or_default();
        for (idx, (channel, payload)) in payloads.into_iter().enumerate() {
            let write_key = (task_id.to_string(), idx as i64);
            if is_overwritable(&channel) {
                log.insert(write_key, (channel, payload));
            } else {
                log.entry(write_key).or_insert((channel, payload));
            }
        }

        Ok(())
    }

    async fn get_tuple(&self, key: &ThreadKey) -> Result<Option<CheckpointRecord>> {
        let row = {
            let storage = self.storage.read().await;
            storage
                .checkpoints
                .get(&(key.thread_id.clone(), key.checkpoint_ns.clone()))
                .and_then(|rows| match &key.checkpoint_id {
                    Some(checkpoint_id) => rows.get(checkpoint_id),
                    None => rows.values().next_back(),
                })
                .cloned()
        };

        match row {
            Some(row) => Ok(Some(self.load_record(row).await?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        filter: &ListFilter,
        before: Option<&ThreadKey>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let before_id = before.and_then(|key| key.checkpoint_id.as_deref());

        let mut rows: Vec<StoredCheckpoint> = {
            let storage = self.storage.read().await;
            storage
                .checkpoints
                .values()
                .flat_map(|rows| rows.values())
                .filter(|row| row.matches(filter, before_id))
                .cloned()
                .collect()
        };
        rows.sort_by(|a, b| b.checkpoint_id.cmp(&a.checkpoint_id));
        rows.truncate(limit.unwrap_or(usize::MAX));

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(self.load_record(row).await);
        }

        Ok(Box::pin(stream::iter(results)))
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.checkpoints.retain(|(thread, _), _| thread != thread_id);
        storage.blobs.retain(|(thread, _, _, _), _| thread != thread_id);
        storage.writes.retain(|(thread, _, _), _| thread != thread_id);
        Ok(())
    }

    fn max_parent_depth(&self) -> usize {
        self.max_parent_depth
    }
}
