//! Storage backend trait
//!
//! [`CheckpointSaver`] is the surface the execution engine talks to. Two
//! implementations ship with this crate:
//!
//! - [`SqliteCheckpointSaver`](crate::sqlite::SqliteCheckpointSaver) - durable, transactional
//! - [`InMemoryCheckpointSaver`](crate::memory::InMemoryCheckpointSaver) - same semantics, no persistence
//!
//! # Call pattern
//!
//! ```text
//! 1. engine loads state        get_tuple(key)            latest or by id
//! 2. tasks run                 put_writes(key, ..)       scoped to the loaded checkpoint
//! 3. step completes            apply_updates(..)         fresh versions for changed channels
//! 4. checkpoint persisted      put(key, cp, md, new)     key.checkpoint_id becomes the parent
//! ```
//!
//! # Guarantees
//!
//! - `put` is an upsert keyed by `(thread_id, checkpoint_ns, id)`: retrying it
//!   with the same checkpoint is safe.
//! - `put` and `put_writes` each commit atomically. A reader sees the state
//!   before or after, never a partial checkpoint.
//! - Reads never fail on missing data. An unknown thread yields `None` or an
//!   empty stream; an undecodable value is reported in
//!   [`CheckpointRecord::decode_failures`] while its siblings are returned.
//!
//! # Example
//!
//! ```rust,no_run
//! use checkpoint_store::{
//!     Checkpoint, CheckpointMetadata, CheckpointSaver, InMemoryCheckpointSaver, StateValue,
//!     ThreadKey, VersionGenerator,
//! };
//!
//! # async fn run() -> checkpoint_store::Result<()> {
//! let saver = InMemoryCheckpointSaver::new();
//! let generator = VersionGenerator::new();
//!
//! let mut checkpoint = Checkpoint::empty();
//! let new_versions = checkpoint.apply_updates(
//!     vec![("x".to_string(), Some(StateValue::from("1")))],
//!     &generator,
//! )?;
//! let key = saver
//!     .put(&ThreadKey::new("thread-1"), checkpoint, CheckpointMetadata::new(), new_versions)
//!     .await?;
//!
//! let record = saver.get_tuple(&key).await?.expect("just written");
//! assert_eq!(record.value("x"), Some(&StateValue::from("1")));
//! # Ok(())
//! # }
//! ```

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointMetadata, CheckpointRecord, ListFilter, ThreadKey,
    },
    error::{CheckpointError, DecodeError, Result},
    value::StateValue,
    version::{ChannelVersion, VersionGenerator},
};
use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::HashSet;
use std::pin::Pin;

/// Default bound on parent-chain walks
pub const DEFAULT_MAX_PARENT_DEPTH: usize = 1000;

/// Type alias for async stream of checkpoint records
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<CheckpointRecord>> + Send + 'static>>;

/// Core trait for checkpoint storage backends
///
/// Implementations must be thread-safe (`Send + Sync`); several engine workers
/// share one saver and rely on the backend's transactions for consistency.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Store a checkpoint.
    ///
    /// `key.checkpoint_id`, when present, is recorded as the parent. Every
    /// channel in `new_versions` gets a blob row at its new version; a channel
    /// without a value in `checkpoint.channel_values` is stored as explicitly
    /// empty. Channels not in `new_versions` must already have a blob at the
    /// version the checkpoint references.
    ///
    /// Returns the key of the stored checkpoint.
    async fn put(
        &self,
        key: &ThreadKey,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<ThreadKey>;

    /// Store writes produced by `task_id` against the checkpoint in `key`.
    ///
    /// Each write is keyed by its 0-based position in `writes`. Re-submitting a
    /// write replaces it only for control channels
    /// ([`OVERWRITABLE_CHANNELS`](crate::checkpoint::OVERWRITABLE_CHANNELS));
    /// other channels keep the first value. An empty batch does nothing.
    async fn put_writes(
        &self,
        key: &ThreadKey,
        writes: Vec<(String, StateValue)>,
        task_id: &str,
    ) -> Result<()>;

    /// Retrieve a checkpoint with its metadata, parent key and pending writes.
    ///
    /// Without `key.checkpoint_id` the newest checkpoint of the thread and
    /// namespace is returned. `Ok(None)` means nothing is stored there.
    async fn get_tuple(&self, key: &ThreadKey) -> Result<Option<CheckpointRecord>>;

    /// Fetch just the checkpoint
    async fn get(&self, key: &ThreadKey) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(key).await?.map(|record| record.checkpoint))
    }

    /// Stream checkpoints matching `filter`, newest id first.
    ///
    /// `before` restricts results to ids strictly older than its checkpoint id.
    async fn list(
        &self,
        filter: &ListFilter,
        before: Option<&ThreadKey>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream>;

    /// Delete every checkpoint, blob and write of a thread
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    /// Upper bound on the number of checkpoints [`history`](Self::history) walks
    fn max_parent_depth(&self) -> usize {
        DEFAULT_MAX_PARENT_DEPTH
    }

    /// Next version token for a channel currently at `current`
    fn get_next_version(&self, current: Option<&ChannelVersion>) -> Result<ChannelVersion> {
        VersionGenerator::new().next(current)
    }

    /// Walk the parent chain starting at `key`, newest first.
    ///
    /// A chain that revisits a checkpoint or exceeds
    /// [`max_parent_depth`](Self::max_parent_depth) is reported as a decode
    /// error instead of looping.
    async fn history(&self, key: &ThreadKey) -> Result<Vec<CheckpointRecord>> {
        let max_depth = self.max_parent_depth();
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        let mut next = Some(key.clone());

        while let Some(current) = next.take() {
            let Some(record) = self.get_tuple(&current).await? else {
                break;
            };
            if !seen.insert(record.checkpoint.id.clone()) {
                return Err(CheckpointError::Decode(DecodeError::new(
                    "parent chain",
                    format!("cycle at checkpoint {}", record.checkpoint.id),
                )));
            }
            if records.len() >= max_depth {
                return Err(CheckpointError::Decode(DecodeError::new(
                    "parent chain",
                    format!("longer than {} checkpoints", max_depth),
                )));
            }
            next = record.parent_key.clone();
            records.push(record);
        }

        Ok(records)
    }
}
