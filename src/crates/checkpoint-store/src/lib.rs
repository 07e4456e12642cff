//! # checkpoint-store - Versioned State Persistence for Graph Execution
//!
//! **Durable, migrating checkpoint storage** for a superstep-based execution
//! engine. After each step the engine persists a [`Checkpoint`]; tasks record
//! their intermediate outputs as pending writes; on resume the engine loads the
//! latest (or any earlier) checkpoint and continues from there.
//!
//! ## Core Concepts
//!
//! ### 1. Threads, namespaces and checkpoints
//!
//! A [`ThreadKey`] addresses a thread, a namespace inside it and optionally a
//! checkpoint. Checkpoints form a parent-linked DAG per `(thread, namespace)`;
//! IDs are UUIDv7, so lexicographic order is creation order.
//!
//! ### 2. Channel blobs
//!
//! Channel values are stored once per `(channel, version)` and shared between
//! every checkpoint referencing that version. Only channels listed in
//! `new_versions` are written by a `put`; unchanged channels keep pointing at
//! their existing blob.
//!
//! ### 3. Pending writes and sends
//!
//! [`CheckpointSaver::put_writes`] records task outputs against a checkpoint.
//! Writes to control channels (`__error__`, `__interrupt__`, ...) replace
//! earlier ones; all others are first-write-wins so replays are harmless.
//! Writes on the `__pregel_tasks` channel of a parent surface as the child's
//! pending sends.
//!
//! ### 4. Versioned values
//!
//! Every value is stored inside an [`Envelope`] carrying its type name and
//! schema version. Older payloads are upgraded on read by the
//! [`MigrationEngine`] and, when the upgrade is complete, written back.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use checkpoint_store::{
//!     Checkpoint, CheckpointMetadata, CheckpointSaver, SqliteCheckpointSaver, StateValue,
//!     StoreConfig, ThreadKey, VersionGenerator,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let saver = SqliteCheckpointSaver::from_config(&StoreConfig::with_url("sqlite:checkpoints.db")).await?;
//!
//!     let mut checkpoint = Checkpoint::empty();
//!     let new_versions = checkpoint.apply_updates(
//!         vec![("status".to_string(), Some(StateValue::from("active")))],
//!         &VersionGenerator::new(),
//!     )?;
//!     let key = saver
//!         .put(&ThreadKey::new("thread-123"), checkpoint, CheckpointMetadata::new(), new_versions)
//!         .await?;
//!
//!     if let Some(record) = saver.get_tuple(&key).await? {
//!         println!("Restored {} (migrated: {})", record.checkpoint.id, record.was_migrated());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 CheckpointSaver trait                   │
//! │  put · put_writes · get_tuple · list · delete_thread    │
//! └────────────────────┬────────────────────────────────────┘
//!          ┌───────────┴────────────┐
//!          ▼                        ▼
//!  ┌──────────────────┐    ┌──────────────────┐
//!  │ SqliteCheckpoint │    │ InMemoryCheckpoint│
//!  │      Saver       │    │      Saver        │
//!  └────────┬─────────┘    └────────┬──────────┘
//!           └───────────┬───────────┘
//!                       ▼
//!        record assembly · serializer · migrations
//! ```
//!
//! ## Module Organization
//!
//! - [`checkpoint`] - [`Checkpoint`], [`ThreadKey`], [`CheckpointMetadata`], [`CheckpointRecord`]
//! - [`traits`] - [`CheckpointSaver`] and [`CheckpointStream`]
//! - [`sqlite`] / [`memory`] - storage backends
//! - [`serializer`] / [`value`] / [`migration`] - value encoding and schema upgrades
//! - [`version`] - monotonic channel versions
//! - [`config`] / [`db`] / [`retry`] - connection setup and conflict handling
//! - [`error`] - [`CheckpointError`] and [`DecodeError`]

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod error;
mod loader;
pub mod memory;
pub mod migration;
pub mod retry;
pub mod serializer;
pub mod sqlite;
pub mod traits;
pub mod value;
pub mod version;

// Re-export main types
pub use checkpoint::{
    new_checkpoint_id, ChannelVersions, Checkpoint, CheckpointId, CheckpointMetadata,
    CheckpointRecord, CheckpointSource, ListFilter, PendingWrite, ThreadKey, TASKS,
};
pub use config::{ConfigLoader, DatabaseConfig, MigrationConfig, StoreConfig};
pub use db::Database;
pub use error::{CheckpointError, DecodeError, MigrationStepError, Result};
pub use memory::InMemoryCheckpointSaver;
pub use migration::{FnMigration, Migration, MigrationEngine};
pub use retry::{with_retry, RetryConfig};
pub use serializer::{Envelope, JsonPlusSerializer, SerializerProtocol, TypedPayload};
pub use sqlite::SqliteCheckpointSaver;
pub use traits::{CheckpointSaver, CheckpointStream};
pub use value::{StateValue, Tagged, TaggedObject, TypeRegistry};
pub use version::{ChannelVersion, VersionGenerator};
