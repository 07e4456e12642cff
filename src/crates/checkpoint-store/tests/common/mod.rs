//! Common test utilities and setup

#![allow(dead_code)]

use checkpoint_store::{
    ChannelVersions, Checkpoint, CheckpointMetadata, CheckpointSaver, CheckpointSource, Database,
    SqliteCheckpointSaver, StateValue, ThreadKey, VersionGenerator,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static TEST_DB_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Route store logs to the test output; `RUST_LOG=checkpoint_store=debug` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a saver on a fresh database file with a unique name
pub async fn setup_test_saver() -> (TempDir, SqliteCheckpointSaver) {
    init_tracing();
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let db_path = temp_dir.path().join(format!("test_{}.db", counter));

    let db = Database::new(&db_path)
        .await
        .expect("Failed to create test database");
    let saver = SqliteCheckpointSaver::new(db)
        .await
        .expect("Failed to create saver");

    (temp_dir, saver)
}

/// Next checkpoint of `base` with `updates` applied
pub fn next_checkpoint(
    base: &Checkpoint,
    updates: Vec<(&str, Option<StateValue>)>,
) -> (Checkpoint, ChannelVersions) {
    let mut checkpoint = base.successor();
    let new_versions = checkpoint
        .apply_updates(
            updates.into_iter().map(|(channel, value)| (channel.to_string(), value)),
            &VersionGenerator::new(),
        )
        .unwrap();
    (checkpoint, new_versions)
}

/// Store the next checkpoint after `base` under `parent`
pub async fn put_step<S: CheckpointSaver + ?Sized>(
    saver: &S,
    parent: &ThreadKey,
    base: &Checkpoint,
    updates: Vec<(&str, Option<StateValue>)>,
    step: i32,
) -> (ThreadKey, Checkpoint) {
    let (checkpoint, new_versions) = next_checkpoint(base, updates);
    let metadata = CheckpointMetadata::new()
        .with_source(CheckpointSource::Loop)
        .with_step(step);
    let key = saver
        .put(parent, checkpoint.clone(), metadata, new_versions)
        .await
        .expect("put failed");
    (key, checkpoint)
}
