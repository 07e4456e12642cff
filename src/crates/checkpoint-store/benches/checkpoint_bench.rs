use checkpoint_store::{
    Checkpoint, CheckpointMetadata, CheckpointSaver, InMemoryCheckpointSaver, ListFilter,
    SqliteCheckpointSaver, StateValue, StoreConfig, ThreadKey, VersionGenerator,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::StreamExt;

fn step(base: &Checkpoint, value: i64) -> (Checkpoint, checkpoint_store::ChannelVersions) {
    let mut checkpoint = base.successor();
    let messages = StateValue::from(vec![StateValue::from("hello"); 16]);
    let new_versions = checkpoint
        .apply_updates(
            vec![
                ("counter".to_string(), Some(StateValue::Int(value))),
                ("messages".to_string(), Some(messages)),
            ],
            &VersionGenerator::new(),
        )
        .unwrap();
    (checkpoint, new_versions)
}

async fn sqlite_saver() -> SqliteCheckpointSaver {
    SqliteCheckpointSaver::from_config(&StoreConfig::with_url("sqlite::memory:"))
        .await
        .unwrap()
}

fn checkpoint_save_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("memory: checkpoint save", |b| {
        b.to_async(&runtime).iter(|| async {
            let saver = InMemoryCheckpointSaver::new();
            let (checkpoint, new_versions) = step(&Checkpoint::empty(), 1);
            saver
                .put(
                    &ThreadKey::new("bench-thread"),
                    black_box(checkpoint),
                    CheckpointMetadata::new(),
                    new_versions,
                )
                .await
                .unwrap();
        });
    });

    let saver = runtime.block_on(sqlite_saver());
    c.bench_function("sqlite: checkpoint save", |b| {
        b.to_async(&runtime).iter(|| async {
            let (checkpoint, new_versions) = step(&Checkpoint::empty(), 1);
            saver
                .put(
                    &ThreadKey::new("bench-thread"),
                    black_box(checkpoint),
                    CheckpointMetadata::new(),
                    new_versions,
                )
                .await
                .unwrap();
        });
    });
}

fn checkpoint_load_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let (saver, key) = runtime.block_on(async {
        let saver = sqlite_saver().await;
        let (checkpoint, new_versions) = step(&Checkpoint::empty(), 1);
        let key = saver
            .put(
                &ThreadKey::new("bench-thread"),
                checkpoint,
                CheckpointMetadata::new(),
                new_versions,
            )
            .await
            .unwrap();
        (saver, key)
    });

    c.bench_function("sqlite: checkpoint load", |b| {
        b.to_async(&runtime).iter(|| async {
            saver.get_tuple(black_box(&key)).await.unwrap();
        });
    });
}

fn checkpoint_list_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let saver = runtime.block_on(async {
        let saver = sqlite_saver().await;
        let mut key = ThreadKey::new("bench-thread");
        let mut base = Checkpoint::empty();
        for i in 0..50 {
            let (checkpoint, new_versions) = step(&base, i);
            key = saver
                .put(
                    &key,
                    checkpoint.clone(),
                    CheckpointMetadata::new().with_step(i as i32),
                    new_versions,
                )
                .await
                .unwrap();
            base = checkpoint;
        }
        saver
    });

    c.bench_function("sqlite: list 50 checkpoints", |b| {
        b.to_async(&runtime).iter(|| async {
            let records: Vec<_> = saver
                .list(&ListFilter::new().with_thread_id("bench-thread"), None, None)
                .await
                .unwrap()
                .collect()
                .await;
            black_box(records);
        });
    });
}

criterion_group!(
    benches,
    checkpoint_save_benchmark,
    checkpoint_load_benchmark,
    checkpoint_list_benchmark,
);
criterion_main!(benches);
