//! Integration tests for concurrent writers sharing one store

mod common;

use checkpoint_store::{
    Checkpoint, CheckpointMetadata, CheckpointSaver, ListFilter, StateValue, ThreadKey,
    VersionGenerator,
};
use common::{next_checkpoint, put_step, setup_test_saver};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn test_concurrent_branches_from_one_parent() {
    let (_dir, saver) = setup_test_saver().await;
    let saver = Arc::new(saver);
    let (root_key, root) = put_step(
        saver.as_ref(),
        &ThreadKey::new("t"),
        &Checkpoint::empty(),
        vec![("x", Some(StateValue::Int(0)))],
        0,
    )
    .await;

    let mut handles = vec![];
    for i in 0..8i64 {
        let saver = saver.clone();
        let root_key = root_key.clone();
        let root = root.clone();
        handles.push(tokio::spawn(async move {
            let (checkpoint, new_versions) = next_checkpoint(
                &root,
                vec![("x", Some(StateValue::Int(i + 1)))],
            );
            let key = saver
                .put(&root_key, checkpoint, CheckpointMetadata::new().with_step(1), new_versions)
                .await
                .unwrap();
            (key, i + 1)
        }));
    }

    let results: Vec<_> = futures::future::join_all(handles).await;
    for result in results {
        let (key, expected) = result.unwrap();
        let record = saver.get_tuple(&key).await.unwrap().unwrap();
        assert_eq!(record.value("x"), Some(&StateValue::Int(expected)));
        assert_eq!(record.parent_key, Some(root_key.clone()));
    }

    let all: Vec<_> = saver
        .list(&ListFilter::new().with_thread_id("t"), None, None)
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(all.len(), 9);
    assert!(all.iter().all(|r| r.is_ok()));
}

#[tokio::test]
async fn test_concurrent_put_of_same_checkpoint() {
    let (_dir, saver) = setup_test_saver().await;
    let saver = Arc::new(saver);
    let (checkpoint, new_versions) = next_checkpoint(
        &Checkpoint::empty(),
        vec![("x", Some("same".into()))],
    );

    let mut handles = vec![];
    for _ in 0..4 {
        let saver = saver.clone();
        let checkpoint = checkpoint.clone();
        let new_versions = new_versions.clone();
        handles.push(tokio::spawn(async move {
            saver
                .put(&ThreadKey::new("t"), checkpoint, CheckpointMetadata::new(), new_versions)
                .await
        }));
    }

    for result in futures::future::join_all(handles).await {
        assert!(result.unwrap().is_ok());
    }

    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM checkpoints")
        .fetch_one(saver.database().pool())
        .await
        .unwrap();
    assert_eq!(n, 1);
}

#[tokio::test]
async fn test_concurrent_writes_from_many_tasks() {
    let (_dir, saver) = setup_test_saver().await;
    let saver = Arc::new(saver);
    let (key, _) = put_step(
        saver.as_ref(),
        &ThreadKey::new("t"),
        &Checkpoint::empty(),
        vec![],
        0,
    )
    .await;

    let mut handles = vec![];
    for task in 0..6 {
        let saver = saver.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            let writes = (0..3)
                .map(|i| ("messages".to_string(), StateValue::from(format!("{}-{}", task, i))))
                .collect();
            saver.put_writes(&key, writes, &format!("task-{}", task)).await
        }));
    }
    for result in futures::future::join_all(handles).await {
        assert!(result.unwrap().is_ok());
    }

    let record = saver.get_tuple(&key).await.unwrap().unwrap();
    assert_eq!(record.pending_writes.len(), 18);
    let tasks: HashSet<&str> = record.pending_writes.iter().map(|w| w.task_id.as_str()).collect();
    assert_eq!(tasks.len(), 6);
}

#[tokio::test]
async fn test_concurrent_versions_never_collide() {
    let generator = VersionGenerator::new();
    let base = generator.next(None).unwrap();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let base = base.clone();
            tokio::spawn(async move { VersionGenerator::new().next(Some(&base)).unwrap() })
        })
        .collect();

    let mut seen = HashSet::new();
    for result in futures::future::join_all(handles).await {
        let version = result.unwrap();
        assert!(version > base);
        assert_eq!(version.counter(), base.counter() + 1);
        assert!(seen.insert(version));
    }
}
