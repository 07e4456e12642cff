//! The same scenarios against both backends, through the trait only

mod common;

use checkpoint_store::checkpoint::SCHEDULED;
use checkpoint_store::{
    Checkpoint, CheckpointError, CheckpointSaver, Database, InMemoryCheckpointSaver,
    JsonPlusSerializer, ListFilter, MigrationEngine, SerializerProtocol, SqliteCheckpointSaver,
    StateValue, ThreadKey, TypeRegistry, TASKS,
};
use common::{put_step, setup_test_saver};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;

async fn backends() -> Vec<(&'static str, Box<dyn CheckpointSaver>, Option<tempfile::TempDir>)> {
    let registry = TypeRegistry::builder().register_opaque("Message").build();
    let serializer: Arc<dyn SerializerProtocol> =
        Arc::new(JsonPlusSerializer::new(registry, MigrationEngine::none()));

    let (dir, file_saver) = setup_test_saver().await;
    let memory_db = SqliteCheckpointSaver::new(Database::in_memory().await.unwrap())
        .await
        .unwrap();
    let file_saver: Box<dyn CheckpointSaver> =
        Box::new(file_saver.with_serializer(serializer.clone()));
    let memory_db: Box<dyn CheckpointSaver> =
        Box::new(memory_db.with_serializer(serializer.clone()));
    let in_memory: Box<dyn CheckpointSaver> =
        Box::new(InMemoryCheckpointSaver::new().with_serializer(serializer));
    vec![
        ("sqlite-file", file_saver, Some(dir)),
        ("sqlite-memory", memory_db, None),
        ("in-memory", in_memory, None),
    ]
}

async fn run_lifecycle(name: &str, saver: &dyn CheckpointSaver) {
    let root = ThreadKey::new("thread").with_namespace("sub");
    let message = StateValue::object(
        "Message",
        BTreeMap::from([("content".to_string(), StateValue::from("hi"))]),
    );

    let (key_a, a) = put_step(
        saver,
        &root,
        &Checkpoint::empty(),
        vec![
            ("messages", Some(StateValue::List(vec![]))),
            ("pair", Some(StateValue::tuple(vec![StateValue::Int(1), StateValue::from("b")]))),
        ],
        0,
    )
    .await;

    saver
        .put_writes(
            &key_a,
            vec![
                (TASKS.to_string(), message.clone()),
                (SCHEDULED.to_string(), StateValue::Bool(true)),
            ],
            "task-1",
        )
        .await
        .unwrap();

    let (key_b, _) = put_step(
        saver,
        &key_a,
        &a,
        vec![("messages", Some(StateValue::List(vec![message.clone()])))],
        1,
    )
    .await;

    let b = saver.get_tuple(&key_b).await.unwrap().unwrap();
    assert_eq!(b.value("messages"), Some(&StateValue::List(vec![message.clone()])), "{}", name);
    assert_eq!(
        b.value("pair"),
        Some(&StateValue::tuple(vec![StateValue::Int(1), StateValue::from("b")])),
        "{}",
        name
    );
    assert_eq!(b.pending_sends(), &[message], "{}", name);
    assert_eq!(b.parent_key, Some(key_a.clone()), "{}", name);
    assert!(b.decode_failures.is_empty(), "{}", name);

    let a = saver.get_tuple(&key_a).await.unwrap().unwrap();
    assert_eq!(a.value("messages"), Some(&StateValue::List(vec![])), "{}", name);
    assert_eq!(a.pending_writes.len(), 2, "{}", name);
    assert!(a.pending_sends().is_empty(), "{}", name);

    let listed: Vec<_> = saver
        .list(&ListFilter::for_key(&root), None, None)
        .await
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect()
        .await;
    assert_eq!(listed, vec![key_b.clone(), key_a.clone()], "{}", name);

    let history = saver.history(&key_b).await.unwrap();
    assert_eq!(history.len(), 2, "{}", name);

    // the root namespace of the same thread is untouched
    assert!(saver.get_tuple(&ThreadKey::new("thread")).await.unwrap().is_none(), "{}", name);

    saver.delete_thread("thread").await.unwrap();
    assert!(saver.get_tuple(&root).await.unwrap().is_none(), "{}", name);
}

async fn run_rejections(name: &str, saver: &dyn CheckpointSaver) {
    let err = saver
        .put(
            &ThreadKey::new(""),
            Checkpoint::empty(),
            Default::default(),
            Default::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::Invalid(_)), "{}", name);

    let checkpoint = Checkpoint::empty();
    let self_parent = ThreadKey::new("t").with_checkpoint_id(checkpoint.id.clone());
    let err = saver
        .put(&self_parent, checkpoint, Default::default(), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::Invalid(_)), "{}", name);

    let err = saver
        .put_writes(&ThreadKey::new("t"), vec![("x".to_string(), StateValue::Null)], "task")
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::Invalid(_)), "{}", name);
}

#[tokio::test]
async fn test_backends_agree_on_lifecycle() {
    for (name, saver, _dir) in backends().await {
        run_lifecycle(name, saver.as_ref()).await;
    }
}

#[tokio::test]
async fn test_backends_agree_on_rejections() {
    for (name, saver, _dir) in backends().await {
        run_rejections(name, saver.as_ref()).await;
    }
}
