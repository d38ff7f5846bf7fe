use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chatstate_core::{
    CheckpointMetadata, CheckpointSaver, CheckpointSource, CheckpointTuple, ExpiryMode,
    ExpirySweep, ListOptions, StoreConfig, StoreError, ThreadKey,
};
use chatstate_redis::{ExpiryEntry, RedisCheckpointSaver, RedisDatabase, RedisKeyLayout};
use fred::prelude::*;
use futures::TryStreamExt;
use serde_json::json;

fn redis_test_url() -> String {
    std::env::var("REDIS_TEST_URL")
        .expect("REDIS_TEST_URL must be set to run Redis integration tests")
}

fn unique_prefix(prefix: &str) -> String {
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time should move forward")
        .as_nanos();
    format!("{prefix}-{nonce}")
}

fn test_config(prefix: &str, ttl: Duration, mode: ExpiryMode) -> StoreConfig {
    StoreConfig::builder()
        .url(redis_test_url())
        .key_prefix(unique_prefix(prefix))
        .ttl(ttl)
        .expiry_mode(mode)
        .list_page_size(2)
        .build()
        .expect("test config should be valid")
}

async fn connect(prefix: &str, ttl: Duration, mode: ExpiryMode) -> RedisCheckpointSaver {
    RedisDatabase::connect(test_config(prefix, ttl, mode))
        .await
        .expect("redis should connect")
        .checkpoint_saver()
}

/// A saver plus a plain client and the key layout, for tampering with
/// stored keys directly.
async fn connect_raw(
    prefix: &str,
    ttl: Duration,
    mode: ExpiryMode,
) -> (RedisCheckpointSaver, RedisClient, RedisKeyLayout) {
    let config = test_config(prefix, ttl, mode);
    let client = RedisClient::new(
        RedisConfig::from_url(config.url()).expect("valid redis url"),
        None,
        None,
        None,
    );
    client.init().await.expect("redis should connect");
    let layout = RedisKeyLayout::new(&config);
    let saver = RedisDatabase::from_client(client.clone(), config).checkpoint_saver();
    (saver, client, layout)
}

async fn saver(prefix: &str) -> RedisCheckpointSaver {
    connect(prefix, Duration::from_secs(3600), ExpiryMode::Sliding).await
}

async fn collect(
    saver: &RedisCheckpointSaver,
    key: &ThreadKey,
    options: ListOptions,
) -> Vec<CheckpointTuple> {
    saver
        .list(key, options)
        .try_collect()
        .await
        .expect("list should stream")
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn put_and_get_tuple_roundtrip() {
    let saver = saver("redis-rt").await;
    let key = ThreadKey::new("user:42");
    let metadata = CheckpointMetadata::new(CheckpointSource::Input, 0).with("user", "tom");

    let stored = saver
        .put(&key, json!({"messages": ["hi"]}), metadata.clone())
        .await
        .expect("checkpoint should save");
    saver
        .put_writes(
            &stored,
            vec![("messages".to_string(), json!("partial"))],
            "task:a",
        )
        .await
        .expect("writes should save");

    let tuple = saver
        .get_tuple(&key)
        .await
        .expect("lookup should succeed")
        .expect("tuple should exist");

    assert_eq!(tuple.key, stored);
    assert_eq!(tuple.checkpoint, json!({"messages": ["hi"]}));
    assert_eq!(tuple.metadata, metadata);
    assert_eq!(tuple.pending_writes.len(), 1);
    assert_eq!(tuple.pending_writes[0].task_id, "task:a");
    assert!(tuple.parent_key.is_none());

    let pinned = saver.get_tuple(&stored).await.expect("lookup should succeed");
    assert_eq!(pinned, Some(tuple));
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn missing_thread_has_no_tuple() {
    let saver = saver("redis-miss").await;
    let key = ThreadKey::new("thread-does-not-exist");

    assert!(saver.get_tuple(&key).await.expect("lookup").is_none());
    assert!(saver.get_partition(&key).await.expect("lookup").is_none());
    assert!(collect(&saver, &key, ListOptions::new()).await.is_empty());
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn list_pages_newest_first_with_before_and_filter() {
    let saver = saver("redis-list").await;
    let key = ThreadKey::new("thread-1");

    let mut current = key.clone();
    let mut written = Vec::new();
    for step in 0..5 {
        let source = if step % 2 == 0 {
            CheckpointSource::Loop
        } else {
            CheckpointSource::Update
        };
        current = saver
            .put(&current, json!({ "step": step }), CheckpointMetadata::new(source, step))
            .await
            .expect("put");
        written.push(current.checkpoint_id.clone().expect("stored id"));
    }

    let all = collect(&saver, &key, ListOptions::new()).await;
    let ids: Vec<_> = all.iter().map(|t| t.checkpoint_id().to_string()).collect();
    let mut newest_first = written.clone();
    newest_first.reverse();
    assert_eq!(ids, newest_first);
    assert_eq!(all[0].parent_checkpoint_id(), Some(written[3].as_str()));

    let before = collect(&saver, &key, ListOptions::new().before(written[2].clone())).await;
    assert_eq!(before.len(), 2);
    assert_eq!(before[0].checkpoint_id(), written[1]);

    let loops = collect(&saver, &key, ListOptions::new().filter("source", "loop").limit(2)).await;
    let loop_ids: Vec<_> = loops.iter().map(CheckpointTuple::checkpoint_id).collect();
    assert_eq!(loop_ids, vec![written[4].as_str(), written[2].as_str()]);
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn delete_thread_clears_every_namespace() {
    let saver = saver("redis-del").await;
    let root = ThreadKey::new("thread-1");
    let child = root.clone().with_namespace("sub:graph");
    let other = ThreadKey::new("thread-2");

    saver.put(&root, json!("A"), CheckpointMetadata::default()).await.expect("put");
    saver.put(&child, json!("B"), CheckpointMetadata::default()).await.expect("put");
    saver.put(&other, json!("C"), CheckpointMetadata::default()).await.expect("put");

    saver.delete_thread("thread-1").await.expect("delete");

    assert!(saver.get_tuple(&root).await.expect("lookup").is_none());
    assert!(saver.get_tuple(&child).await.expect("lookup").is_none());
    assert!(collect(&saver, &child, ListOptions::new()).await.is_empty());
    assert!(saver.get_tuple(&other).await.expect("lookup").is_some());
    assert_eq!(saver.thread_ids().await.expect("threads"), vec!["thread-2".to_string()]);

    saver.delete_thread("thread-1").await.expect("deleting again is fine");
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn put_writes_on_unknown_checkpoint_is_rejected() {
    let saver = saver("redis-writes").await;
    let key = ThreadKey::new("t").at("00000000");

    let err = saver
        .put_writes(&key, vec![("a".to_string(), json!(1))], "task")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn sliding_ttl_restamps_partition_but_not_checkpoints() {
    let saver = saver("redis-ttl").await;
    let key = ThreadKey::new("t");

    let first = saver.put(&key, json!(1), CheckpointMetadata::default()).await.expect("put");
    let first_tuple = saver.get_tuple(&first).await.expect("lookup").expect("exists");
    let partition = saver.get_partition(&key).await.expect("lookup").expect("exists");

    saver.put(&first, json!(2), CheckpointMetadata::default()).await.expect("put");

    let refreshed = saver.get_partition(&key).await.expect("lookup").expect("exists");
    let unchanged = saver.get_tuple(&first).await.expect("lookup").expect("exists");
    assert!(refreshed.expire_at >= partition.expire_at);
    assert_eq!(unchanged.expire_at, first_tuple.expire_at);
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn sweep_removes_expired_partitions_only() {
    let saver = connect("redis-sweep", Duration::from_secs(60), ExpiryMode::Fixed).await;
    let key = ThreadKey::new("t");
    saver.put(&key, json!(1), CheckpointMetadata::default()).await.expect("put");

    let early = saver
        .sweep_expired(chrono::Utc::now())
        .await
        .expect("sweep should succeed");
    assert!(early.is_empty());
    assert!(saver.get_tuple(&key).await.expect("lookup").is_some());

    let later = chrono::Utc::now() + chrono::Duration::seconds(120);
    let report = saver.sweep_expired(later).await.expect("sweep should succeed");
    assert_eq!(report.partitions, 1);
    assert!(saver.get_tuple(&key).await.expect("lookup").is_none());
    assert!(saver.get_partition(&key).await.expect("lookup").is_none());
    assert!(saver.thread_ids().await.expect("threads").is_empty());

    let again = saver.sweep_expired(later).await.expect("sweep should succeed");
    assert!(again.is_empty());
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn sweep_keeps_threads_with_live_namespaces() {
    let saver = connect("redis-sweep-ns", Duration::from_secs(60), ExpiryMode::Fixed).await;
    let root = ThreadKey::new("t");
    let child = root.clone().with_namespace("sub");
    saver.put(&root, json!(1), CheckpointMetadata::default()).await.expect("put");
    let partition = saver.get_partition(&root).await.expect("lookup").expect("exists");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    saver.put(&child, json!(2), CheckpointMetadata::default()).await.expect("put");

    let cutoff = partition.expire_at + chrono::Duration::milliseconds(500);
    let report = saver.sweep_expired(cutoff).await.expect("sweep should succeed");
    assert_eq!(report.partitions, 1);
    assert!(saver.get_tuple(&root).await.expect("lookup").is_none());
    assert!(saver.get_tuple(&child).await.expect("lookup").is_some());
    assert_eq!(saver.thread_ids().await.expect("threads"), vec!["t".to_string()]);
    assert_eq!(saver.namespaces("t").await.expect("namespaces"), vec!["sub".to_string()]);
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn put_is_indexed_before_its_records_land() {
    let (saver, client, layout) =
        connect_raw("redis-index", Duration::from_secs(60), ExpiryMode::Fixed).await;
    let key = ThreadKey::new("t");
    let stored = saver.put(&key, json!(1), CheckpointMetadata::default()).await.expect("put");

    let members = [
        ExpiryEntry::Partition {
            thread_id: "t".to_string(),
            checkpoint_ns: String::new(),
        },
        ExpiryEntry::Checkpoint {
            thread_id: "t".to_string(),
            checkpoint_ns: String::new(),
            checkpoint_id: stored.checkpoint_id.clone().expect("stored id"),
        },
    ];
    for entry in &members {
        let score: Option<f64> = client
            .zscore(layout.expiry(), entry.member())
            .await
            .expect("zscore");
        assert!(score.is_some(), "{} should be in the expiry index", entry.member());
    }

    // A put whose script fails still leaves index entries behind.
    let ghost = ThreadKey::new("ghost");
    let ghost_keys = layout.partition(&ghost);
    client
        .set::<(), _, _>(ghost_keys.partition.clone(), "not a hash", None, None, false)
        .await
        .expect("set");
    assert!(saver.put(&ghost, json!(1), CheckpointMetadata::default()).await.is_err());
    client.del::<i64, _>(ghost_keys.partition.clone()).await.expect("del");
    let threads = saver.thread_ids().await.expect("threads");
    assert!(threads.contains(&"ghost".to_string()));

    let later = chrono::Utc::now() + chrono::Duration::seconds(120);
    let report = saver.sweep_expired(later).await.expect("sweep should succeed");
    assert_eq!(report.partitions, 1);
    assert!(saver.thread_ids().await.expect("threads").is_empty());
    let left: i64 = client.zcard(layout.expiry()).await.expect("zcard");
    assert_eq!(left, 0);
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn sliding_sweep_drops_old_checkpoints_and_keeps_the_partition() {
    let saver = connect("redis-sliding", Duration::from_secs(60), ExpiryMode::Sliding).await;
    let key = ThreadKey::new("t");
    let first = saver.put(&key, json!(1), CheckpointMetadata::default()).await.expect("put");
    let first_tuple = saver.get_tuple(&first).await.expect("lookup").expect("exists");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let second = saver.put(&first, json!(2), CheckpointMetadata::default()).await.expect("put");

    let cutoff = first_tuple.expire_at + chrono::Duration::milliseconds(500);
    let report = saver.sweep_expired(cutoff).await.expect("sweep should succeed");
    assert_eq!(report.checkpoints, 1);
    assert_eq!(report.partitions, 0);

    let latest = saver.get_tuple(&key).await.expect("lookup").expect("exists");
    assert_eq!(latest.key, second);
    let remaining = collect(&saver, &key, ListOptions::new()).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(saver.thread_ids().await.expect("threads"), vec!["t".to_string()]);
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn partition_latest_id_skips_a_missing_checkpoint() {
    let (saver, client, layout) =
        connect_raw("redis-latest", Duration::from_secs(3600), ExpiryMode::Sliding).await;
    let key = ThreadKey::new("t");
    let first = saver.put(&key, json!("A"), CheckpointMetadata::default()).await.expect("put");
    let second = saver.put(&first, json!("B"), CheckpointMetadata::default()).await.expect("put");

    let keys = layout.partition(&key);
    let second_id = second.checkpoint_id.clone().expect("stored id");
    client.del::<i64, _>(keys.checkpoint(&second_id)).await.expect("del");
    client.zrem::<i64, _, _>(keys.index.clone(), second_id).await.expect("zrem");

    let partition = saver.get_partition(&key).await.expect("lookup").expect("exists");
    assert_eq!(partition.latest_checkpoint_id, first.checkpoint_id);
    let latest = saver.get_tuple(&key).await.expect("lookup").expect("exists");
    assert_eq!(latest.key, first);
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn namespaces_lists_every_partition_of_a_thread() {
    let saver = saver("redis-namespaces").await;
    let root = ThreadKey::new("thread-1");
    let child = root.clone().with_namespace("sub:graph");

    assert!(saver.namespaces("thread-1").await.expect("namespaces").is_empty());
    saver.put(&root, json!("A"), CheckpointMetadata::default()).await.expect("put");
    saver.put(&child, json!("B"), CheckpointMetadata::default()).await.expect("put");

    let mut namespaces = saver.namespaces("thread-1").await.expect("namespaces");
    namespaces.sort();
    assert_eq!(namespaces, vec![String::new(), "sub:graph".to_string()]);

    saver.delete_thread("thread-1").await.expect("delete");
    assert!(saver.namespaces("thread-1").await.expect("namespaces").is_empty());
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn pending_writes_overwrite_their_slot() {
    let saver = saver("redis-writes-slot").await;
    let key = ThreadKey::new("t");
    let stored = saver.put(&key, json!(1), CheckpointMetadata::default()).await.expect("put");

    let writes = |pairs: &[(&str, i64)]| -> Vec<(String, serde_json::Value)> {
        pairs
            .iter()
            .map(|(channel, value)| (channel.to_string(), json!(value)))
            .collect()
    };
    saver
        .put_writes(&stored, writes(&[("a", 1), ("b", 2)]), "task-2")
        .await
        .expect("writes");
    saver
        .put_writes(&stored, writes(&[("a", 10)]), "task-1")
        .await
        .expect("writes");
    saver
        .put_writes(&stored, writes(&[("a", 99)]), "task-2")
        .await
        .expect("rewriting a slot is fine");

    let tuple = saver.get_tuple(&stored).await.expect("lookup").expect("exists");
    let slots: Vec<_> = tuple
        .pending_writes
        .iter()
        .map(|write| (write.task_id.as_str(), write.index, write.value.clone()))
        .collect();
    assert_eq!(
        slots,
        vec![
            ("task-1", 0, json!(10)),
            ("task-2", 0, json!(99)),
            ("task-2", 1, json!(2)),
        ]
    );
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn deleted_thread_lists_nothing() {
    let saver = saver("redis-del-scenario").await;
    let key = ThreadKey::new("T1");
    let a = saver.put(&key, json!("A"), CheckpointMetadata::default()).await.expect("put");
    let b = saver.put(&a, json!("B"), CheckpointMetadata::default()).await.expect("put");

    let before: Vec<_> = collect(&saver, &key, ListOptions::new())
        .await
        .into_iter()
        .map(|tuple| tuple.key)
        .collect();
    assert_eq!(before, vec![b, a]);

    saver.delete_thread("T1").await.expect("delete");
    assert!(collect(&saver, &key, ListOptions::new()).await.is_empty());
    assert!(saver.get_tuple(&key).await.expect("lookup").is_none());
}

#[tokio::test]
#[ignore = "requires REDIS_TEST_URL"]
async fn metadata_shadowing_typed_fields_is_rejected() {
    let saver = saver("redis-metadata").await;
    let key = ThreadKey::new("t");
    let shadowed = CheckpointMetadata::new(CheckpointSource::Loop, 1).with("step", 5);

    let err = saver.put(&key, json!(1), shadowed).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert!(saver.get_partition(&key).await.expect("lookup").is_none());
    assert!(saver.thread_ids().await.expect("threads").is_empty());
}
