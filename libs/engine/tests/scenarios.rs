//! End-to-end runs of the engine against the in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use sink_api::TabularStore;
use storage_memory::MemoryStore;
use sync_engine::{EngineState, SyncEngine};

use common::{config, input, record, schema, state, state_line, users_schema};

#[tokio::test]
async fn three_records_then_state() {
    let store = Arc::new(MemoryStore::new());
    let mut engine = SyncEngine::new(store.clone(), config(50), Vec::new());

    let mut msgs = vec![users_schema()];
    for id in 1..=3 {
        msgs.push(record("users", json!({"id": id, "name": "a"})));
    }
    msgs.push(state(json!({"p": 1})));

    let summary = engine
        .run(&input(&msgs)[..], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(engine.state(), EngineState::Done);
    assert_eq!(summary.rows_written(), 3);
    assert_eq!(store.rows("users").await.len(), 3);
    let out = String::from_utf8(engine.into_output()).unwrap();
    assert_eq!(out, state_line(json!({"p": 1})));
}

#[tokio::test]
async fn schema_change_appends_column() {
    let store = Arc::new(MemoryStore::new());
    let mut engine = SyncEngine::new(store.clone(), config(50), Vec::new());

    let msgs = [
        schema("users", json!({"id": {"type": "integer"}})),
        record("users", json!({"id": 1})),
        schema("users", json!({"id": {"type": "integer"}, "email": {"type": "string"}})),
        record("users", json!({"id": 2, "email": "x"})),
    ];
    engine
        .run(&input(&msgs)[..], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.header("users").await, vec!["id".to_string(), "email".to_string()]);
    assert_eq!(
        store.rows("users").await,
        vec![vec![json!(1), Value::Null], vec![json!(2), json!("x")]]
    );
}

#[tokio::test]
async fn record_before_schema_halts_stream() {
    let store = Arc::new(MemoryStore::new());
    let mut engine = SyncEngine::new(store.clone(), config(50), Vec::new());

    let msgs = [
        record("users", json!({"id": 1})),
        users_schema(),
        record("users", json!({"id": 2})),
    ];
    let summary = engine
        .run(&input(&msgs)[..], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.total_rows().await, 0);
    assert_eq!(summary.halted_streams(), vec!["users"]);
    let reason = summary.streams["users"].halted.clone().unwrap();
    assert!(reason.starts_with("UnknownStream"), "{reason}");
    assert_eq!(summary.streams["users"].skipped_messages, 2);
    assert_eq!(summary.dropped_records, 2);
}

#[tokio::test]
async fn state_after_record_without_schema_is_withheld() {
    let store = Arc::new(MemoryStore::new());
    let mut engine = SyncEngine::new(store.clone(), config(50), Vec::new());

    let msgs = [record("users", json!({"id": 1})), state(json!({"bookmark": 1}))];
    let summary = engine
        .run(&input(&msgs)[..], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.total_rows().await, 0);
    assert_eq!(summary.checkpoints_emitted, 0);
    assert_eq!(summary.checkpoints_withheld, 1);
    assert!(engine.into_output().is_empty());
}

async fn user_batches(store: &MemoryStore) -> Vec<usize> {
    store.table("users").await.map(|t| t.append_batches).unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn batch_size_two_flushes_two_two_one() {
    let store = Arc::new(MemoryStore::new());
    let mut engine = SyncEngine::new(store.clone(), config(2), Vec::new());

    let (mut tx, rx) = tokio::io::duplex(64 * 1024);

    let driver = async {
        // Input stays open throughout: full batches are written while running.
        tx.write_all(&input(&[users_schema(), record("users", json!({"id": 1})), record("users", json!({"id": 2}))]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(user_batches(&store).await, vec![2]);

        tx.write_all(&input(&[record("users", json!({"id": 3})), record("users", json!({"id": 4}))]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(user_batches(&store).await, vec![2, 2]);

        tx.write_all(&input(&[record("users", json!({"id": 5}))])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(user_batches(&store).await, vec![2, 2]);

        // The remainder goes out only at end of input.
        drop(tx);
    };

    let (result, ()) = tokio::join!(engine.run(BufReader::new(rx), CancellationToken::new()), driver);
    result.unwrap();

    let table = store.table("users").await.unwrap();
    assert_eq!(table.append_batches, vec![2, 2, 1]);
    let ids: Vec<Value> = table.rows.iter().map(|r| r[0].clone()).collect();
    assert_eq!(ids, (1..=5).map(|i| json!(i)).collect::<Vec<_>>());
}

#[tokio::test]
async fn repeated_schema_writes_header_once() {
    let store = Arc::new(MemoryStore::new());
    let mut engine = SyncEngine::new(store.clone(), config(50), Vec::new());

    let msgs = [users_schema(), users_schema(), users_schema()];
    engine
        .run(&input(&msgs)[..], CancellationToken::new())
        .await
        .unwrap();

    let table = store.table("users").await.unwrap();
    assert_eq!(table.header, vec!["id".to_string(), "name".to_string()]);
    assert_eq!(table.header_writes, 1);
}

#[tokio::test]
async fn existing_remote_header_is_adopted() {
    let store = Arc::new(MemoryStore::new());
    let table = store.ensure_table("users").await.unwrap();
    store
        .ensure_header(&table, &["id".to_string(), "legacy".to_string()])
        .await
        .unwrap();

    let mut engine = SyncEngine::new(store.clone(), config(50), Vec::new());
    let msgs = [
        schema("users", json!({"id": {"type": "integer"}, "email": {"type": "string"}})),
        record("users", json!({"id": 1, "email": "x"})),
    ];
    engine
        .run(&input(&msgs)[..], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        store.header("users").await,
        vec!["id".to_string(), "legacy".to_string(), "email".to_string()]
    );
    assert_eq!(store.rows("users").await, vec![vec![json!(1), Value::Null, json!("x")]]);
}

#[tokio::test]
async fn nested_records_are_flattened() {
    let store = Arc::new(MemoryStore::new());
    let mut engine = SyncEngine::new(store.clone(), config(50), Vec::new());

    let msgs = [
        schema(
            "users",
            json!({
                "id": {"type": "integer"},
                "address": {"type": "object", "properties": {"city": {"type": "string"}}},
                "tags": {"type": "array", "items": {"type": "string"}}
            }),
        ),
        record("users", json!({"id": 1, "address": {"city": "Oslo"}, "tags": ["a"]})),
    ];
    engine
        .run(&input(&msgs)[..], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        store.header("users").await,
        vec!["id".to_string(), "address.city".to_string(), "tags".to_string()]
    );
    assert_eq!(
        store.rows("users").await,
        vec![vec![json!(1), json!("Oslo"), json!(["a"])]]
    );
}

#[tokio::test]
async fn invalid_record_halts_stream_but_not_others() {
    let store = Arc::new(MemoryStore::new());
    let mut engine = SyncEngine::new(store.clone(), config(50), Vec::new());

    let msgs = [
        users_schema(),
        schema("orders", json!({"id": {"type": "integer"}})),
        record("users", json!({"id": 1})),
        record("users", json!({"id": "two"})),
        record("orders", json!({"id": 10})),
        state(json!({"p": 2})),
    ];
    let summary = engine
        .run(&input(&msgs)[..], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.rows("users").await.len(), 1);
    assert_eq!(store.rows("orders").await.len(), 1);
    assert_eq!(summary.halted_streams(), vec!["users"]);
    assert!(summary.streams["users"].halted.as_deref().unwrap().starts_with("SchemaValidationError"));
    // Row "two" was never written: the STATE after it must not acknowledge it.
    assert_eq!(summary.dropped_records, 1);
    assert_eq!(summary.checkpoints_withheld, 1);
    assert!(engine.into_output().is_empty());
}

#[tokio::test]
async fn state_before_rejected_record_is_still_emitted() {
    let store = Arc::new(MemoryStore::new());
    let mut engine = SyncEngine::new(store.clone(), config(50), Vec::new());

    let msgs = [
        users_schema(),
        record("users", json!({"id": 1})),
        state(json!({"bookmark": 1})),
        record("users", json!({"id": "two"})),
        record("users", json!({"id": 3})),
        state(json!({"bookmark": 3})),
    ];
    let summary = engine
        .run(&input(&msgs)[..], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.rows("users").await, vec![vec![json!(1), Value::Null]]);
    assert_eq!(summary.dropped_records, 2);
    assert_eq!(summary.streams["users"].skipped_messages, 1);
    let out = String::from_utf8(engine.into_output()).unwrap();
    assert_eq!(out, state_line(json!({"bookmark": 1})));
}

#[tokio::test]
async fn non_utf8_line_is_skipped_without_failing_the_run() {
    let store = Arc::new(MemoryStore::new());
    let mut engine = SyncEngine::new(store.clone(), config(50), Vec::new());

    let mut bytes = input(&[users_schema(), record("users", json!({"id": 1}))]);
    bytes.extend_from_slice(b"{\"type\":\"RECORD\",\"stream\":\"users\",\"record\":{\"name\":\"\xff\"}}\n");
    bytes.extend(input(&[record("users", json!({"id": 2})), state(json!({"p": 2}))]));

    let summary = engine.run(&bytes[..], CancellationToken::new()).await.unwrap();

    assert_eq!(engine.state(), EngineState::Done);
    assert_eq!(summary.malformed_lines, 1);
    assert_eq!(store.rows("users").await.len(), 2);
    // The unreadable line may have been a record: no STATE after it.
    assert_eq!(summary.checkpoints_withheld, 1);
    assert!(engine.into_output().is_empty());
}

#[tokio::test]
async fn last_line_without_newline_is_read() {
    let store = Arc::new(MemoryStore::new());
    let mut engine = SyncEngine::new(store.clone(), config(50), Vec::new());

    let mut bytes = input(&[users_schema(), record("users", json!({"id": 1}))]);
    bytes.extend_from_slice(br#"{"type":"STATE","value":{"p":1}}"#);

    engine.run(&bytes[..], CancellationToken::new()).await.unwrap();

    let out = String::from_utf8(engine.into_output()).unwrap();
    assert_eq!(out, state_line(json!({"p": 1})));
}
