#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::AsyncWrite;

use sink_api::{Row, StoreError, TableHandle, TabularStore};
use storage_memory::MemoryStore;
use sync_engine::{BufferPolicy, EngineConfig};

/// Engine config with tiny retry delays so failure tests stay fast.
pub fn config(batch_size: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.buffer = BufferPolicy { batch_size, ..BufferPolicy::default() };
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);
    config.retry.call_timeout = Duration::from_secs(5);
    config
}

/// Serialize protocol messages into newline-delimited input.
pub fn input(msgs: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for m in msgs {
        out.extend(serde_json::to_vec(m).expect("serializable message"));
        out.push(b'\n');
    }
    out
}

pub fn schema(stream: &str, properties: Value) -> Value {
    json!({"type": "SCHEMA", "stream": stream, "schema": {"properties": properties}, "key_properties": ["id"]})
}

pub fn users_schema() -> Value {
    schema("users", json!({"id": {"type": "integer"}, "name": {"type": "string"}}))
}

pub fn record(stream: &str, fields: Value) -> Value {
    json!({"type": "RECORD", "stream": stream, "record": fields})
}

pub fn state(value: Value) -> Value {
    json!({"type": "STATE", "value": value})
}

pub fn state_line(value: Value) -> String {
    format!("{}\n", json!({"type": "STATE", "value": value}))
}

// ═══════════════════════════════════════════════════════════════
//  CountingStore: MemoryStore + durable row counts per table
// ═══════════════════════════════════════════════════════════════

/// Rows confirmed appended, per table. Shared with `AuditWriter` so each
/// emitted checkpoint can be checked against what was durable at that moment.
pub type Durable = Arc<Mutex<BTreeMap<String, usize>>>;

pub struct CountingStore {
    pub inner: Arc<MemoryStore>,
    pub durable: Durable,
}

impl CountingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self { inner, durable: Arc::default() }
    }
}

impl TabularStore for CountingStore {
    fn ensure_table(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<TableHandle, StoreError>> + Send + '_>> {
        self.inner.ensure_table(name)
    }

    fn ensure_header(
        &self,
        table: &TableHandle,
        columns: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, StoreError>> + Send + '_>> {
        self.inner.ensure_header(table, columns)
    }

    fn append_rows(
        &self,
        table: &TableHandle,
        rows: &[Row],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let table = table.clone();
        let rows = rows.to_vec();
        Box::pin(async move {
            self.inner.append_rows(&table, &rows).await?;
            let mut durable = self.durable.lock().expect("durable lock");
            *durable.entry(table.name.clone()).or_default() += rows.len();
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  AuditWriter: captures STATE lines with a durability snapshot
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Emitted {
    pub value: Value,
    /// Durable rows per table at the moment the line was written.
    pub durable: BTreeMap<String, usize>,
}

#[derive(Clone)]
pub struct AuditWriter {
    partial: Vec<u8>,
    durable: Durable,
    pub emitted: Arc<Mutex<Vec<Emitted>>>,
}

impl AuditWriter {
    pub fn new(durable: Durable) -> Self {
        Self { partial: Vec::new(), durable, emitted: Arc::default() }
    }

    pub fn values(&self) -> Vec<Value> {
        self.emitted.lock().expect("emitted lock").iter().map(|e| e.value.clone()).collect()
    }
}

impl AsyncWrite for AuditWriter {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.partial.extend_from_slice(buf);
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let parsed: Value = serde_json::from_slice(&line)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            assert_eq!(parsed["type"], "STATE", "only STATE lines may reach the output");
            let durable = self.durable.lock().expect("durable lock").clone();
            self.emitted
                .lock()
                .expect("emitted lock")
                .push(Emitted { value: parsed["value"].clone(), durable });
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
