use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use sink_api::{StoreError, TableHandle, TabularStore, table_name_for};

use crate::buffer::{Batch, RecordBuffer};
use crate::checkpoint::{CheckpointTracker, CheckpointWriter};
use crate::config::EngineConfig;
use crate::error::{EngineFailure, StreamHalt, SyncError};
use crate::message::{Message, RecordMessage, SchemaMessage, decode_bytes};
use crate::retry::{RetryStats, with_retry};
use crate::schema::SchemaRegistry;

// ═══════════════════════════════════════════════════════════════
//  State & summary
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Reading input, no flush in flight.
    Running,
    /// Reading input while at least one flush is in flight.
    Flushing,
    /// End of input reached, draining every buffer.
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub table: Option<String>,
    pub key_properties: Vec<String>,
    pub rows_written: u64,
    pub batches_written: u64,
    /// Messages dropped because the stream was halted.
    pub skipped_messages: u64,
    pub halted: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub messages: u64,
    /// Lines that could not be attributed to any stream.
    pub malformed_lines: u64,
    /// RECORDs (or lines that may have been RECORDs) that were not written:
    /// rejected, unattributable or skipped for a halted stream.
    pub dropped_records: u64,
    pub checkpoints_emitted: u64,
    pub checkpoints_superseded: u64,
    /// STATEs never emitted because rows before them were dropped.
    pub checkpoints_withheld: u64,
    pub streams: BTreeMap<String, StreamSummary>,
}

impl RunSummary {
    pub fn rows_written(&self) -> u64 {
        self.streams.values().map(|s| s.rows_written).sum()
    }

    pub fn halted_streams(&self) -> Vec<&str> {
        self.streams
            .iter()
            .filter(|(_, s)| s.halted.is_some())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Per-stream status
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct StreamStatus {
    /// Resolved once on the first SCHEMA, then reused.
    table: Option<TableHandle>,
    /// Sequence number of the last row confirmed appended.
    flushed_seq: u64,
    in_flight: bool,
    halted: Option<StreamHalt>,
    rows_written: u64,
    batches_written: u64,
    skipped_messages: u64,
}

/// Result of one flush task, handed back to the engine.
struct FlushOutcome {
    batch: Batch,
    result: Result<(), StoreError>,
    stats: RetryStats,
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// ═══════════════════════════════════════════════════════════════
//  SyncEngine
// ═══════════════════════════════════════════════════════════════

/// Single-writer state machine: reads protocol lines in order, buffers rows
/// per stream, flushes them through the store and writes STATE lines once
/// everything before them is durable.
///
/// Flushes run as tasks so different streams overlap their network I/O.
/// A stream never has more than one flush in flight, which keeps its
/// appends ordered.
pub struct SyncEngine<W> {
    store: Arc<dyn TabularStore>,
    config: EngineConfig,
    registry: SchemaRegistry,
    buffer: RecordBuffer,
    tracker: CheckpointTracker,
    writer: CheckpointWriter<W>,
    streams: BTreeMap<String, StreamStatus>,
    flushes: JoinSet<FlushOutcome>,
    state: EngineState,
    messages: u64,
    malformed_lines: u64,
    dropped_records: u64,
}

impl<W: AsyncWrite + Unpin> SyncEngine<W> {
    pub fn new(store: Arc<dyn TabularStore>, config: EngineConfig, output: W) -> Self {
        Self {
            store,
            registry: SchemaRegistry::new(),
            buffer: RecordBuffer::new(config.buffer.clone()),
            tracker: CheckpointTracker::new(),
            writer: CheckpointWriter::new(output),
            streams: BTreeMap::new(),
            flushes: JoinSet::new(),
            state: EngineState::Running,
            messages: 0,
            malformed_lines: 0,
            dropped_records: 0,
            config,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn last_checkpoint(&self) -> Option<&Value> {
        self.writer.last_emitted()
    }

    pub fn into_output(self) -> W {
        self.writer.into_inner()
    }

    /// Consume `input` to the end (or until `token` is cancelled) and finalize.
    pub async fn run<R>(&mut self, input: R, token: CancellationToken) -> Result<RunSummary, EngineFailure>
    where
        R: AsyncBufRead + Unpin,
    {
        tracing::info!(
            batch_size = self.config.buffer.batch_size,
            flush_interval_secs = self.config.flush_interval.map(|d| d.as_secs()),
            "sync engine started"
        );

        if let Err(e) = self.pump(input, &token).await {
            return Err(self.fail(e).await);
        }
        self.finalize().await
    }

    async fn pump<R>(&mut self, mut input: R, token: &CancellationToken) -> Result<(), SyncError>
    where
        R: AsyncBufRead + Unpin,
    {
        // read_until дописывает в `line` и при отмене ветки select!: строка
        // собирается по частям и разбирается только целиком.
        let mut line = Vec::new();
        let mut ticker = self.config.flush_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    tracing::warn!("cancellation requested, no more input is accepted");
                    return Err(SyncError::Cancelled);
                }

                Some(joined) = self.flushes.join_next(), if !self.flushes.is_empty() => {
                    self.on_flush_joined(joined).await?;
                }

                _ = tick(&mut ticker) => {
                    self.flush_idle_streams();
                }

                read = input.read_until(b'\n', &mut line) => {
                    if read? == 0 {
                        if !line.is_empty() {
                            self.handle_line(&line).await?;
                        }
                        return Ok(());
                    }
                    if line.ends_with(b"\n") {
                        self.handle_line(&line).await?;
                        line.clear();
                    }
                }
            }
        }
    }

    // ───────────────────────────────────────────────────────────
    //  Message routing
    // ───────────────────────────────────────────────────────────

    async fn handle_line(&mut self, raw: &[u8]) -> Result<(), SyncError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        self.messages += 1;

        let line = raw.strip_suffix(b"\n").unwrap_or(raw);
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        match decode_bytes(line) {
            Ok(Message::Schema(msg)) => self.on_schema(msg).await,
            Ok(Message::Record(msg)) => self.on_record(msg).await,
            Ok(Message::State(msg)) => self.on_state(msg.value).await,
            Err(malformed) => {
                // Строка могла быть RECORD: всё, что придёт после, уже не покрыто.
                self.drop_records();
                match malformed.stream.clone() {
                    Some(stream) => self.halt(&stream, malformed.into()),
                    None => {
                        self.malformed_lines += 1;
                        tracing::error!(error = %malformed, line_no = self.messages, "skipping malformed line");
                    }
                }
                Ok(())
            }
        }
    }

    async fn on_schema(&mut self, msg: SchemaMessage) -> Result<(), SyncError> {
        let stream = msg.stream;
        if self.skip_if_halted(&stream) {
            return Ok(());
        }

        let delta = match self.registry.register(
            &stream,
            msg.schema,
            msg.key_properties,
            msg.column_order.as_deref(),
        ) {
            Ok(delta) => delta,
            Err(e) => {
                self.halt(&stream, e.into());
                return Ok(());
            }
        };
        tracing::info!(
            stream = %stream,
            added = ?delta.added_columns,
            key_properties = ?self.registry.key_properties(&stream).unwrap_or_default(),
            "schema registered"
        );

        let table = self.resolve_table(&stream).await?;
        if delta.is_empty() {
            return Ok(());
        }

        let columns = self.registry.columns(&stream).unwrap_or_default();
        let store = Arc::clone(&self.store);
        let header = self
            .call_store(&stream, "ensure_header", || store.ensure_header(&table, &columns))
            .await?;

        match self.registry.align(&stream, &header) {
            Ok(extra) if !extra.is_empty() => {
                tracing::info!(stream = %stream, columns = ?extra.added_columns, "adopted remote-only header columns");
            }
            Ok(_) => {}
            Err(e) => self.halt(&stream, e.into()),
        }
        Ok(())
    }

    async fn resolve_table(&mut self, stream: &str) -> Result<TableHandle, SyncError> {
        if let Some(table) = self.streams.get(stream).and_then(|s| s.table.clone()) {
            return Ok(table);
        }
        let name = table_name_for(&self.config.sheet_prefix, stream);
        let store = Arc::clone(&self.store);
        let table = self
            .call_store(stream, "ensure_table", || store.ensure_table(&name))
            .await?;
        tracing::info!(stream = %stream, table = %table, "table resolved");
        self.status_mut(stream).table = Some(table.clone());
        Ok(table)
    }

    async fn on_record(&mut self, msg: RecordMessage) -> Result<(), SyncError> {
        let stream = msg.stream;
        if self.skip_if_halted(&stream) {
            self.drop_records();
            return Ok(());
        }

        let row = match self.registry.validate(&stream, &msg.record) {
            Ok(row) => row,
            Err(e) => {
                self.drop_records();
                self.halt(&stream, e.into());
                return Ok(());
            }
        };

        let status = self.buffer.append(&stream, row);
        if status.should_flush {
            self.start_flush(&stream);
        }

        // Очередь упёрлась в потолок, а flush этого потока ещё в полёте:
        // ждём завершения вместо бесконечного роста буфера.
        while self.buffer.len(&stream) >= self.config.max_buffered_rows && self.in_flight(&stream) {
            tracing::debug!(stream = %stream, queued = self.buffer.len(&stream), "buffer full, waiting for flush");
            match self.flushes.join_next().await {
                Some(joined) => self.on_flush_joined(joined).await?,
                None => break,
            }
        }
        Ok(())
    }

    async fn on_state(&mut self, value: Value) -> Result<(), SyncError> {
        if self.tracker.is_blocked() {
            tracing::warn!(value = %value, "checkpoint withheld: rows before it were dropped");
            self.tracker.offer(value, BTreeMap::new());
            return Ok(());
        }

        let watermarks: BTreeMap<String, u64> = self
            .streams
            .iter()
            .filter_map(|(name, status)| {
                let appended = self.buffer.appended_seq(name);
                (appended > status.flushed_seq).then(|| (name.clone(), appended))
            })
            .collect();

        if !watermarks.is_empty() {
            tracing::debug!(waiting_on = ?watermarks.keys().collect::<Vec<_>>(), "checkpoint pending");
        }
        if let Some(older) = self.tracker.offer(value, watermarks) {
            tracing::debug!(superseded = %older, "pending checkpoint superseded");
        }
        self.emit_ready().await
    }

    // ───────────────────────────────────────────────────────────
    //  Flushing
    // ───────────────────────────────────────────────────────────

    /// Spawn a flush for `stream` unless one is already in flight.
    fn start_flush(&mut self, stream: &str) -> bool {
        let Some(status) = self.streams.get_mut(stream) else {
            return false;
        };
        if status.in_flight {
            return false;
        }
        let Some(table) = status.table.clone() else {
            return false;
        };
        let Some(mut batch) = self.buffer.drain_batch(stream) else {
            return false;
        };
        status.in_flight = true;

        // Rows projected before a schema change are shorter than the header.
        let width = self.registry.width(stream);
        for row in batch.rows.iter_mut().filter(|r| r.len() < width) {
            row.resize(width, Value::Null);
        }

        tracing::debug!(stream = %stream, rows = batch.len(), first_seq = batch.first_seq, "flush started");
        let store = Arc::clone(&self.store);
        let policy = self.config.retry.clone();
        self.flushes.spawn(async move {
            let what = format!("append_rows {}", table.name);
            let (result, stats) =
                with_retry(&policy, &what, || store.append_rows(&table, &batch.rows)).await;
            FlushOutcome { batch, result, stats }
        });

        if self.state == EngineState::Running {
            self.state = EngineState::Flushing;
        }
        true
    }

    /// Periodic tick: flush every non-empty buffer that is not in flight.
    fn flush_idle_streams(&mut self) {
        for stream in self.buffer.pending_streams() {
            if self.start_flush(&stream) {
                tracing::debug!(stream = %stream, "interval flush");
            }
        }
    }

    async fn on_flush_joined(&mut self, joined: Result<FlushOutcome, JoinError>) -> Result<(), SyncError> {
        let outcome = joined.map_err(|e| SyncError::TaskAborted(e.to_string()))?;
        let stream = self.apply_outcome(outcome)?;

        self.emit_ready().await?;
        if self.buffer.is_due(&stream) || self.state == EngineState::Finalizing {
            self.start_flush(&stream);
        }
        if self.flushes.is_empty() && self.state == EngineState::Flushing {
            self.state = EngineState::Running;
        }
        Ok(())
    }

    /// Book-keeping for a finished flush. A failed batch goes back to the
    /// front of its buffer before the error is returned.
    fn apply_outcome(&mut self, outcome: FlushOutcome) -> Result<String, SyncError> {
        let FlushOutcome { batch, result, stats } = outcome;
        let stream = batch.stream.clone();

        if stats.rate_limited > 0 {
            let limit = self.buffer.widen(&stream);
            tracing::info!(stream = %stream, batch_limit = limit, "rate limited, widening batches");
        }

        let status = self.status_mut(&stream);
        status.in_flight = false;
        match result {
            Ok(()) => {
                status.flushed_seq = batch.last_seq;
                status.rows_written += batch.len() as u64;
                status.batches_written += 1;
                tracing::info!(
                    stream = %stream,
                    rows = batch.len(),
                    attempts = stats.attempts,
                    total_rows = status.rows_written,
                    "batch appended"
                );
                Ok(stream)
            }
            Err(source) => {
                tracing::error!(
                    stream = %stream,
                    rows = batch.len(),
                    attempts = stats.attempts,
                    error = %source,
                    "batch append failed, rows kept in buffer"
                );
                self.buffer.restore(batch);
                Err(SyncError::Store { stream, source })
            }
        }
    }

    async fn emit_ready(&mut self) -> Result<(), SyncError> {
        let streams = &self.streams;
        let ready = self
            .tracker
            .take_ready(|name| streams.get(name).map(|s| s.flushed_seq).unwrap_or(0));
        if let Some(value) = ready {
            self.writer.emit(value).await?;
            tracing::info!(emitted = self.writer.emitted(), "checkpoint emitted");
        }
        Ok(())
    }

    async fn call_store<T, F, Fut>(&self, stream: &str, what: &str, call: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let (result, _) = with_retry(&self.config.retry, what, call).await;
        result.map_err(|source| SyncError::Store {
            stream: stream.to_string(),
            source,
        })
    }

    // ───────────────────────────────────────────────────────────
    //  Stream helpers
    // ───────────────────────────────────────────────────────────

    fn status_mut(&mut self, stream: &str) -> &mut StreamStatus {
        self.streams.entry(stream.to_string()).or_default()
    }

    fn in_flight(&self, stream: &str) -> bool {
        self.streams.get(stream).is_some_and(|s| s.in_flight)
    }

    fn skip_if_halted(&mut self, stream: &str) -> bool {
        match self.streams.get_mut(stream) {
            Some(status) if status.halted.is_some() => {
                status.skipped_messages += 1;
                tracing::trace!(stream = %stream, "message for halted stream skipped");
                true
            }
            _ => false,
        }
    }

    /// A row from the input will never be written. Checkpoints received
    /// from here on would acknowledge it, so they are withheld.
    fn drop_records(&mut self) {
        self.dropped_records += 1;
        if self.tracker.block() {
            tracing::warn!(
                line_no = self.messages,
                "input rows dropped, later checkpoints will be withheld"
            );
        }
    }

    /// Stop accepting messages for one stream. Rows it already buffered are
    /// still flushed; other streams are unaffected.
    fn halt(&mut self, stream: &str, reason: StreamHalt) {
        tracing::error!(stream = %stream, error = %reason, "stream halted");
        let status = self.status_mut(stream);
        if status.halted.is_none() {
            status.halted = Some(reason);
        }
    }

    // ───────────────────────────────────────────────────────────
    //  Termination
    // ───────────────────────────────────────────────────────────

    async fn finalize(&mut self) -> Result<RunSummary, EngineFailure> {
        self.state = EngineState::Finalizing;
        tracing::info!(pending = ?self.buffer.pending_streams(), "end of input, flushing all buffers");

        loop {
            for stream in self.buffer.pending_streams() {
                self.start_flush(&stream);
            }
            let Some(joined) = self.flushes.join_next().await else {
                break;
            };
            if let Err(e) = self.on_flush_joined(joined).await {
                return Err(self.fail(e).await);
            }
        }

        if let Err(e) = self.emit_ready().await {
            return Err(self.fail(e).await);
        }
        if let Some(pending) = self.tracker.pending() {
            let streams = &self.streams;
            tracing::warn!(
                waiting_on = ?self.tracker.waiting_on(|n| streams.get(n).map(|s| s.flushed_seq).unwrap_or(0)),
                value = %pending.value,
                "checkpoint withheld: covered rows were never appended"
            );
        }

        self.state = EngineState::Done;
        let summary = self.summary();
        tracing::info!(
            messages = summary.messages,
            rows_written = summary.rows_written(),
            checkpoints = summary.checkpoints_emitted,
            halted = ?summary.halted_streams(),
            dropped_records = summary.dropped_records,
            checkpoints_withheld = summary.checkpoints_withheld,
            "sync finished"
        );
        Ok(summary)
    }

    /// Enter FAILED. In-flight flushes are awaited so no append is left
    /// half-observed; checkpoints are only emitted on cancellation, never
    /// after a store failure.
    async fn fail(&mut self, error: SyncError) -> EngineFailure {
        let emit = matches!(error, SyncError::Cancelled);

        while let Some(joined) = self.flushes.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "flush task aborted during shutdown");
                    continue;
                }
            };
            // Ошибки здесь уже не меняют исход: строки возвращаются в буфер.
            if self.apply_outcome(outcome).is_ok() && emit {
                if let Err(e) = self.emit_ready().await {
                    tracing::error!(error = %e, "checkpoint write failed during shutdown");
                }
            }
        }

        self.state = EngineState::Failed;
        let unflushed: usize = self.buffer.pending_streams().iter().map(|s| self.buffer.len(s)).sum();
        tracing::error!(
            kind = %error.kind(),
            error = %error,
            unflushed_rows = unflushed,
            last_checkpoint = ?self.writer.last_emitted(),
            "sync failed"
        );

        EngineFailure {
            error,
            last_checkpoint: self.writer.last_emitted().cloned(),
            summary: self.summary(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        let streams = self
            .streams
            .iter()
            .map(|(name, status)| {
                let summary = StreamSummary {
                    table: status.table.as_ref().map(|t| t.name.clone()),
                    key_properties: self.registry.key_properties(name).unwrap_or_default().to_vec(),
                    rows_written: status.rows_written,
                    batches_written: status.batches_written,
                    skipped_messages: status.skipped_messages,
                    halted: status.halted.as_ref().map(ToString::to_string),
                };
                (name.clone(), summary)
            })
            .collect();

        RunSummary {
            messages: self.messages,
            malformed_lines: self.malformed_lines,
            dropped_records: self.dropped_records,
            checkpoints_emitted: self.writer.emitted(),
            checkpoints_superseded: self.tracker.superseded(),
            checkpoints_withheld: self.tracker.withheld(),
            streams,
        }
    }
}
