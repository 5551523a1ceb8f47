use std::collections::BTreeMap;

use serde_json::{Value, json};
use tokio::io::{AsyncWrite, AsyncWriteExt};

// ═══════════════════════════════════════════════════════════════
//  Tracker
// ═══════════════════════════════════════════════════════════════

/// STATE value waiting for the rows in front of it to become durable.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCheckpoint {
    pub value: Value,
    /// stream → sequence number of the last row that arrived before this STATE.
    pub watermarks: BTreeMap<String, u64>,
}

/// Holds at most one pending checkpoint; a newer STATE supersedes the older.
///
/// Superseding never weakens safety: the newer STATE arrived later, so its
/// watermarks are at least the older ones for every stream.
///
/// Once input rows were dropped (rejected, unattributable or skipped), every
/// later STATE covers rows that will never be written: such STATEs are
/// withheld. A checkpoint that was already pending stays eligible.
#[derive(Debug, Default)]
pub struct CheckpointTracker {
    pending: Option<PendingCheckpoint>,
    superseded: u64,
    blocked: bool,
    withheld: u64,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending checkpoint. Returns the discarded value, if any.
    /// After [`block`](Self::block) the value is withheld instead.
    pub fn offer(&mut self, value: Value, watermarks: BTreeMap<String, u64>) -> Option<Value> {
        if self.blocked {
            self.withheld += 1;
            return Some(value);
        }
        let previous = self.pending.replace(PendingCheckpoint { value, watermarks });
        previous.map(|p| {
            self.superseded += 1;
            p.value
        })
    }

    /// Take the pending value if every watermark is covered by `flushed`.
    pub fn take_ready(&mut self, flushed: impl Fn(&str) -> u64) -> Option<Value> {
        let ready = self
            .pending
            .as_ref()
            .is_some_and(|p| p.watermarks.iter().all(|(stream, seq)| flushed(stream) >= *seq));
        if ready {
            self.pending.take().map(|p| p.value)
        } else {
            None
        }
    }

    pub fn pending(&self) -> Option<&PendingCheckpoint> {
        self.pending.as_ref()
    }

    /// Streams the pending checkpoint still waits on.
    pub fn waiting_on(&self, flushed: impl Fn(&str) -> u64) -> Vec<String> {
        self.pending
            .as_ref()
            .map(|p| {
                p.watermarks
                    .iter()
                    .filter(|(stream, seq)| flushed(stream) < **seq)
                    .map(|(stream, _)| stream.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn superseded(&self) -> u64 {
        self.superseded
    }

    /// Input rows were lost: no STATE offered from now on is ever emitted.
    /// Returns `true` on the first call.
    pub fn block(&mut self) -> bool {
        !std::mem::replace(&mut self.blocked, true)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// STATEs refused because they arrived after dropped rows.
    pub fn withheld(&self) -> u64 {
        self.withheld
    }
}

// ═══════════════════════════════════════════════════════════════
//  Writer
// ═══════════════════════════════════════════════════════════════

/// Writes `{"type":"STATE","value":...}` lines to the process output.
pub struct CheckpointWriter<W> {
    out: W,
    last_emitted: Option<Value>,
    emitted: u64,
}

impl<W: AsyncWrite + Unpin> CheckpointWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, last_emitted: None, emitted: 0 }
    }

    /// Emit one checkpoint line and flush it through.
    pub async fn emit(&mut self, value: Value) -> std::io::Result<()> {
        let line = json!({"type": "STATE", "value": value});
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');
        self.out.write_all(&bytes).await?;
        self.out.flush().await?;
        self.emitted += 1;
        self.last_emitted = Some(value);
        Ok(())
    }

    pub fn last_emitted(&self) -> Option<&Value> {
        self.last_emitted.as_ref()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
