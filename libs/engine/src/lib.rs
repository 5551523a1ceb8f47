pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod retry;
pub mod schema;
mod validate;

pub use buffer::{Batch, BufferPolicy, BufferStatus, RecordBuffer};
pub use checkpoint::{CheckpointTracker, CheckpointWriter, PendingCheckpoint};
pub use config::{EngineConfig, SyncConfig};
pub use engine::{EngineState, RunSummary, StreamSummary, SyncEngine};
pub use error::{EngineFailure, SchemaError, StreamHalt, SyncError};
pub use message::{MalformedMessage, MalformedReason, Message, decode, decode_bytes};
pub use retry::{RetryPolicy, RetryStats, with_retry};
pub use schema::{ColumnDelta, SchemaRegistry};
