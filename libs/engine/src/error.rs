use serde_json::Value;
use sink_api::StoreError;

use crate::engine::RunSummary;
use crate::message::MalformedMessage;

/// Per-stream problems. They halt the offending stream; other streams go on.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("UnknownStream: no SCHEMA registered for stream '{0}'")]
    UnknownStream(String),

    #[error("SchemaValidationError: stream '{stream}' at {path}: {reason}")]
    Validation {
        stream: String,
        path: String,
        reason: String,
    },

    #[error("InvalidSchema: stream '{stream}': {reason}")]
    InvalidSchema { stream: String, reason: String },

    #[error("HeaderConflict: stream '{stream}': remote header {remote:?} does not extend local columns {local:?}")]
    HeaderConflict {
        stream: String,
        local: Vec<String>,
        remote: Vec<String>,
    },
}

/// Why a single stream stopped accepting messages.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamHalt {
    #[error(transparent)]
    Malformed(#[from] MalformedMessage),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Run-level failure: the engine is in FAILED and nothing more is emitted.
/// Display always starts with the kind name.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{source} (stream '{stream}')")]
    Store {
        stream: String,
        #[source]
        source: StoreError,
    },

    #[error("Io: {0}")]
    Io(#[from] std::io::Error),

    #[error("TaskAborted: flush task ended abnormally: {0}")]
    TaskAborted(String),

    #[error("Cancelled: shutdown requested before end of input")]
    Cancelled,
}

impl SyncError {
    /// Short kind name, e.g. `StoreQuotaExceeded`.
    pub fn kind(&self) -> String {
        match self {
            SyncError::Store { source, .. } => source.kind().to_string(),
            SyncError::Io(_) => "Io".into(),
            SyncError::TaskAborted(_) => "TaskAborted".into(),
            SyncError::Cancelled => "Cancelled".into(),
        }
    }
}

/// What the caller gets back when the run ends in FAILED.
#[derive(Debug)]
pub struct EngineFailure {
    pub error: SyncError,
    /// Last checkpoint value written to output, if any.
    pub last_checkpoint: Option<Value>,
    pub summary: RunSummary,
}

impl std::fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}; last emitted checkpoint: ", self.error)?;
        match &self.last_checkpoint {
            Some(value) => write!(f, "{value}"),
            None => write!(f, "none"),
        }
    }
}

impl std::error::Error for EngineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
