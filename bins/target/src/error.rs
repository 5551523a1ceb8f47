use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("credentials: {0}")]
    Credentials(#[from] storage_google_sheets::CredentialsError),

    #[error("{0}")]
    Store(#[from] sink_api::StoreError),

    #[error("input {}: {source}", .path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Sync(#[from] sync_engine::EngineFailure),

    #[error(
        "{dropped} input record(s) were not written (halted streams: {halted}); \
         {withheld} later checkpoint(s) withheld"
    )]
    Incomplete { dropped: u64, withheld: u64, halted: String },
}
