use std::sync::Arc;

use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use sink_api::TabularStore;
use storage_google_sheets::{GoogleSheetsStore, credentials};
use storage_memory::MemoryStore;
use sync_engine::{RunSummary, SyncEngine};

use crate::config::{Cli, TargetConfig};
use crate::error::TargetError;

pub async fn run(cli: Cli) -> Result<(), TargetError> {
    tracing::info!("target-google-sheets starting");

    // --- Load config ---
    let config = TargetConfig::load(&cli.config)?;
    config.validate(!cli.dry_run)?;
    tracing::info!(config = %cli.config.display(), dry_run = cli.dry_run, "loaded config");
    let engine_config = config.sync.engine_config();

    // --- Store ---
    let memory = cli.dry_run.then(|| Arc::new(MemoryStore::new()));
    let store: Arc<dyn TabularStore> = match &memory {
        Some(memory) => memory.clone(),
        None => {
            let token = credentials::access_token(&config.credentials_path)?;
            let sheets = GoogleSheetsStore::new(
                &config.spreadsheet_url,
                token,
                engine_config.retry.call_timeout,
            )?;
            tracing::info!(spreadsheet = %sheets.spreadsheet_id(), "google sheets store ready");
            Arc::new(sheets)
        }
    };

    // --- Ctrl+C → CancellationToken ---
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("interrupt received, finishing in-flight writes");
                signal_token.cancel();
            }
            Err(e) => tracing::error!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    // --- Run ---
    let mut engine = SyncEngine::new(store, engine_config, tokio::io::stdout());
    let summary = match &cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await.map_err(|source| TargetError::Input {
                path: path.clone(),
                source,
            })?;
            engine.run(BufReader::new(file), token).await?
        }
        None => engine.run(BufReader::new(tokio::io::stdin()), token).await?,
    };

    report(&summary);
    if let Some(memory) = memory {
        for table in memory.table_names().await {
            tracing::info!(table = %table, rows = memory.rows(&table).await.len(), "dry-run table");
        }
    }
    check_complete(&summary)
}

/// Входные строки, не дошедшие до таблицы, это потеря данных: выходим с ошибкой,
/// даже если остальные потоки записаны.
fn check_complete(summary: &RunSummary) -> Result<(), TargetError> {
    if summary.dropped_records == 0 {
        return Ok(());
    }
    let halted = summary.halted_streams();
    Err(TargetError::Incomplete {
        dropped: summary.dropped_records,
        withheld: summary.checkpoints_withheld,
        halted: if halted.is_empty() { "none".into() } else { halted.join(", ") },
    })
}

fn report(summary: &RunSummary) {
    for (stream, s) in &summary.streams {
        match &s.halted {
            Some(reason) => tracing::warn!(
                stream = %stream,
                rows = s.rows_written,
                skipped = s.skipped_messages,
                reason = %reason,
                "stream halted"
            ),
            None => tracing::info!(
                stream = %stream,
                rows = s.rows_written,
                batches = s.batches_written,
                key_properties = ?s.key_properties,
                "stream done"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_engine::StreamSummary;

    #[test]
    fn clean_run_is_complete() {
        assert!(check_complete(&RunSummary::default()).is_ok());
    }

    #[test]
    fn dropped_records_fail_the_run() {
        let mut summary = RunSummary { dropped_records: 2, checkpoints_withheld: 1, ..RunSummary::default() };
        summary.streams.insert(
            "users".into(),
            StreamSummary { halted: Some("UnknownStream".into()), ..StreamSummary::default() },
        );

        let err = check_complete(&summary).unwrap_err();
        assert_eq!(
            err.to_string(),
            "2 input record(s) were not written (halted streams: users); 1 later checkpoint(s) withheld"
        );
    }
}
