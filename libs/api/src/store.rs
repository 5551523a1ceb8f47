use std::future::Future;
use std::pin::Pin;

use crate::error::StoreError;
use crate::types::{Row, TableHandle};

/// Remote tabular store: named tables with an append-only header row.
///
/// The engine knows nothing about the concrete transport. Every call may fail
/// with a classified `StoreError`; retry/backoff lives in the engine, not here.
///
/// Backends: Google Sheets (HTTP), in-memory (tests, dry runs).
pub trait TabularStore: Send + Sync {
    /// Locate the table by name, creating it when missing. Idempotent.
    fn ensure_table(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<TableHandle, StoreError>> + Send + '_>>;

    /// Extend the header row so it contains `columns`.
    ///
    /// Existing header cells are never reordered or removed; missing columns are
    /// appended in the given order. When nothing is missing no write happens.
    /// Returns the resulting header row.
    fn ensure_header(
        &self,
        table: &TableHandle,
        columns: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, StoreError>> + Send + '_>>;

    /// Append `rows` as one contiguous block, preserving order.
    /// A failed call must leave no partial block behind.
    fn append_rows(
        &self,
        table: &TableHandle,
        rows: &[Row],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}
