use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use sink_api::{Row, StoreError, TableHandle, TabularStore, merge_header};

// ═══════════════════════════════════════════════════════════════
//  MemoryTable
// ═══════════════════════════════════════════════════════════════

/// Снимок одной таблицы: header + строки + история вызовов append.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub id: i64,
    pub header: Vec<String>,
    pub rows: Vec<Row>,
    /// Размеры успешно записанных батчей, в порядке записи.
    pub append_batches: Vec<usize>,
    /// Сколько раз header реально перезаписывался.
    pub header_writes: usize,
}

// ═══════════════════════════════════════════════════════════════
//  MemoryStore
// ═══════════════════════════════════════════════════════════════

/// In-memory `TabularStore`. Для тестов engine'а и `--dry-run`
/// (ничего не уходит в сеть).
///
/// Поддерживает fault injection: заранее заданные ошибки для
/// `append_rows` конкретной таблицы и искусственную задержку записи.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, MemoryTable>>,
    next_id: AtomicI64,
    /// Очередь ошибок на append, по имени таблицы. Каждый вызов забирает одну.
    append_faults: Mutex<HashMap<String, VecDeque<StoreError>>>,
    /// Ошибки на ensure_table (глобальная очередь).
    table_faults: Mutex<VecDeque<StoreError>>,
    append_delay: RwLock<HashMap<String, Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Следующие `append_rows` в таблицу `table` вернут эти ошибки по очереди.
    pub async fn fail_appends(&self, table: &str, errors: impl IntoIterator<Item = StoreError>) {
        let mut faults = self.append_faults.lock().await;
        faults.entry(table.to_string()).or_default().extend(errors);
    }

    /// Следующие `ensure_table` вернут эти ошибки по очереди.
    pub async fn fail_ensure_table(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.table_faults.lock().await.extend(errors);
    }

    /// Задержка перед каждой записью в таблицу (для тестов конкурентности).
    pub async fn set_append_delay(&self, table: &str, delay: Duration) {
        self.append_delay.write().await.insert(table.to_string(), delay);
    }

    pub async fn table(&self, name: &str) -> Option<MemoryTable> {
        self.tables.read().await.get(name).cloned()
    }

    pub async fn rows(&self, name: &str) -> Vec<Row> {
        self.table(name).await.map(|t| t.rows).unwrap_or_default()
    }

    pub async fn header(&self, name: &str) -> Vec<String> {
        self.table(name).await.map(|t| t.header).unwrap_or_default()
    }

    pub async fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Посчитать общее число записанных строк (по всем таблицам).
    pub async fn total_rows(&self) -> usize {
        self.tables.read().await.values().map(|t| t.rows.len()).sum()
    }

    async fn take_append_fault(&self, table: &str) -> Option<StoreError> {
        let mut faults = self.append_faults.lock().await;
        faults.get_mut(table).and_then(|q| q.pop_front())
    }
}

impl TabularStore for MemoryStore {
    fn ensure_table(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<TableHandle, StoreError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            if let Some(err) = self.table_faults.lock().await.pop_front() {
                return Err(err);
            }
            let mut tables = self.tables.write().await;
            let table = tables.entry(name.clone()).or_insert_with(|| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(table = %name, id, "memory table created");
                MemoryTable { id, ..MemoryTable::default() }
            });
            Ok(TableHandle::new(table.id, name))
        })
    }

    fn ensure_header(
        &self,
        table: &TableHandle,
        columns: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, StoreError>> + Send + '_>> {
        let table = table.clone();
        let columns = columns.to_vec();
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            let entry = tables
                .get_mut(&table.name)
                .ok_or_else(|| StoreError::rejected(format!("table '{}' not found", table.name)))?;
            let merged = merge_header(&entry.header, &columns);
            if merged != entry.header {
                entry.header = merged.clone();
                entry.header_writes += 1;
            }
            Ok(merged)
        })
    }

    fn append_rows(
        &self,
        table: &TableHandle,
        rows: &[Row],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let table = table.clone();
        let rows = rows.to_vec();
        Box::pin(async move {
            let delay = self.append_delay.read().await.get(&table.name).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.take_append_fault(&table.name).await {
                return Err(err);
            }

            let mut tables = self.tables.write().await;
            let entry = tables
                .get_mut(&table.name)
                .ok_or_else(|| StoreError::rejected(format!("table '{}' not found", table.name)))?;
            entry.append_batches.push(rows.len());
            entry.rows.extend(rows);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn ensure_table_is_idempotent() {
        let store = MemoryStore::new();
        let a = store.ensure_table("users").await.unwrap();
        let b = store.ensure_table("users").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.table_names().await, vec!["users".to_string()]);
    }

    #[tokio::test]
    async fn header_extension_is_idempotent() {
        let store = MemoryStore::new();
        let t = store.ensure_table("users").await.unwrap();

        let first = store.ensure_header(&t, &cols(&["id", "email"])).await.unwrap();
        let second = store.ensure_header(&t, &cols(&["id", "email"])).await.unwrap();

        assert_eq!(first, second);
        let table = store.table("users").await.unwrap();
        assert_eq!(table.header, cols(&["id", "email"]));
        assert_eq!(table.header_writes, 1);
    }

    #[tokio::test]
    async fn append_keeps_batches_in_order() {
        let store = MemoryStore::new();
        let t = store.ensure_table("users").await.unwrap();
        store.append_rows(&t, &[vec![json!(1)], vec![json!(2)]]).await.unwrap();
        store.append_rows(&t, &[vec![json!(3)]]).await.unwrap();

        let table = store.table("users").await.unwrap();
        assert_eq!(table.rows, vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]]);
        assert_eq!(table.append_batches, vec![2, 1]);
    }

    #[tokio::test]
    async fn injected_fault_leaves_no_rows() {
        let store = MemoryStore::new();
        let t = store.ensure_table("users").await.unwrap();
        store.fail_appends("users", [StoreError::rate_limited("429")]).await;

        let err = store.append_rows(&t, &[vec![json!(1)]]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.rows("users").await.is_empty());

        store.append_rows(&t, &[vec![json!(1)]]).await.unwrap();
        assert_eq!(store.rows("users").await.len(), 1);
    }
}
