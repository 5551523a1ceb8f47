use serde::{Deserialize, Serialize};

/// One fixed-width row of cell values, aligned to a stream's column order.
///
/// `Null` marks a field the record did not carry. Rows projected under an
/// older (shorter) layout stay valid: columns are append-only, so a shorter
/// row is a prefix of the current layout.
pub type Row = Vec<serde_json::Value>;

/// Handle to a remote table, resolved once per stream and cached by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableHandle {
    /// Backend-specific numeric id (Google Sheets `sheetId`).
    pub id: i64,
    /// Table title as seen in the remote store.
    pub name: String,
}

impl TableHandle {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

impl std::fmt::Display for TableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Merge a remote header with the desired column layout: existing cells keep
/// their position, desired columns that are missing are appended in order.
///
/// Both store backends use this so header extension behaves identically.
pub fn merge_header(existing: &[String], desired: &[String]) -> Vec<String> {
    let mut merged = existing.to_vec();
    for column in desired {
        if !merged.iter().any(|c| c == column) {
            merged.push(column.clone());
        }
    }
    merged
}

/// Sheet/table name for a stream: optional prefix, `:` replaced by `_`.
pub fn table_name_for(prefix: &str, stream: &str) -> String {
    format!("{prefix}{}", stream.replace(':', "_"))
}
