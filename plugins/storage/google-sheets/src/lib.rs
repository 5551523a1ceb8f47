pub mod credentials;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{Value, json};

use sink_api::{Row, StoreError, TableHandle, TabularStore, merge_header};

pub use credentials::{ACCESS_TOKEN_ENV, CredentialsError, DEFAULT_CREDENTIALS_PATH};

pub const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";

/// Размер нового листа (как у листа по умолчанию в UI).
const NEW_SHEET_ROWS: u64 = 100;
const NEW_SHEET_COLUMNS: u64 = 20;

// ═══════════════════════════════════════════════════════════════
//  Spreadsheet id / A1 helpers
// ═══════════════════════════════════════════════════════════════

/// Extract the spreadsheet id from a `.../spreadsheets/d/<id>/...` URL.
/// Anything without that marker is taken as a bare id.
pub fn parse_spreadsheet_id(url: &str) -> Result<String, StoreError> {
    let url = url.trim();
    let id = match url.split_once("/spreadsheets/d/") {
        Some((_, rest)) => rest.split(['/', '?', '#']).next().unwrap_or_default(),
        None => url,
    };
    if id.is_empty() || id.contains(['/', ' ']) {
        return Err(StoreError::rejected(format!("not a spreadsheet url or id: '{url}'")));
    }
    Ok(id.to_string())
}

/// A1 range over a sheet title: `'Sheet ''1'''!1:1`.
fn a1(title: &str, range: &str) -> String {
    format!("'{}'!{range}", title.replace('\'', "''"))
}

/// Cell value for `valueInputOption=RAW`: scalars pass through,
/// null is an empty cell, nested values are written as JSON text.
fn cell(value: &Value) -> Value {
    match value {
        Value::Null => Value::String(String::new()),
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
    }
}

fn header_cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════
//  Error classification
// ═══════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    reason: String,
}

/// Map a non-success HTTP response onto the store error taxonomy.
fn classify(status: u16, body: &str) -> StoreError {
    let (message, haystack) = match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(ApiErrorBody { error }) => {
            let mut haystack = format!("{} {}", error.message, error.status);
            for detail in &error.errors {
                haystack.push(' ');
                haystack.push_str(&detail.reason);
            }
            (error.message, haystack.to_lowercase())
        }
        Err(_) => {
            let text: String = body.trim().chars().take(200).collect();
            (text.clone(), text.to_lowercase())
        }
    };
    let message = format!("HTTP {status}: {message}");

    match status {
        429 => StoreError::rate_limited(message),
        401 | 408 | 500..=599 => StoreError::unavailable(message),
        403 if haystack.contains("ratelimitexceeded") => StoreError::rate_limited(message),
        403 if haystack.contains("quota") => StoreError::quota_exceeded(message),
        403 => StoreError::permission_denied(message),
        _ => StoreError::rejected(message),
    }
}

// ═══════════════════════════════════════════════════════════════
//  API payloads
// ═══════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct Spreadsheet {
    #[serde(default)]
    sheets: Vec<Sheet>,
}

#[derive(Deserialize)]
struct Sheet {
    properties: SheetProperties,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    #[serde(default)]
    sheet_id: i64,
    title: String,
    #[serde(default)]
    grid_properties: GridProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridProperties {
    #[serde(default)]
    column_count: u64,
}

#[derive(Deserialize)]
struct BatchUpdateResponse {
    #[serde(default)]
    replies: Vec<Reply>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reply {
    #[serde(default)]
    add_sheet: Option<AddSheetReply>,
}

#[derive(Deserialize)]
struct AddSheetReply {
    properties: SheetProperties,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

// ═══════════════════════════════════════════════════════════════
//  GoogleSheetsStore
// ═══════════════════════════════════════════════════════════════

/// Google Sheets `TabularStore`: один лист на stream, первая строка = header.
///
/// Только транспорт и классификация ошибок. Retry/backoff делает engine.
pub struct GoogleSheetsStore {
    http: reqwest::Client,
    base_url: String,
    spreadsheet_id: String,
    token: String,
}

impl GoogleSheetsStore {
    pub fn new(
        spreadsheet: &str,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::unavailable(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            spreadsheet_id: parse_spreadsheet_id(spreadsheet)?,
            token: access_token.into(),
        })
    }

    /// Point the client at another endpoint (proxies, emulators).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn spreadsheet_id(&self) -> &str {
        &self.spreadsheet_id
    }

    /// `{base}/{spreadsheet_id}/{segments...}` with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| StoreError::rejected(format!("base url '{}': {e}", self.base_url)))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| StoreError::rejected(format!("base url '{}' cannot be a base", self.base_url)))?;
            path.pop_if_empty().push(&self.spreadsheet_id);
            path.extend(segments);
        }
        Ok(url)
    }

    /// Выполнить запрос и разобрать JSON-ответ; ошибки классифицируются.
    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<T, StoreError> {
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(&self.token)
            .query(query);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| StoreError::unavailable(format!("request: {e}")))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| StoreError::unavailable(format!("read response: {e}")))?;

        if !status.is_success() {
            return Err(classify(status.as_u16(), &text));
        }
        let text = if text.trim().is_empty() { "{}" } else { text.as_str() };
        serde_json::from_str(text)
            .map_err(|e| StoreError::unavailable(format!("unexpected response: {e}")))
    }

    async fn sheets(&self) -> Result<Vec<SheetProperties>, StoreError> {
        let spreadsheet: Spreadsheet = self
            .call(
                Method::GET,
                self.url(&[])?,
                &[("fields", "sheets.properties(sheetId,title,gridProperties.columnCount)")],
                None,
            )
            .await?;
        Ok(spreadsheet.sheets.into_iter().map(|s| s.properties).collect())
    }

    async fn batch_update(&self, request: Value) -> Result<BatchUpdateResponse, StoreError> {
        let url = self.url(&[])?;
        let url = Url::parse(&format!("{url}:batchUpdate"))
            .map_err(|e| StoreError::rejected(format!("batchUpdate url: {e}")))?;
        self.call(Method::POST, url, &[], Some(json!({ "requests": [request] })))
            .await
    }

    async fn add_sheet(&self, title: &str) -> Result<TableHandle, StoreError> {
        let reply = self
            .batch_update(json!({
                "addSheet": {
                    "properties": {
                        "title": title,
                        "gridProperties": {
                            "rowCount": NEW_SHEET_ROWS,
                            "columnCount": NEW_SHEET_COLUMNS,
                        }
                    }
                }
            }))
            .await?;
        reply
            .replies
            .into_iter()
            .find_map(|r| r.add_sheet)
            .map(|added| TableHandle::new(added.properties.sheet_id, added.properties.title))
            .ok_or_else(|| StoreError::unavailable(format!("addSheet '{title}': reply without properties")))
    }

    /// Дорастить сетку листа до `needed` колонок (header шире листа).
    async fn ensure_columns(&self, table: &TableHandle, needed: usize) -> Result<(), StoreError> {
        let current = self
            .sheets()
            .await?
            .into_iter()
            .find(|s| s.sheet_id == table.id)
            .map(|s| s.grid_properties.column_count)
            .ok_or_else(|| StoreError::rejected(format!("sheet {table} no longer exists")))?;
        let needed = needed as u64;
        if current >= needed {
            return Ok(());
        }
        tracing::debug!(table = %table, current, needed, "expanding sheet columns");
        self.batch_update(json!({
            "appendDimension": {
                "sheetId": table.id,
                "dimension": "COLUMNS",
                "length": needed - current,
            }
        }))
        .await?;
        Ok(())
    }
}

impl TabularStore for GoogleSheetsStore {
    fn ensure_table(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<TableHandle, StoreError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let ctx = format!("ensure table '{name}'");
            let existing = self.sheets().await.map_err(|e| e.with_context(&ctx))?;
            if let Some(sheet) = existing.into_iter().find(|s| s.title == name) {
                return Ok(TableHandle::new(sheet.sheet_id, sheet.title));
            }

            match self.add_sheet(&name).await {
                Ok(handle) => {
                    tracing::info!(table = %handle, "sheet created");
                    Ok(handle)
                }
                // Лист мог появиться между чтением и addSheet.
                Err(e) if e.message().contains("already exists") => {
                    let sheets = self.sheets().await.map_err(|e| e.with_context(&ctx))?;
                    sheets
                        .into_iter()
                        .find(|s| s.title == name)
                        .map(|s| TableHandle::new(s.sheet_id, s.title))
                        .ok_or_else(|| e.with_context(&ctx))
                }
                Err(e) => Err(e.with_context(&ctx)),
            }
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
            let ctx = format!("ensure header {table}");
            let range = a1(&table.name, "1:1");

            let current: ValueRange = self
                .call(Method::GET, self.url(&["values", range.as_str()])?, &[], None)
                .await
                .map_err(|e| e.with_context(&ctx))?;
            let existing: Vec<String> = current
                .values
                .first()
                .map(|row| row.iter().map(header_cell).collect())
                .unwrap_or_default();

            let merged = merge_header(&existing, &columns);
            if merged == existing {
                return Ok(merged);
            }

            self.ensure_columns(&table, merged.len())
                .await
                .map_err(|e| e.with_context(&ctx))?;
            let _: Value = self
                .call(
                    Method::PUT,
                    self.url(&["values", range.as_str()])?,
                    &[("valueInputOption", "RAW")],
                    Some(json!({ "range": range, "majorDimension": "ROWS", "values": [merged] })),
                )
                .await
                .map_err(|e| e.with_context(&ctx))?;
            tracing::debug!(table = %table, columns = merged.len(), "header written");
            Ok(merged)
        })
    }

    fn append_rows(
        &self,
        table: &TableHandle,
        rows: &[Row],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let table = table.clone();
        let values: Vec<Vec<Value>> = rows.iter().map(|r| r.iter().map(cell).collect()).collect();
        Box::pin(async move {
            if values.is_empty() {
                return Ok(());
            }
            let count = values.len();
            let target = format!("{}:append", a1(&table.name, "A1"));
            let _: Value = self
                .call(
                    Method::POST,
                    self.url(&["values", target.as_str()])?,
                    &[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")],
                    Some(json!({ "majorDimension": "ROWS", "values": values })),
                )
                .await
                .map_err(|e| e.with_context(format!("append {count} rows to {table}")))?;
            Ok(())
        })
    }
}
