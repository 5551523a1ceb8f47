use std::collections::HashMap;

use serde_json::{Map, Value};

use sink_api::Row;

use crate::error::SchemaError;
use crate::validate::validate_record;

// ═══════════════════════════════════════════════════════════════
//  Column layout
// ═══════════════════════════════════════════════════════════════

/// Columns appended to a stream's layout by one registry call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnDelta {
    pub added_columns: Vec<String>,
}

impl ColumnDelta {
    pub fn is_empty(&self) -> bool {
        self.added_columns.is_empty()
    }
}

/// A flattened column: `address.zip` reads `record["address"]["zip"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Column {
    name: String,
    path: Vec<String>,
}

impl Column {
    fn from_path(path: Vec<String>) -> Self {
        Self { name: path.join("."), path }
    }

    /// Column known only by its header name (adopted from the remote table).
    fn from_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: name.split('.').map(str::to_string).collect(),
        }
    }
}

/// Nested `properties` of a property schema, looking through `anyOf`
/// (the usual `[{"type":"null"}, {"type":"object",...}]` shape).
fn nested_properties(schema: &Value) -> Option<&Map<String, Value>> {
    if let Some(Value::Object(props)) = schema.get("properties") {
        if !props.is_empty() {
            return Some(props);
        }
    }
    schema
        .get("anyOf")
        .and_then(Value::as_array)
        .and_then(|branches| branches.iter().find_map(nested_properties))
}

fn flatten(props: &Map<String, Value>, prefix: &[String], out: &mut Vec<Column>) {
    for (name, sub) in props {
        let mut path = prefix.to_vec();
        path.push(name.clone());
        match nested_properties(sub) {
            Some(inner) => flatten(inner, &path, out),
            None => out.push(Column::from_path(path)),
        }
    }
}

/// Column layout implied by a schema, in `properties` order.
fn derive_columns(schema: &Value) -> Result<Vec<Column>, String> {
    if !schema.is_object() {
        return Err("schema must be a JSON object".into());
    }
    match schema.get("properties") {
        None => Ok(Vec::new()),
        Some(Value::Object(props)) => {
            let mut columns = Vec::new();
            flatten(props, &[], &mut columns);
            Ok(columns)
        }
        Some(_) => Err("'properties' must be an object".into()),
    }
}

/// Move the columns named in `order` to the front, in that order.
fn apply_order(columns: Vec<Column>, order: &[String]) -> Vec<Column> {
    let mut rest = columns;
    let mut ordered = Vec::with_capacity(rest.len());
    for name in order {
        if let Some(pos) = rest.iter().position(|c| &c.name == name) {
            ordered.push(rest.remove(pos));
        }
    }
    ordered.extend(rest);
    ordered
}

fn lookup<'a>(record: &'a Map<String, Value>, path: &[String]) -> Option<&'a Value> {
    let (first, tail) = path.split_first()?;
    let mut current = record.get(first)?;
    for key in tail {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

// ═══════════════════════════════════════════════════════════════
//  Registry
// ═══════════════════════════════════════════════════════════════

#[derive(Debug)]
struct StreamSchema {
    schema: Value,
    key_properties: Vec<String>,
    columns: Vec<Column>,
    /// Rows handed out under this layout. Once non-zero the order is frozen.
    rows_projected: u64,
}

/// Active schema and column layout per stream.
///
/// Layouts are append-only: a column, once known, keeps its position for
/// the rest of the run, even if a later schema drops the property.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    streams: HashMap<String, StreamSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store/replace the active schema. New properties append to the layout
    /// (in `column_order` first, then `properties` order).
    ///
    /// An invalid schema leaves the stream's previous state untouched.
    pub fn register(
        &mut self,
        stream: &str,
        schema: Value,
        key_properties: Vec<String>,
        column_order: Option<&[String]>,
    ) -> Result<ColumnDelta, SchemaError> {
        let mut derived = derive_columns(&schema).map_err(|reason| SchemaError::InvalidSchema {
            stream: stream.to_string(),
            reason,
        })?;
        if let Some(order) = column_order {
            derived = apply_order(derived, order);
        }

        let entry = self
            .streams
            .entry(stream.to_string())
            .or_insert_with(|| StreamSchema {
                schema: Value::Null,
                key_properties: Vec::new(),
                columns: Vec::new(),
                rows_projected: 0,
            });

        let mut delta = ColumnDelta::default();
        for column in derived {
            if !entry.columns.iter().any(|c| c.name == column.name) {
                delta.added_columns.push(column.name.clone());
                entry.columns.push(column);
            }
        }
        entry.schema = schema;
        entry.key_properties = key_properties;

        Ok(delta)
    }

    /// Validate `fields` against the active schema and project them onto the
    /// current column order. Missing fields become `null`, extra fields are
    /// dropped.
    pub fn validate(&mut self, stream: &str, fields: &Map<String, Value>) -> Result<Row, SchemaError> {
        let entry = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| SchemaError::UnknownStream(stream.to_string()))?;

        validate_record(&entry.schema, fields).map_err(|v| SchemaError::Validation {
            stream: stream.to_string(),
            path: v.path,
            reason: v.reason,
        })?;

        let row = entry
            .columns
            .iter()
            .map(|c| lookup(fields, &c.path).cloned().unwrap_or(Value::Null))
            .collect();
        entry.rows_projected += 1;
        Ok(row)
    }

    /// Reconcile the local layout with the header the remote table ended up
    /// with after `ensure_header`.
    ///
    /// - local layout is a prefix of `header`: remote-only columns append;
    /// - nothing projected yet: the remote order is adopted;
    /// - otherwise rows already projected would land under the wrong
    ///   headers, so it is a `HeaderConflict`.
    pub fn align(&mut self, stream: &str, header: &[String]) -> Result<ColumnDelta, SchemaError> {
        let entry = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| SchemaError::UnknownStream(stream.to_string()))?;

        let local: Vec<String> = entry.columns.iter().map(|c| c.name.clone()).collect();
        let covers_local = local.iter().all(|c| header.contains(c));

        if header.len() >= local.len() && header[..local.len()] == local[..] {
            let added: Vec<String> = header[local.len()..].to_vec();
            entry.columns.extend(added.iter().map(|n| Column::from_name(n)));
            return Ok(ColumnDelta { added_columns: added });
        }

        if entry.rows_projected == 0 && covers_local {
            let mut previous = std::mem::take(&mut entry.columns);
            let mut added = Vec::new();
            for name in header {
                match previous.iter().position(|c| &c.name == name) {
                    Some(pos) => entry.columns.push(previous.remove(pos)),
                    None => {
                        added.push(name.clone());
                        entry.columns.push(Column::from_name(name));
                    }
                }
            }
            return Ok(ColumnDelta { added_columns: added });
        }

        Err(SchemaError::HeaderConflict {
            stream: stream.to_string(),
            local,
            remote: header.to_vec(),
        })
    }

    pub fn columns(&self, stream: &str) -> Option<Vec<String>> {
        self.streams
            .get(stream)
            .map(|s| s.columns.iter().map(|c| c.name.clone()).collect())
    }

    /// Current number of columns; 0 for an unknown stream.
    pub fn width(&self, stream: &str) -> usize {
        self.streams.get(stream).map(|s| s.columns.len()).unwrap_or(0)
    }

    pub fn key_properties(&self, stream: &str) -> Option<&[String]> {
        self.streams.get(stream).map(|s| s.key_properties.as_slice())
    }
}
