//! Record validation against the subset of JSON Schema that tap schemas use:
//! `type`, `required`, `enum`, `format`, plus `properties`, `items` and
//! `anyOf` for walking nested structure.
//!
//! Anything outside that subset is accepted as-is. Values are never coerced:
//! `"1"` does not satisfy `{"type": "integer"}`.

use chrono::{DateTime, NaiveDate, NaiveTime};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Violation {
    /// JSONPath-like location, `$` is the record itself.
    pub path: String,
    pub reason: String,
}

impl Violation {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self { path: path.to_string(), reason: reason.into() }
    }
}

pub(crate) fn validate_record(schema: &Value, record: &Map<String, Value>) -> Result<(), Violation> {
    let Value::Object(schema) = schema else {
        return Ok(());
    };
    if let Some(types) = schema.get("type") {
        if !type_allows(types, "object", |t| t == "object") {
            return Err(Violation::new("$", format!("expected {}, got object", describe(types))));
        }
    }
    check_object(schema, record, "$")
}

fn validate_value(schema: &Value, value: &Value, path: &str) -> Result<(), Violation> {
    // `true` and other non-object schemas accept everything.
    let Value::Object(schema) = schema else {
        return Ok(());
    };

    if let Some(types) = schema.get("type") {
        let actual = json_type(value);
        if !type_allows(types, actual, |t| matches_type(t, value)) {
            return Err(Violation::new(path, format!("expected {}, got {actual}", describe(types))));
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            return Err(Violation::new(path, format!("{value} is not one of {}", Value::Array(options.clone()))));
        }
    }

    if let Some(Value::Array(branches)) = schema.get("anyOf") {
        if !branches.iter().any(|b| validate_value(b, value, path).is_ok()) {
            return Err(Violation::new(path, "value matches none of the anyOf branches"));
        }
    }

    match value {
        Value::Object(map) => check_object(schema, map, path)?,
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_value(item_schema, item, &format!("{path}[{i}]"))?;
                }
            }
        }
        Value::String(s) => {
            if let Some(Value::String(format)) = schema.get("format") {
                check_format(format, s, path)?;
            }
        }
        _ => {}
    }

    Ok(())
}

fn check_object(schema: &Map<String, Value>, map: &Map<String, Value>, path: &str) -> Result<(), Violation> {
    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(name) {
                return Err(Violation::new(&child(path, name), "required property missing"));
            }
        }
    }

    if let Some(Value::Object(properties)) = schema.get("properties") {
        for (name, sub) in properties {
            if let Some(value) = map.get(name) {
                validate_value(sub, value, &child(path, name))?;
            }
        }
    }

    Ok(())
}

fn check_format(format: &str, s: &str, path: &str) -> Result<(), Violation> {
    let ok = match format {
        "date-time" => DateTime::parse_from_rfc3339(s).is_ok(),
        "date" => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
        "time" => NaiveTime::parse_from_str(s, "%H:%M:%S%.f").is_ok(),
        "email" => is_email(s),
        // Unknown formats (singer.decimal, uri, ...) are annotations only.
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(Violation::new(path, format!("'{s}' is not a valid {format}")))
    }
}

fn is_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !s.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

/// `type` may be a single name or a list of names.
fn type_allows(types: &Value, actual: &str, matches: impl Fn(&str) -> bool) -> bool {
    match types {
        Value::String(t) => matches(t) || t == actual,
        Value::Array(list) => list
            .iter()
            .filter_map(Value::as_str)
            .any(|t| matches(t) || t == actual),
        // Malformed `type` keyword: nothing to enforce.
        _ => true,
    }
}

fn matches_type(t: &str, value: &Value) -> bool {
    match t {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "integer" => is_integer(value),
        "number" => value.is_number(),
        "string" => value.is_string(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

fn is_integer(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
        }
        _ => false,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe(types: &Value) -> String {
    match types {
        Value::String(t) => t.clone(),
        Value::Array(list) => list
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" | "),
        other => other.to_string(),
    }
}

fn child(path: &str, name: &str) -> String {
    format!("{path}.{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("test record must be an object"),
        }
    }

    fn users_schema() -> Value {
        json!({
            "type": "object",
            "required": ["id"],
            "properties": {
                "id": {"type": "integer"},
                "name": {"type": ["null", "string"]},
                "status": {"enum": ["active", "disabled"]},
                "created_at": {"type": "string", "format": "date-time"},
                "email": {"type": "string", "format": "email"},
                "address": {
                    "type": "object",
                    "properties": {"zip": {"type": "string"}}
                },
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        })
    }

    #[test]
    fn accepts_conforming_record() {
        let r = record(json!({
            "id": 7,
            "name": null,
            "status": "active",
            "created_at": "2024-01-02T03:04:05Z",
            "email": "a@b.io",
            "address": {"zip": "10115"},
            "tags": ["x", "y"]
        }));
        assert_eq!(validate_record(&users_schema(), &r), Ok(()));
    }

    #[test]
    fn integer_accepts_whole_floats_only() {
        let schema = users_schema();
        assert!(validate_record(&schema, &record(json!({"id": 3.0}))).is_ok());
        let err = validate_record(&schema, &record(json!({"id": 3.5}))).unwrap_err();
        assert_eq!(err.path, "$.id");
    }

    #[test]
    fn rejects_type_mismatch_without_coercion() {
        let err = validate_record(&users_schema(), &record(json!({"id": "1"}))).unwrap_err();
        assert_eq!(err.path, "$.id");
        assert_eq!(err.reason, "expected integer, got string");
    }

    #[test]
    fn rejects_missing_required() {
        let err = validate_record(&users_schema(), &record(json!({"name": "a"}))).unwrap_err();
        assert_eq!(err.path, "$.id");
        assert_eq!(err.reason, "required property missing");
    }

    #[test]
    fn rejects_enum_and_format_violations() {
        let schema = users_schema();
        let err = validate_record(&schema, &record(json!({"id": 1, "status": "gone"}))).unwrap_err();
        assert_eq!(err.path, "$.status");

        let err = validate_record(&schema, &record(json!({"id": 1, "created_at": "monday"}))).unwrap_err();
        assert_eq!(err.path, "$.created_at");

        let err = validate_record(&schema, &record(json!({"id": 1, "email": "nope"}))).unwrap_err();
        assert_eq!(err.path, "$.email");
    }

    #[test]
    fn walks_nested_objects_and_arrays() {
        let schema = users_schema();
        let err = validate_record(&schema, &record(json!({"id": 1, "address": {"zip": 10115}}))).unwrap_err();
        assert_eq!(err.path, "$.address.zip");

        let err = validate_record(&schema, &record(json!({"id": 1, "tags": ["ok", 2]}))).unwrap_err();
        assert_eq!(err.path, "$.tags[1]");
    }

    #[test]
    fn any_of_accepts_matching_branch() {
        let schema = json!({
            "properties": {
                "amount": {"anyOf": [{"type": "null"}, {"type": "number"}]}
            }
        });
        assert!(validate_record(&schema, &record(json!({"amount": null}))).is_ok());
        assert!(validate_record(&schema, &record(json!({"amount": 1.5}))).is_ok());
        assert!(validate_record(&schema, &record(json!({"amount": "x"}))).is_err());
    }

    #[test]
    fn unknown_formats_are_ignored() {
        let schema = json!({"properties": {"d": {"type": "string", "format": "singer.decimal"}}});
        assert!(validate_record(&schema, &record(json!({"d": "12.5"}))).is_ok());
    }
}
