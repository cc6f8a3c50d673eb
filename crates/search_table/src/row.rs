//! Row values and their document encoding.
//!
//! A row is a list of [`Value`]s in the column order the engine asked for.
//! Documents indexed before a column existed simply lack the field; such
//! columns decode to [`Value::Null`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;

use crate::error::{ConnectorError, Result};
use crate::gateway::Document;
use crate::schema::FieldType;

/// One row in caller-given column order.
pub type Row = Vec<Value>;

/// Scalar cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    String(String),
    /// Milliseconds since the Unix epoch, UTC.
    Timestamp(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Document representation of this value.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Int(v) => JsonValue::from(*v),
            Self::Long(v) => JsonValue::from(*v),
            Self::Float(v) => JsonValue::from(f64::from(*v)),
            Self::Double(v) => JsonValue::from(*v),
            Self::Boolean(v) => JsonValue::from(*v),
            Self::String(v) => JsonValue::from(v.as_str()),
            Self::Timestamp(millis) => match DateTime::<Utc>::from_timestamp_millis(*millis) {
                Some(ts) => JsonValue::from(ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
                None => JsonValue::from(*millis),
            },
        }
    }

    /// Decodes a document value as `field_type`. Multi-valued fields yield
    /// their first element.
    pub fn from_json(field_type: &FieldType, value: &JsonValue) -> Option<Self> {
        let value = match value {
            JsonValue::Array(items) => match items.first() {
                Some(first) => first,
                None => return Some(Self::Null),
            },
            other => other,
        };
        if value.is_null() {
            return Some(Self::Null);
        }
        match field_type {
            FieldType::Int => as_i64(value)
                .and_then(|v| i32::try_from(v).ok())
                .map(Self::Int),
            FieldType::Long => as_i64(value).map(Self::Long),
            FieldType::Float => as_f64(value).map(|v| Self::Float(v as f32)),
            FieldType::Double => as_f64(value).map(Self::Double),
            FieldType::Boolean => match value {
                JsonValue::Bool(v) => Some(Self::Boolean(*v)),
                JsonValue::String(v) => v.parse::<bool>().ok().map(Self::Boolean),
                _ => None,
            },
            FieldType::String | FieldType::Custom(_) => Some(Self::String(match value {
                JsonValue::String(v) => v.clone(),
                other => other.to_string(),
            })),
            FieldType::Timestamp => match value {
                JsonValue::String(v) => DateTime::parse_from_rfc3339(v)
                    .ok()
                    .map(|ts| Self::Timestamp(ts.timestamp_millis())),
                other => as_i64(other).map(Self::Timestamp),
            },
        }
    }
}

fn as_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Name and type of one requested column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub field_type: FieldType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Decodes a document into `columns` order.
pub fn decode_row(document: &Document, columns: &[ColumnSpec]) -> Result<Row> {
    columns
        .iter()
        .map(|column| match document.get(&column.name) {
            None => Ok(Value::Null),
            Some(raw) => Value::from_json(&column.field_type, raw).ok_or_else(|| {
                ConnectorError::Scan(format!(
                    "field '{}' value {raw} does not decode as {}",
                    column.name, column.field_type
                ))
            }),
        })
        .collect()
}

/// Encodes a row as a document; null cells are omitted.
pub fn encode_row(columns: &[ColumnSpec], row: &[Value]) -> Result<Document> {
    if columns.len() != row.len() {
        return Err(ConnectorError::Configuration(format!(
            "row has {} values for {} columns",
            row.len(),
            columns.len()
        )));
    }
    Ok(columns
        .iter()
        .zip(row)
        .filter(|(_, value)| !value.is_null())
        .map(|(column, value)| (column.name.clone(), value.to_json()))
        .collect())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode_row, encode_row, ColumnSpec, Value};
    use crate::error::ConnectorError;
    use crate::schema::FieldType;

    fn columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("id", FieldType::String),
            ColumnSpec::new("qty", FieldType::Int),
            ColumnSpec::new("price", FieldType::Double),
            ColumnSpec::new("added_later", FieldType::Long),
        ]
    }

    #[test]
    fn missing_fields_decode_to_null() {
        let doc = json!({"id": "7", "qty": 3, "price": 9.5}).as_object().cloned().unwrap();
        let row = decode_row(&doc, &columns()).unwrap();
        assert_eq!(
            row,
            vec![
                Value::String("7".to_string()),
                Value::Int(3),
                Value::Double(9.5),
                Value::Null,
            ]
        );
    }

    #[test]
    fn multi_valued_and_string_encoded_numbers_decode() {
        let doc = json!({"id": ["a", "b"], "qty": "4", "price": [1.5]})
            .as_object()
            .cloned()
            .unwrap();
        let row = decode_row(&doc, &columns()).unwrap();
        assert_eq!(row[0], Value::String("a".to_string()));
        assert_eq!(row[1], Value::Int(4));
        assert_eq!(row[2], Value::Double(1.5));
    }

    #[test]
    fn mismatched_value_is_a_scan_error() {
        let doc = json!({"qty": "many"}).as_object().cloned().unwrap();
        assert!(matches!(
            decode_row(&doc, &columns()),
            Err(ConnectorError::Scan(_))
        ));
    }

    #[test]
    fn timestamps_encode_as_rfc3339_and_decode_back() {
        let value = Value::Timestamp(1_700_000_000_123);
        let encoded = value.to_json();
        assert_eq!(encoded, json!("2023-11-14T22:13:20.123Z"));
        assert_eq!(
            Value::from_json(&FieldType::Timestamp, &encoded),
            Some(Value::Timestamp(1_700_000_000_123))
        );
    }

    #[test]
    fn encode_row_skips_nulls_and_checks_arity() {
        let doc = encode_row(
            &columns(),
            &[
                Value::String("1".to_string()),
                Value::Int(2),
                Value::Null,
                Value::Long(5),
            ],
        )
        .unwrap();
        assert_eq!(doc.len(), 3);
        assert!(!doc.contains_key("price"));
        assert!(encode_row(&columns(), &[Value::Null]).is_err());
    }
}
