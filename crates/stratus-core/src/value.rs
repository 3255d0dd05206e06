//! Typed column values and their conversion from raw provider JSON.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// Semantic type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Int,
    Double,
    Bool,
    Timestamp,
    Json,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::String => "string",
            ColumnType::Int => "int",
            ColumnType::Double => "double",
            ColumnType::Bool => "bool",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Json => "json",
        };
        f.write_str(name)
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a raw JSON value into a value of the given column type.
    ///
    /// Returns `None` when the JSON cannot represent that type. JSON `null`
    /// always converts to [`Value::Null`].
    pub fn from_json(raw: &serde_json::Value, ty: ColumnType) -> Option<Value> {
        use serde_json::Value as Json;

        if raw.is_null() {
            return Some(Value::Null);
        }

        match ty {
            ColumnType::String => match raw {
                Json::String(s) => Some(Value::String(s.clone())),
                Json::Number(n) => Some(Value::String(n.to_string())),
                Json::Bool(b) => Some(Value::String(b.to_string())),
                _ => None,
            },
            ColumnType::Int => match raw {
                Json::Number(n) => n.as_i64().map(Value::Int),
                Json::String(s) => s.trim().parse::<i64>().ok().map(Value::Int),
                _ => None,
            },
            ColumnType::Double => match raw {
                Json::Number(n) => n.as_f64().map(Value::Double),
                Json::String(s) => s.trim().parse::<f64>().ok().map(Value::Double),
                _ => None,
            },
            ColumnType::Bool => match raw {
                Json::Bool(b) => Some(Value::Bool(*b)),
                Json::String(s) => match s.to_ascii_lowercase().as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            ColumnType::Timestamp => match raw {
                Json::String(s) => DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| Value::Timestamp(dt.with_timezone(&Utc))),
                // Epoch seconds
                Json::Number(n) => n
                    .as_i64()
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                    .map(Value::Timestamp),
                _ => None,
            },
            ColumnType::Json => Some(Value::Json(raw.clone())),
        }
    }

    /// Convert a literal to the given column type, e.g. an RFC 3339 string
    /// into a timestamp.
    pub fn coerce(&self, ty: ColumnType) -> Option<Value> {
        match (self, ty) {
            (Value::Json(raw), _) => Value::from_json(raw, ty),
            (other, ty) => Value::from_json(&other.to_json(), ty),
        }
    }

    /// Render the value as JSON for the wire.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::Json(v) => v.clone(),
        }
    }

    /// Render the value as a provider API parameter.
    pub fn to_param_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Double(d) => d.to_string(),
            Value::String(s) => s.clone(),
            Value::Timestamp(ts) => ts.to_rfc3339(),
            Value::Json(v) => v.to_string(),
        }
    }

    /// Order two values of compatible types. `Null` and JSON documents are
    /// not ordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
            (Value::Double(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// SQL-style equality: `Null` equals nothing, numeric types compare by value.
    pub fn sql_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Json(a), Value::Json(b)) => a == b,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::String(s) => write!(f, "'{s}'"),
            other => f.write_str(&other.to_param_string()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_lenient_numbers() {
        assert_eq!(
            Value::from_json(&json!("42"), ColumnType::Int),
            Some(Value::Int(42))
        );
        assert_eq!(
            Value::from_json(&json!(7), ColumnType::String),
            Some(Value::String("7".into()))
        );
        assert_eq!(Value::from_json(&json!("seven"), ColumnType::Int), None);
    }

    #[test]
    fn test_from_json_timestamp() {
        let parsed = Value::from_json(&json!("2024-01-01T00:00:00Z"), ColumnType::Timestamp);
        let epoch = Value::from_json(&json!(1704067200), ColumnType::Timestamp);
        assert!(matches!(parsed, Some(Value::Timestamp(_))));
        assert_eq!(parsed, epoch);
    }

    #[test]
    fn test_null_is_null_for_every_type() {
        for ty in [
            ColumnType::String,
            ColumnType::Int,
            ColumnType::Bool,
            ColumnType::Timestamp,
            ColumnType::Json,
        ] {
            assert_eq!(Value::from_json(&json!(null), ty), Some(Value::Null));
        }
    }

    #[test]
    fn test_sql_eq_ignores_null() {
        assert!(!Value::Null.sql_eq(&Value::Null));
        assert!(Value::Int(3).sql_eq(&Value::Double(3.0)));
        assert!(!Value::from("a").sql_eq(&Value::from("b")));
    }

    #[test]
    fn test_compare_mixed_types() {
        assert_eq!(Value::from("a").compare(&Value::Int(1)), None);
        assert_eq!(
            Value::Int(1).compare(&Value::Int(2)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_serialize_timestamp_as_rfc3339() {
        let ts = Utc.timestamp_opt(0, 0).single().unwrap();
        let json = serde_json::to_string(&Value::Timestamp(ts)).unwrap();
        assert_eq!(json, r#""1970-01-01T00:00:00+00:00""#);
    }
}
