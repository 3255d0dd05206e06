//! Scan requests, qualifiers, rows and the events a scan produces.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::value::Value;
use crate::{ErrorKind, ScanError, SchemaError};

// ============================================================================
// Qualifiers
// ============================================================================

/// Predicate operators that can be pushed down by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "<>")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }

    /// Whether the operator tests membership when given a list of values.
    pub fn accepts_list(&self) -> bool {
        matches!(self, Operator::Eq | Operator::Ne)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = SchemaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "=" | "==" => Ok(Operator::Eq),
            "<>" | "!=" => Ok(Operator::Ne),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            other => Err(SchemaError::UnsupportedOperator(other.to_string())),
        }
    }
}

/// The literal side of a qualifier.
#[derive(Debug, Clone, PartialEq)]
pub enum QualValue {
    Single(Value),
    /// `IN` / `NOT IN` list; only valid with [`Operator::Eq`] and [`Operator::Ne`].
    List(Vec<Value>),
}

impl QualValue {
    pub fn values(&self) -> &[Value] {
        match self {
            QualValue::Single(v) => std::slice::from_ref(v),
            QualValue::List(vs) => vs,
        }
    }
}

/// A predicate on one column supplied by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Qualifier {
    pub column: String,
    pub operator: Operator,
    pub value: QualValue,
}

impl Qualifier {
    pub fn new(column: &str, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            column: column.to_string(),
            operator,
            value: QualValue::Single(value.into()),
        }
    }

    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::new(column, Operator::Eq, value)
    }

    pub fn in_list(column: &str, values: Vec<Value>) -> Self {
        Self {
            column: column.to_string(),
            operator: Operator::Eq,
            value: QualValue::List(values),
        }
    }

    /// Evaluate the qualifier against a column value with SQL semantics:
    /// a null value never matches.
    pub fn matches(&self, value: &Value) -> bool {
        if value.is_null() {
            return false;
        }

        let literals = self.value.values();
        match self.operator {
            Operator::Eq => literals.iter().any(|lit| value.sql_eq(lit)),
            Operator::Ne => literals.iter().all(|lit| {
                !lit.is_null() && value.compare(lit).is_some() && !value.sql_eq(lit)
            }),
            Operator::Lt => Self::ordered(value, literals, Ordering::is_lt),
            Operator::Le => Self::ordered(value, literals, Ordering::is_le),
            Operator::Gt => Self::ordered(value, literals, Ordering::is_gt),
            Operator::Ge => Self::ordered(value, literals, Ordering::is_ge),
        }
    }

    fn ordered(value: &Value, literals: &[Value], test: fn(Ordering) -> bool) -> bool {
        literals
            .iter()
            .all(|lit| value.compare(lit).is_some_and(test))
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            QualValue::Single(v) => write!(f, "{} {} {}", self.column, self.operator, v),
            QualValue::List(vs) => {
                let rendered: Vec<String> = vs.iter().map(|v| v.to_string()).collect();
                write!(f, "{} {} ({})", self.column, self.operator, rendered.join(", "))
            }
        }
    }
}

// ============================================================================
// Scan Request
// ============================================================================

/// A single scan issued by the host.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub table: String,
    pub quals: Vec<Qualifier>,
    /// Requested columns; empty means all columns.
    pub columns: Vec<String>,
    pub limit: Option<usize>,
    pub cancel: CancelToken,
}

impl ScanRequest {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            quals: Vec::new(),
            columns: Vec::new(),
            limit: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_qual(mut self, qual: Qualifier) -> Self {
        self.quals.push(qual);
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

// ============================================================================
// Rows and Events
// ============================================================================

/// One result row. Holds a value for every column of its table, in table order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
    hydrate_error: Option<String>,
}

impl Row {
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        Self {
            columns,
            hydrate_error: None,
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn set(&mut self, column: &str, value: Value) {
        if let Some(slot) = self.columns.iter_mut().find(|(name, _)| name == column) {
            slot.1 = value;
        }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn columns(&self) -> &[(String, Value)] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Error recorded when this row's hydration call failed.
    pub fn hydrate_error(&self) -> Option<&str> {
        self.hydrate_error.as_deref()
    }

    pub fn mark_hydrate_error(&mut self, message: String) {
        self.hydrate_error = Some(message);
    }
}

struct OrderedColumns<'a>(&'a [(String, Value)]);

impl Serialize for OrderedColumns<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("columns", &OrderedColumns(&self.columns))?;
        map.serialize_entry("hydrate_error", &self.hydrate_error)?;
        map.end()
    }
}

/// A scope whose contribution to a scan ended in an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeFailure {
    pub scope: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ScopeFailure {
    pub fn new(scope: &str, error: &ScanError) -> Self {
        Self {
            scope: scope.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Summary attached to the end of every scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub scan_id: Uuid,
    pub table: String,
    /// `"list"` or `"get"`.
    pub strategy: String,
    pub scopes: Vec<String>,
    pub rows_emitted: u64,
    pub rows_dropped: u64,
    pub rows_with_hydrate_errors: u64,
    pub failures: Vec<ScopeFailure>,
    /// The row limit cut the scan short.
    pub truncated: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl ScanSummary {
    pub fn new(scan_id: Uuid, table: &str, strategy: &str, scopes: Vec<String>) -> Self {
        Self {
            scan_id,
            table: table.to_string(),
            strategy: strategy.to_string(),
            scopes,
            rows_emitted: 0,
            rows_dropped: 0,
            rows_with_hydrate_errors: 0,
            failures: Vec::new(),
            truncated: false,
            cancelled: false,
            duration_ms: 0,
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// An element of the stream returned by a scan.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Row(Row),
    /// End of data.
    Done(ScanSummary),
    /// Terminal failure; no further events follow.
    Failed {
        error: ScanError,
        summary: ScanSummary,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_parse() {
        assert_eq!("=".parse::<Operator>().unwrap(), Operator::Eq);
        assert_eq!("!=".parse::<Operator>().unwrap(), Operator::Ne);
        assert_eq!(
            "LIKE".parse::<Operator>(),
            Err(SchemaError::UnsupportedOperator("LIKE".to_string()))
        );
    }

    #[test]
    fn test_operator_serde() {
        assert_eq!(serde_json::to_string(&Operator::Ge).unwrap(), r#"">=""#);
        let op: Operator = serde_json::from_str(r#""<>""#).unwrap();
        assert_eq!(op, Operator::Ne);
    }

    #[test]
    fn test_qualifier_matches() {
        assert!(Qualifier::eq("state", "running").matches(&Value::from("running")));
        assert!(!Qualifier::eq("state", "running").matches(&Value::Null));
        assert!(Qualifier::new("cpus", Operator::Ge, 4i64).matches(&Value::Int(4)));
        assert!(!Qualifier::new("cpus", Operator::Lt, 4i64).matches(&Value::Int(4)));
        assert!(Qualifier::new("state", Operator::Ne, "stopped").matches(&Value::from("running")));
    }

    #[test]
    fn test_qualifier_in_list() {
        let qual = Qualifier::in_list("id", vec![Value::from("a"), Value::from("b")]);
        assert!(qual.matches(&Value::from("b")));
        assert!(!qual.matches(&Value::from("c")));

        let not_in = Qualifier {
            operator: Operator::Ne,
            ..qual
        };
        assert!(not_in.matches(&Value::from("c")));
        assert!(!not_in.matches(&Value::from("a")));
    }

    #[test]
    fn test_row_serializes_in_column_order() {
        let row = Row::new(vec![
            ("zeta".to_string(), Value::Int(1)),
            ("alpha".to_string(), Value::Null),
        ]);
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"columns":{"zeta":1,"alpha":null},"hydrate_error":null}"#);
    }

    #[test]
    fn test_row_set_ignores_unknown_column() {
        let mut row = Row::new(vec![("id".to_string(), Value::Null)]);
        row.set("id", Value::from("abc"));
        row.set("missing", Value::from("x"));
        assert_eq!(row.get("id"), Some(&Value::from("abc")));
        assert_eq!(row.len(), 1);
    }

    #[test]
    fn test_request_builder() {
        let request = ScanRequest::new("instances")
            .with_qual(Qualifier::eq("id", "abc"))
            .with_columns(["id", "name"])
            .with_limit(10);
        assert_eq!(request.table, "instances");
        assert_eq!(request.quals.len(), 1);
        assert_eq!(request.columns, vec!["id", "name"]);
        assert_eq!(request.limit, Some(10));
        assert!(!request.cancel.is_cancelled());
    }
}
