//! Static table and column definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::client::RawRecord;
use crate::query::Operator;
use crate::value::ColumnType;

/// Custom column extraction from a raw provider record.
pub type TransformFn = fn(&RawRecord) -> serde_json::Value;

/// How a column value is obtained.
#[derive(Clone)]
pub enum Transform {
    /// Dotted JSON path into the list/get record, e.g. `"placement.zone"`.
    Field(String),
    /// The identifier of the scope the row was fetched from.
    Scope,
    /// Dotted JSON path into the hydration record.
    Hydrated(String),
    /// Arbitrary function of the list/get record.
    Fn(TransformFn),
}

impl Transform {
    pub fn field(path: &str) -> Self {
        Transform::Field(path.to_string())
    }

    pub fn hydrated(path: &str) -> Self {
        Transform::Hydrated(path.to_string())
    }

    pub fn is_hydrated(&self) -> bool {
        matches!(self, Transform::Hydrated(_))
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Field(path) => f.debug_tuple("Field").field(path).finish(),
            Transform::Scope => f.write_str("Scope"),
            Transform::Hydrated(path) => f.debug_tuple("Hydrated").field(path).finish(),
            Transform::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

/// A column of a virtual table.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub description: String,
    pub transform: Transform,
}

impl ColumnDef {
    /// A nullable column read from the field of the same name.
    pub fn new(name: &str, column_type: ColumnType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            nullable: true,
            description: description.to_string(),
            transform: Transform::field(name),
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// A list qualifier the provider API can evaluate natively.
#[derive(Debug, Clone)]
pub struct ListFilter {
    /// Column the qualifier must target.
    pub column: String,
    /// API parameter name.
    pub param: String,
    /// Operators the API accepts for this parameter.
    pub operators: Vec<Operator>,
}

impl ListFilter {
    pub fn equals(column: &str, param: &str) -> Self {
        Self {
            column: column.to_string(),
            param: param.to_string(),
            operators: vec![Operator::Eq],
        }
    }

    pub fn supports(&self, operator: Operator) -> bool {
        self.operators.contains(&operator)
    }
}

/// Descriptor of the list call backing a table.
#[derive(Debug, Clone)]
pub struct ListHandler {
    pub kind: String,
    pub filters: Vec<ListFilter>,
}

/// Descriptor of the single-item fetch backing a table.
#[derive(Debug, Clone)]
pub struct GetHandler {
    pub kind: String,
    /// Columns that must all be equality-constrained to use this handler.
    /// Each column name doubles as the identity field name.
    pub key_columns: Vec<String>,
}

/// What happens to a row whose hydration call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationPolicy {
    /// Emit the row with hydrated columns set to null and the error marker set.
    EmitPartial,
    /// Leave the row out of the result.
    Drop,
}

/// Descriptor of the per-row detail call.
#[derive(Debug, Clone)]
pub struct HydrateHandler {
    pub kind: String,
    /// Columns of the base row that identify the detail record.
    pub identity_columns: Vec<String>,
    pub policy: HydrationPolicy,
}

/// How a table partitions its data for concurrent scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOut {
    /// One sub-scan per configured region.
    PerRegion,
    /// A single implicit scope.
    Single,
}

/// A named, schema-typed virtual relation.
#[derive(Debug, Clone)]
pub struct TableDefinition {
    pub name: String,
    pub description: String,
    pub columns: Vec<ColumnDef>,
    pub list: ListHandler,
    pub get: Option<GetHandler>,
    pub hydrate: Option<HydrateHandler>,
    pub fan_out: FanOut,
}

impl TableDefinition {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Key columns enabling a direct get.
    pub fn key_columns(&self) -> &[String] {
        self.get
            .as_ref()
            .map(|g| g.key_columns.as_slice())
            .unwrap_or(&[])
    }

    /// The first list filter able to evaluate `operator` on `column`.
    pub fn list_filter(&self, column: &str, operator: Operator) -> Option<&ListFilter> {
        self.list
            .filters
            .iter()
            .find(|f| f.column == column && f.supports(operator))
    }

    pub fn is_scope_column(&self, column: &str) -> bool {
        self.column(column)
            .is_some_and(|c| matches!(c.transform, Transform::Scope))
    }

    pub fn hydrated_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.transform.is_hydrated())
    }

    pub fn summary(&self) -> TableSummary {
        let mut seen = HashSet::new();
        let filter_columns: Vec<String> = self
            .list
            .filters
            .iter()
            .filter(|f| seen.insert(f.column.as_str()))
            .map(|f| f.column.clone())
            .collect();

        TableSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| ColumnSummary {
                    name: c.name.clone(),
                    column_type: c.column_type,
                    nullable: c.nullable,
                    description: c.description.clone(),
                    hydrated: c.transform.is_hydrated(),
                })
                .collect(),
            key_columns: self.key_columns().to_vec(),
            filter_columns,
            fan_out: self.fan_out,
        }
    }
}

/// Host-facing description of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub nullable: bool,
    pub description: String,
    pub hydrated: bool,
}

/// Host-facing description of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    pub description: String,
    pub columns: Vec<ColumnSummary>,
    pub key_columns: Vec<String>,
    pub filter_columns: Vec<String>,
    pub fan_out: FanOut,
}
