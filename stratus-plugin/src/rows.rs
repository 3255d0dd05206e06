//! Turning raw provider records into typed rows.

use stratus_core::prelude::*;
use tracing::debug;

/// Resolve a dotted path (`"network.publicIp"`, `"disks.0.size"`) in a record.
pub fn lookup_path<'a>(record: &'a RawRecord, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(record, |current, segment| match current {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn typed(column: &ColumnDef, raw: Option<&serde_json::Value>) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    match Value::from_json(raw, column.column_type) {
        Some(value) => value,
        None => {
            debug!(
                "Column '{}' expected {} but the provider returned {}",
                column.name, column.column_type, raw
            );
            Value::Null
        }
    }
}

/// Build a base row. Hydrated columns start out null.
pub fn build_row(table: &TableDefinition, scope: &Scope, record: &RawRecord) -> Row {
    let columns = table
        .columns
        .iter()
        .map(|column| {
            let value = match &column.transform {
                Transform::Field(path) => typed(column, lookup_path(record, path)),
                Transform::Scope => Value::String(scope.to_string()),
                Transform::Hydrated(_) => Value::Null,
                Transform::Fn(f) => typed(column, Some(&f(record))),
            };
            (column.name.clone(), value)
        })
        .collect();
    Row::new(columns)
}

/// Fill the hydrated columns of `row` from a detail record.
pub fn merge_hydrated(table: &TableDefinition, row: &mut Row, detail: &RawRecord) {
    for column in table.hydrated_columns() {
        if let Transform::Hydrated(path) = &column.transform {
            row.set(&column.name, typed(column, lookup_path(detail, path)));
        }
    }
}

/// Identity of the resource behind `row`, keyed by column name.
///
/// `None` when any identity column is null.
pub fn identity_of(row: &Row, columns: &[String]) -> Option<Identity> {
    let mut identity = Identity::default();
    for column in columns {
        let value = row.get(column).filter(|v| !v.is_null())?;
        identity.fields.insert(column.clone(), value.clone());
    }
    Some(identity)
}
