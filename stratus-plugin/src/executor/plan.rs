//! Request validation and access-path selection.
//!
//! Planning is pure: it never touches the network, so every structural
//! problem with a request is reported before a single call is issued.

use std::collections::HashSet;
use std::sync::Arc;
use stratus_core::prelude::*;

/// How rows are fetched in every scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// One direct fetch per identity.
    Get { identities: Vec<Identity> },
    /// A paginated listing with the pushed-down filter.
    List { filter: ApiFilter },
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Get { .. } => "get",
            Strategy::List { .. } => "list",
        }
    }
}

/// A validated scan, ready to run.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub table: Arc<TableDefinition>,
    pub scopes: Vec<Scope>,
    pub strategy: Strategy,
    /// Qualifiers evaluated locally on base columns, before hydration.
    pub base_filter: Vec<Qualifier>,
    /// Qualifiers evaluated locally on hydrated columns, after hydration.
    pub hydrated_filter: Vec<Qualifier>,
    /// Whether rows go through the hydration pipeline.
    pub hydrate: bool,
    pub limit: Option<usize>,
}

impl ScanPlan {
    pub fn scope_names(&self) -> Vec<String> {
        self.scopes.iter().map(|s| s.to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty() || self.limit == Some(0)
    }
}

fn matches_all(quals: &[Qualifier], row: &Row) -> bool {
    quals
        .iter()
        .all(|q| row.get(&q.column).is_some_and(|v| q.matches(v)))
}

impl ScanPlan {
    pub fn passes_base_filter(&self, row: &Row) -> bool {
        matches_all(&self.base_filter, row)
    }

    pub fn passes_hydrated_filter(&self, row: &Row) -> bool {
        matches_all(&self.hydrated_filter, row)
    }
}

// ============================================================================
// Validation
// ============================================================================

fn validate_projection(table: &TableDefinition, columns: &[String]) -> Result<()> {
    match columns.iter().find(|c| !table.has_column(c)) {
        Some(missing) => Err(ScanError::unknown_column(&table.name, missing)),
        None => Ok(()),
    }
}

/// Check a qualifier against the table and coerce its literals to the column
/// type.
fn validate_qualifier(table: &TableDefinition, qual: &Qualifier) -> Result<Qualifier> {
    let column = table
        .column(&qual.column)
        .ok_or_else(|| ScanError::unknown_column(&table.name, &qual.column))?;

    if let QualValue::List(values) = &qual.value {
        if !qual.operator.accepts_list() {
            return Err(SchemaError::InvalidOperand {
                column: qual.column.clone(),
                operator: qual.operator,
                reason: "a list of values".to_string(),
            }
            .into());
        }
        if values.is_empty() {
            return Err(SchemaError::InvalidOperand {
                column: qual.column.clone(),
                operator: qual.operator,
                reason: "an empty list".to_string(),
            }
            .into());
        }
    }

    let coerce = |literal: &Value| -> Result<Value> {
        match literal.coerce(column.column_type) {
            Some(value) if !value.is_null() => Ok(value),
            _ => Err(SchemaError::InvalidLiteral {
                column: column.name.clone(),
                expected: column.column_type,
                value: literal.to_string(),
            }
            .into()),
        }
    };

    let value = match &qual.value {
        QualValue::Single(literal) => QualValue::Single(coerce(literal)?),
        QualValue::List(literals) => {
            QualValue::List(literals.iter().map(coerce).collect::<Result<Vec<_>>>()?)
        }
    };

    Ok(Qualifier {
        column: qual.column.clone(),
        operator: qual.operator,
        value,
    })
}

// ============================================================================
// Planning
// ============================================================================

/// Validate `request` against `table` and choose scopes and strategy.
pub fn plan(
    table: Arc<TableDefinition>,
    request: &ScanRequest,
    regions: &[String],
    page_size: u32,
) -> Result<ScanPlan> {
    validate_projection(&table, &request.columns)?;
    let mut remaining = request
        .quals
        .iter()
        .map(|q| validate_qualifier(&table, q))
        .collect::<Result<Vec<_>>>()?;

    let scopes = select_scopes(&table, regions, &mut remaining);
    let strategy = match take_identities(&table, &mut remaining) {
        Some(identities) => Strategy::Get { identities },
        None => Strategy::List {
            filter: push_down(&table, &mut remaining, page_size, request.limit),
        },
    };

    let (hydrated_filter, base_filter): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|q| {
        table
            .column(&q.column)
            .is_some_and(|c| c.transform.is_hydrated())
    });

    let hydrate = table.hydrate.is_some()
        && (!hydrated_filter.is_empty() || projects_hydrated(&table, &request.columns));

    Ok(ScanPlan {
        table,
        scopes,
        strategy,
        base_filter,
        hydrated_filter,
        hydrate,
        limit: request.limit,
    })
}

fn projects_hydrated(table: &TableDefinition, columns: &[String]) -> bool {
    if columns.is_empty() {
        return table.hydrated_columns().next().is_some();
    }
    columns
        .iter()
        .any(|c| table.column(c).is_some_and(|def| def.transform.is_hydrated()))
}

/// Every configured region, narrowed by equality qualifiers on scope columns.
///
/// Narrowing qualifiers hold by construction and are removed from `quals`.
fn select_scopes(
    table: &TableDefinition,
    regions: &[String],
    quals: &mut Vec<Qualifier>,
) -> Vec<Scope> {
    if table.fan_out == FanOut::Single {
        return vec![Scope::global()];
    }

    let mut scopes: Vec<Scope> = regions.iter().map(|r| Scope::region(r)).collect();
    quals.retain(|qual| {
        if qual.operator != Operator::Eq || !table.is_scope_column(&qual.column) {
            return true;
        }
        let wanted: HashSet<String> =
            qual.value.values().iter().map(Value::to_param_string).collect();
        scopes.retain(|scope| wanted.contains(scope.as_str()));
        false
    });
    scopes
}

/// Identities for a direct get, when every key column is equality-constrained.
///
/// The qualifiers used are removed from `quals`; further qualifiers on the
/// same key column stay behind as local filters.
fn take_identities(table: &TableDefinition, quals: &mut Vec<Qualifier>) -> Option<Vec<Identity>> {
    let keys = table.key_columns();
    if keys.is_empty() {
        return None;
    }

    let positions: Vec<usize> = keys
        .iter()
        .map(|key| {
            quals
                .iter()
                .position(|q| &q.column == key && q.operator == Operator::Eq)
        })
        .collect::<Option<Vec<_>>>()?;

    let mut identities = vec![Identity::default()];
    for (key, &pos) in keys.iter().zip(&positions) {
        let values = quals[pos].value.values();
        identities = identities
            .iter()
            .flat_map(|partial| {
                values.iter().map(move |value| {
                    let mut identity = partial.clone();
                    identity.fields.insert(key.clone(), value.clone());
                    identity
                })
            })
            .collect();
    }
    // Duplicate literals in an IN list would fetch the same resource twice
    let mut unique: Vec<Identity> = Vec::with_capacity(identities.len());
    for identity in identities {
        if !unique.contains(&identity) {
            unique.push(identity);
        }
    }

    let mut used = positions;
    used.sort_unstable();
    for pos in used.into_iter().rev() {
        quals.remove(pos);
    }
    Some(unique)
}

/// Translate supported qualifiers into API parameters, leaving the rest.
fn push_down(
    table: &TableDefinition,
    quals: &mut Vec<Qualifier>,
    page_size: u32,
    limit: Option<usize>,
) -> ApiFilter {
    let mut filter = ApiFilter::default();
    let mut pushed_columns = HashSet::new();

    quals.retain(|qual| {
        if pushed_columns.contains(&qual.column) {
            return true;
        }
        let Some(list_filter) = table.list_filter(&qual.column, qual.operator) else {
            return true;
        };
        filter.params.push(FilterParam {
            param: list_filter.param.clone(),
            operator: qual.operator,
            values: qual.value.values().to_vec(),
        });
        pushed_columns.insert(qual.column.clone());
        false
    });

    // A page never needs to exceed the limit unless rows may be filtered out locally
    let page = match limit {
        Some(limit) if quals.is_empty() && table.hydrate.is_none() => {
            page_size.min(u32::try_from(limit).unwrap_or(u32::MAX)).max(1)
        }
        _ => page_size,
    };
    filter.page_size = Some(page);
    filter
}
