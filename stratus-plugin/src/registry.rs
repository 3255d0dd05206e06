//! # Table Registry
//!
//! Holds the table definitions a plugin exposes to the host.
//!
//! The registry is built once at start-up from a fixed list of definitions and
//! is read-only afterwards, so scans share it behind an `Arc` without locking.
//! Structural mistakes in a definition (duplicate names, handlers that refer to
//! undeclared columns) are programmer errors and are rejected at registration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use stratus_core::prelude::*;
use thiserror::Error;

/// A table definition that cannot be registered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Table '{0}' is already registered")]
    DuplicateTable(String),

    #[error("Table '{table}' declares column '{column}' more than once")]
    DuplicateColumn { table: String, column: String },

    #[error("Table '{table}' has no columns")]
    NoColumns { table: String },

    #[error("Table '{table}': {role} refers to undeclared column '{column}'")]
    UndeclaredColumn {
        table: String,
        role: &'static str,
        column: String,
    },

    #[error("Table '{table}': {reason}")]
    InvalidHydration { table: String, reason: String },
}

/// Registry of table definitions, keyed by table name.
///
/// # Example
///
/// ```no_run
/// use stratus_plugin::registry::TableRegistry;
///
/// let registry = TableRegistry::from_tables(provider_compute::tables()).unwrap();
/// let instances = registry.lookup("instances").unwrap();
/// println!("{} has {} columns", instances.name, instances.columns.len());
/// ```
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: HashMap<String, Arc<TableDefinition>>,
}

impl TableRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }

    /// Build a registry from a list of definitions, failing on the first
    /// invalid one.
    pub fn from_tables(
        tables: impl IntoIterator<Item = TableDefinition>,
    ) -> std::result::Result<Self, RegistryError> {
        let mut registry = Self::new();
        for table in tables {
            registry.register(table)?;
        }
        Ok(registry)
    }

    /// Register a table definition.
    pub fn register(&mut self, table: TableDefinition) -> std::result::Result<(), RegistryError> {
        if self.tables.contains_key(&table.name) {
            return Err(RegistryError::DuplicateTable(table.name));
        }
        Self::validate(&table)?;

        tracing::debug!(
            "Registered table '{}' ({} columns)",
            table.name,
            table.columns.len()
        );
        self.tables.insert(table.name.clone(), Arc::new(table));
        Ok(())
    }

    fn validate(table: &TableDefinition) -> std::result::Result<(), RegistryError> {
        if table.columns.is_empty() {
            return Err(RegistryError::NoColumns {
                table: table.name.clone(),
            });
        }

        let mut seen = HashSet::new();
        for column in &table.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(RegistryError::DuplicateColumn {
                    table: table.name.clone(),
                    column: column.name.clone(),
                });
            }
        }

        let undeclared = |role: &'static str, column: &str| RegistryError::UndeclaredColumn {
            table: table.name.clone(),
            role,
            column: column.to_string(),
        };

        for filter in &table.list.filters {
            if !seen.contains(filter.column.as_str()) {
                return Err(undeclared("list filter", &filter.column));
            }
        }

        if let Some(get) = &table.get {
            for key in &get.key_columns {
                if !seen.contains(key.as_str()) {
                    return Err(undeclared("get key", key));
                }
            }
        }

        let hydrated_columns = table.hydrated_columns().count();
        match &table.hydrate {
            Some(hydrate) => {
                if hydrated_columns == 0 {
                    return Err(RegistryError::InvalidHydration {
                        table: table.name.clone(),
                        reason: "hydrate handler declared but no column is hydrated".to_string(),
                    });
                }
                if hydrate.identity_columns.is_empty() {
                    return Err(RegistryError::InvalidHydration {
                        table: table.name.clone(),
                        reason: "hydrate handler has no identity columns".to_string(),
                    });
                }
                for column in &hydrate.identity_columns {
                    match table.column(column) {
                        None => return Err(undeclared("hydrate identity", column)),
                        Some(def) if def.transform.is_hydrated() => {
                            return Err(RegistryError::InvalidHydration {
                                table: table.name.clone(),
                                reason: format!(
                                    "identity column '{column}' is itself hydrated"
                                ),
                            })
                        }
                        Some(_) => {}
                    }
                }
            }
            None if hydrated_columns > 0 => {
                return Err(RegistryError::InvalidHydration {
                    table: table.name.clone(),
                    reason: "hydrated columns declared without a hydrate handler".to_string(),
                });
            }
            None => {}
        }

        Ok(())
    }

    /// Look up a table by name.
    pub fn lookup(&self, name: &str) -> Result<Arc<TableDefinition>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| ScanError::Schema(SchemaError::UnknownTable(name.to_string())))
    }

    /// Host-facing schema of every table, sorted by name.
    pub fn summaries(&self) -> Vec<TableSummary> {
        let mut summaries: Vec<TableSummary> =
            self.tables.values().map(|t| t.summary()).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// List all registered table names.
    pub fn list(&self) -> Vec<&str> {
        self.tables.keys().map(|s| s.as_str()).collect()
    }

    /// Get the number of registered tables.
    pub fn count(&self) -> usize {
        self.tables.len()
    }

    /// Check if a table with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }
}
