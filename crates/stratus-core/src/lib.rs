//! # stratus-core
//!
//! Core traits and types shared by the Stratus query plugin and its providers.
//!
//! This crate defines the vocabulary that flows between the host-facing
//! executor and the provider-facing clients:
//!
//! - [`TableDefinition`] / [`ColumnDef`] - the static schema of a virtual table
//! - [`Qualifier`] / [`ScanRequest`] - what the host asks for
//! - [`Row`] / [`ScanEvent`] / [`ScanSummary`] - what the plugin streams back
//! - [`ResourceClient`] - the capability a cloud provider client must offer
//! - [`CancelToken`] - cooperative cancellation shared by every task of a scan

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod cancel;
mod client;
mod query;
mod schema;
mod value;

pub use cancel::CancelToken;
pub use client::{
    ApiFilter, ClientError, Continuation, Cursor, FilterParam, Identity, Page, RawRecord,
    ResourceClient, Scope,
};
pub use query::{
    Operator, QualValue, Qualifier, Row, ScanEvent, ScanRequest, ScanSummary, ScopeFailure,
};
pub use schema::{
    ColumnDef, ColumnSummary, FanOut, GetHandler, HydrateHandler, HydrationPolicy, ListFilter,
    ListHandler, TableDefinition, TableSummary, Transform, TransformFn,
};
pub use value::{ColumnType, Value};

// ============================================================================
// Error Types
// ============================================================================

/// Structural problems with a scan request, detected before any network call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Table not found: {0}")]
    UnknownTable(String),

    #[error("Column '{column}' does not exist in table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("Invalid literal for column '{column}' ({expected}): {value}")]
    InvalidLiteral {
        column: String,
        expected: ColumnType,
        value: String,
    },

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Operator '{operator}' on column '{column}' does not accept {reason}")]
    InvalidOperand {
        column: String,
        operator: Operator,
        reason: String,
    },
}

/// Errors surfaced by a scan to the host.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limit exceeded after {attempts} attempts: {message}")]
    RateLimitExceeded { attempts: u32, message: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Hydration failed: {0}")]
    Hydration(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Scan cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ScanError>;

/// Stable classification of a [`ScanError`], used in summaries and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Schema,
    Auth,
    RateLimitExceeded,
    NotFound,
    Hydration,
    Provider,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Schema => "schema",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Hydration => "hydration",
            ErrorKind::Provider => "provider",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::Schema(_) => ErrorKind::Schema,
            ScanError::Auth(_) => ErrorKind::Auth,
            ScanError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            ScanError::NotFound(_) => ErrorKind::NotFound,
            ScanError::Hydration(_) => ErrorKind::Hydration,
            ScanError::Provider(_) => ErrorKind::Provider,
            ScanError::Cancelled => ErrorKind::Cancelled,
            ScanError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn unknown_column(table: &str, column: &str) -> Self {
        ScanError::Schema(SchemaError::UnknownColumn {
            table: table.to_string(),
            column: column.to_string(),
        })
    }
}

// ============================================================================
// Re-exports
// ============================================================================

pub mod prelude {
    pub use crate::{
        ApiFilter, CancelToken, ClientError, ColumnDef, ColumnType, Continuation, Cursor,
        ErrorKind, FanOut, FilterParam, GetHandler, HydrateHandler, HydrationPolicy, Identity,
        ListFilter, ListHandler, Operator, Page, QualValue, Qualifier, RawRecord, ResourceClient,
        Result, Row, ScanError, ScanEvent, ScanRequest, ScanSummary, SchemaError, Scope,
        ScopeFailure, TableDefinition, TableSummary, Transform, Value,
    };
}
