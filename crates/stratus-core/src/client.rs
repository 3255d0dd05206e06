//! The capability a cloud provider client exposes to the executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::query::Operator;
use crate::value::Value;

/// A record exactly as returned by the provider API.
pub type RawRecord = serde_json::Value;

/// A fan-out unit: a region, or the implicit global scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope(pub String);

impl Scope {
    pub const GLOBAL: &'static str = "global";

    pub fn region(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn global() -> Self {
        Self(Self::GLOBAL.to_string())
    }

    pub fn is_global(&self) -> bool {
        self.0 == Self::GLOBAL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A qualifier translated into a provider API parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterParam {
    pub param: String,
    pub operator: Operator,
    pub values: Vec<Value>,
}

/// Server-side filtering and paging options for a list call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiFilter {
    pub params: Vec<FilterParam>,
    pub page_size: Option<u32>,
}

impl ApiFilter {
    pub fn param(&self, name: &str) -> Option<&FilterParam> {
        self.params.iter().find(|p| p.param == name)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Position in a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Start,
    Token(String),
}

/// What follows a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    More(String),
    Done,
}

/// One page of a listing.
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub next: Continuation,
}

impl Page {
    pub fn last(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            next: Continuation::Done,
        }
    }
}

/// Identity of a single resource, keyed by identity field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    pub fields: BTreeMap<String, Value>,
}

impl Identity {
    pub fn single(field: &str, value: impl Into<Value>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), value.into());
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Shortcut for the common `id` identity field.
    pub fn id(&self) -> Option<String> {
        self.get("id").map(Value::to_param_string)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={}", v.to_param_string()))
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// Errors a provider client reports. Only the adapter sees these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Provider error: {0}")]
    Provider(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::RateLimited { .. } | ClientError::Transient(_)
        )
    }
}

/// Capability-typed access to a cloud provider's resource APIs.
///
/// Implementations must be safe for concurrent use; the executor shares one
/// client across every scope of every scan.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Identifier for logging, e.g. `"compute"`.
    fn name(&self) -> &str;

    /// Fetch one page of resources of `kind` in `scope`.
    async fn list_page(
        &self,
        kind: &str,
        scope: &Scope,
        filter: &ApiFilter,
        cursor: &Cursor,
    ) -> Result<Page, ClientError>;

    /// Fetch a single resource of `kind` by identity.
    async fn get(
        &self,
        kind: &str,
        scope: &Scope,
        identity: &Identity,
    ) -> Result<RawRecord, ClientError>;
}
