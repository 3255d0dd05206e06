//! # provider-fixture
//!
//! An in-memory [`ResourceClient`] for testing and development.
//!
//! Records are registered per `(kind, scope)` and served in pages of a fixed
//! size. Faults (auth failures, throttling, transient errors) can be injected
//! per scope or per resource, and every call is recorded so tests can assert
//! exactly which calls a scan issued.
//!
//! ```
//! use provider_fixture::{Fault, FixtureClient};
//! use serde_json::json;
//!
//! let client = FixtureClient::new()
//!     .with_records("instances", "region-1", vec![json!({ "id": "a" }), json!({ "id": "b" })])
//!     .with_page_size(1)
//!     .fail_scope("region-2", Fault::Auth);
//! assert_eq!(client.total_calls(), 0);
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use stratus_core::prelude::*;

/// An injectable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Auth,
    RateLimited,
    Transient,
    Provider,
    NotFound,
}

impl Fault {
    fn to_error(self, what: &str) -> ClientError {
        match self {
            Fault::Auth => ClientError::Auth(format!("fixture denied access to {what}")),
            Fault::RateLimited => ClientError::RateLimited { retry_after: None },
            Fault::Transient => ClientError::Transient(format!("fixture hiccup on {what}")),
            Fault::Provider => ClientError::Provider(format!("fixture failure on {what}")),
            Fault::NotFound => ClientError::NotFound(what.to_string()),
        }
    }
}

#[derive(Debug)]
struct FaultRule {
    scope: Option<String>,
    kind: Option<String>,
    identity: Option<Identity>,
    fault: Fault,
    /// Remaining triggers; `None` fails forever.
    remaining: Option<u32>,
}

impl FaultRule {
    fn applies(&self, kind: &str, scope: &Scope, identity: Option<&Identity>) -> bool {
        self.remaining != Some(0)
            && self.scope.as_deref().map_or(true, |s| s == scope.as_str())
            && self.kind.as_deref().map_or(true, |k| k == kind)
            && self.identity.as_ref().map_or(true, |id| Some(id) == identity)
    }
}

/// A call received by the fixture.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    List {
        kind: String,
        scope: String,
        filter: ApiFilter,
        cursor: Cursor,
    },
    Get {
        kind: String,
        scope: String,
        identity: Identity,
    },
}

impl Call {
    pub fn scope(&self) -> &str {
        match self {
            Call::List { scope, .. } | Call::Get { scope, .. } => scope,
        }
    }
}

/// In-memory resource client.
#[derive(Debug)]
pub struct FixtureClient {
    records: HashMap<(String, String), Vec<RawRecord>>,
    details: Vec<(String, String, Identity, RawRecord)>,
    page_size: usize,
    latency: Option<Duration>,
    faults: Mutex<Vec<FaultRule>>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for FixtureClient {
    fn default() -> Self {
        Self::new()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolve a dotted path in a record.
fn lookup<'a>(record: &'a RawRecord, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(record, |current, segment| current.get(segment))
}

fn json_param(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn column_type_of(value: &Value) -> ColumnType {
    match value {
        Value::Bool(_) => ColumnType::Bool,
        Value::Int(_) => ColumnType::Int,
        Value::Double(_) => ColumnType::Double,
        Value::Timestamp(_) => ColumnType::Timestamp,
        Value::Json(_) => ColumnType::Json,
        Value::Null | Value::String(_) => ColumnType::String,
    }
}

/// Evaluate a pushed-down filter the way the real API would.
fn matches_param(record: &RawRecord, param: &FilterParam) -> bool {
    let (Some(raw), Some(first)) = (lookup(record, &param.param), param.values.first()) else {
        return false;
    };
    let Some(field) = Value::from_json(raw, column_type_of(first)) else {
        return false;
    };
    let value = match param.values.as_slice() {
        [single] => QualValue::Single(single.clone()),
        many => QualValue::List(many.to_vec()),
    };
    Qualifier {
        column: param.param.clone(),
        operator: param.operator,
        value,
    }
    .matches(&field)
}

fn matches_identity(record: &RawRecord, identity: &Identity) -> bool {
    identity
        .fields
        .iter()
        .all(|(field, value)| record.get(field).map(json_param) == Some(value.to_param_string()))
}

impl FixtureClient {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            details: Vec::new(),
            page_size: 100,
            latency: None,
            faults: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Serve `records` for list calls of `kind` in `scope`.
    pub fn with_records(mut self, kind: &str, scope: &str, records: Vec<RawRecord>) -> Self {
        self.records
            .entry((kind.to_string(), scope.to_string()))
            .or_default()
            .extend(records);
        self
    }

    /// Serve `record` for a get of `kind` with exactly this identity.
    pub fn with_detail(
        mut self,
        kind: &str,
        scope: &str,
        identity: Identity,
        record: RawRecord,
    ) -> Self {
        self.details
            .push((kind.to_string(), scope.to_string(), identity, record));
        self
    }

    /// Largest page the fixture returns.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn push_fault(&self, rule: FaultRule) {
        locked(&self.faults).push(rule);
    }

    /// Fail every call in `scope`.
    pub fn fail_scope(self, scope: &str, fault: Fault) -> Self {
        self.push_fault(FaultRule {
            scope: Some(scope.to_string()),
            kind: None,
            identity: None,
            fault,
            remaining: None,
        });
        self
    }

    /// Fail the next `times` calls in `scope`.
    pub fn fail_scope_times(self, scope: &str, fault: Fault, times: u32) -> Self {
        self.push_fault(FaultRule {
            scope: Some(scope.to_string()),
            kind: None,
            identity: None,
            fault,
            remaining: Some(times),
        });
        self
    }

    /// Fail every get of `kind` for `identity`, in any scope.
    pub fn fail_get(self, kind: &str, identity: Identity, fault: Fault) -> Self {
        self.push_fault(FaultRule {
            scope: None,
            kind: Some(kind.to_string()),
            identity: Some(identity),
            fault,
            remaining: None,
        });
        self
    }

    // ------------------------------------------------------------------------
    // Call log
    // ------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<Call> {
        locked(&self.calls).clone()
    }

    pub fn total_calls(&self) -> usize {
        locked(&self.calls).len()
    }

    pub fn list_calls(&self) -> usize {
        locked(&self.calls)
            .iter()
            .filter(|c| matches!(c, Call::List { .. }))
            .count()
    }

    pub fn get_calls(&self) -> usize {
        locked(&self.calls)
            .iter()
            .filter(|c| matches!(c, Call::Get { .. }))
            .count()
    }

    pub fn calls_in_scope(&self, scope: &str) -> usize {
        locked(&self.calls).iter().filter(|c| c.scope() == scope).count()
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Serving
    // ------------------------------------------------------------------------

    /// Record the call, wait out the latency, then apply any matching fault.
    async fn enter(
        &self,
        call: Call,
        kind: &str,
        scope: &Scope,
        identity: Option<&Identity>,
    ) -> std::result::Result<(), ClientError> {
        locked(&self.calls).push(call);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut faults = locked(&self.faults);
        let Some(rule) = faults.iter_mut().find(|rule| rule.applies(kind, scope, identity)) else {
            return Ok(());
        };
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        let error = rule.fault.to_error(&format!("{kind} in {scope}"));
        Err(error)
    }
}

#[async_trait]
impl ResourceClient for FixtureClient {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn list_page(
        &self,
        kind: &str,
        scope: &Scope,
        filter: &ApiFilter,
        cursor: &Cursor,
    ) -> std::result::Result<Page, ClientError> {
        let call = Call::List {
            kind: kind.to_string(),
            scope: scope.to_string(),
            filter: filter.clone(),
            cursor: cursor.clone(),
        };
        self.enter(call, kind, scope, None).await?;

        let offset = match cursor {
            Cursor::Start => 0,
            Cursor::Token(token) => token
                .strip_prefix("offset:")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| ClientError::Provider(format!("invalid page token '{token}'")))?,
        };
        let page_size = filter
            .page_size
            .map_or(self.page_size, |p| (p as usize).clamp(1, self.page_size));

        let matching: Vec<&RawRecord> = self
            .records
            .get(&(kind.to_string(), scope.to_string()))
            .map(|records| {
                records
                    .iter()
                    .filter(|r| filter.params.iter().all(|p| matches_param(r, p)))
                    .collect()
            })
            .unwrap_or_default();

        let end = (offset + page_size).min(matching.len());
        let records = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|r| (*r).clone())
            .collect();
        let next = if end < matching.len() {
            Continuation::More(format!("offset:{end}"))
        } else {
            Continuation::Done
        };
        Ok(Page { records, next })
    }

    async fn get(
        &self,
        kind: &str,
        scope: &Scope,
        identity: &Identity,
    ) -> std::result::Result<RawRecord, ClientError> {
        let call = Call::Get {
            kind: kind.to_string(),
            scope: scope.to_string(),
            identity: identity.clone(),
        };
        self.enter(call, kind, scope, Some(identity)).await?;

        let detail = self
            .details
            .iter()
            .find(|(k, s, id, _)| k == kind && s == scope.as_str() && id == identity)
            .map(|(_, _, _, record)| record.clone());
        if let Some(record) = detail {
            return Ok(record);
        }

        // `instances/{id}` resolves against the listed `instances` records
        let mut parts = kind.split('/');
        let base = parts.next().unwrap_or_default();
        if parts.all(|p| p.starts_with('{') && p.ends_with('}')) {
            if let Some(record) = self
                .records
                .get(&(base.to_string(), scope.to_string()))
                .and_then(|records| records.iter().find(|r| matches_identity(r, identity)))
            {
                return Ok(record.clone());
            }
        }

        Err(ClientError::NotFound(format!("{kind} [{identity}] in {scope}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> FixtureClient {
        FixtureClient::new().with_records(
            "instances",
            "region-1",
            vec![
                json!({ "id": "a", "state": "running", "cpus": 2 }),
                json!({ "id": "b", "state": "stopped", "cpus": 4 }),
                json!({ "id": "c", "state": "running", "cpus": 8 }),
            ],
        )
    }

    fn ids(page: Page) -> Vec<String> {
        page.records.iter().map(|r| r["id"].as_str().unwrap().to_string()).collect()
    }

    #[tokio::test]
    async fn test_pages_by_offset() {
        let client = client().with_page_size(2);
        let scope = Scope::region("region-1");

        let first = client
            .list_page("instances", &scope, &ApiFilter::default(), &Cursor::Start)
            .await
            .unwrap();
        assert_eq!(first.next, Continuation::More("offset:2".to_string()));
        assert_eq!(ids(first), vec!["a", "b"]);

        let second = client
            .list_page(
                "instances",
                &scope,
                &ApiFilter::default(),
                &Cursor::Token("offset:2".into()),
            )
            .await
            .unwrap();
        assert_eq!(second.next, Continuation::Done);
        assert_eq!(ids(second), vec!["c"]);
        assert_eq!(client.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_scope_is_empty() {
        let page = client()
            .list_page(
                "instances",
                &Scope::region("region-9"),
                &ApiFilter::default(),
                &Cursor::Start,
            )
            .await
            .unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.next, Continuation::Done);
    }

    #[tokio::test]
    async fn test_filters_applied() {
        let filter = ApiFilter {
            params: vec![
                FilterParam {
                    param: "state".to_string(),
                    operator: Operator::Eq,
                    values: vec![Value::from("running")],
                },
                FilterParam {
                    param: "cpus".to_string(),
                    operator: Operator::Gt,
                    values: vec![Value::Int(2)],
                },
            ],
            page_size: None,
        };
        let page = client()
            .list_page("instances", &Scope::region("region-1"), &filter, &Cursor::Start)
            .await
            .unwrap();
        assert_eq!(ids(page), vec!["c"]);
    }

    #[tokio::test]
    async fn test_get_resolves_against_records() {
        let client = client();
        let scope = Scope::region("region-1");

        let record = client
            .get("instances/{id}", &scope, &Identity::single("id", "b"))
            .await
            .unwrap();
        assert_eq!(record["state"], "stopped");

        let err = client
            .get("instances/{id}", &scope, &Identity::single("id", "zz"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fault_times() {
        let client = client().fail_scope_times("region-1", Fault::RateLimited, 1);
        let scope = Scope::region("region-1");

        let err = client
            .list_page("instances", &scope, &ApiFilter::default(), &Cursor::Start)
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::RateLimited { retry_after: None });

        assert!(client
            .list_page("instances", &scope, &ApiFilter::default(), &Cursor::Start)
            .await
            .is_ok());
        assert_eq!(client.calls_in_scope("region-1"), 2);
    }

    #[tokio::test]
    async fn test_fail_get_targets_one_identity() {
        let client =
            client().fail_get("instances/{id}", Identity::single("id", "a"), Fault::Provider);
        let scope = Scope::region("region-1");

        assert!(client.get("instances/{id}", &scope, &Identity::single("id", "a")).await.is_err());
        assert!(client.get("instances/{id}", &scope, &Identity::single("id", "b")).await.is_ok());
    }
}
