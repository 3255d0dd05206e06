//! Resource client adapter.
//!
//! Wraps a [`ResourceClient`] with the behaviour every scan relies on:
//!
//! - explicit cursor pagination ([`Paginator`]) that stops on
//!   [`Continuation::Done`], on cancellation, or when the caller stops pulling
//! - bounded exponential backoff for throttled and transient calls
//! - a [`RateLimitGate`] shared by all scopes so a throttled provider is not
//!   hit again by every scope the moment its own backoff expires
//! - translation of [`ClientError`] into the host-facing [`ScanError`]

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stratus_core::prelude::*;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

// ============================================================================
// Retry Policy
// ============================================================================

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max_delay`, but never shorter than the provider's
    /// `retry_after` hint.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 1u32 << attempt.min(16);
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        match retry_after {
            Some(hint) => backoff.max(hint),
            None => backoff,
        }
    }
}

// ============================================================================
// Shared Rate-Limit Gate
// ============================================================================

/// Cooldown shared by every call issued through one adapter.
#[derive(Debug, Default)]
pub struct RateLimitGate {
    cooldown_until: Mutex<Option<Instant>>,
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until any active cooldown has passed, or fail with
    /// [`ScanError::Cancelled`] once `cancel` fires.
    pub async fn wait(&self, cancel: &CancelToken) -> Result<()> {
        let until = *self.cooldown_until.lock().await;
        let Some(until) = until.filter(|until| *until > Instant::now()) else {
            return Ok(());
        };
        tokio::select! {
            _ = tokio::time::sleep_until(until) => Ok(()),
            _ = cancel.cancelled() => Err(ScanError::Cancelled),
        }
    }

    /// Extend the cooldown to at least `delay` from now.
    pub async fn throttle(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut guard = self.cooldown_until.lock().await;
        if guard.map_or(true, |current| current < until) {
            *guard = Some(until);
        }
    }

    pub async fn cooldown_remaining(&self) -> Option<Duration> {
        let until = (*self.cooldown_until.lock().await)?;
        until.checked_duration_since(Instant::now())
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
struct AdapterCounters {
    list_calls: AtomicU64,
    get_calls: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time view of the calls an adapter has issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub list_calls: u64,
    pub get_calls: u64,
    pub retries: u64,
}

impl AdapterStats {
    pub fn total_calls(&self) -> u64 {
        self.list_calls + self.get_calls
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Uniform, retrying access to a provider client.
///
/// Cloning is cheap; clones share the client, the rate-limit gate and the
/// counters.
#[derive(Clone)]
pub struct ResourceAdapter {
    client: Arc<dyn ResourceClient>,
    retry: RetryPolicy,
    gate: Arc<RateLimitGate>,
    counters: Arc<AdapterCounters>,
}

impl ResourceAdapter {
    pub fn new(client: Arc<dyn ResourceClient>, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            gate: Arc::new(RateLimitGate::new()),
            counters: Arc::new(AdapterCounters::default()),
        }
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            list_calls: self.counters.list_calls.load(Ordering::Relaxed),
            get_calls: self.counters.get_calls.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }

    /// Start a paginated listing. No call is issued until the first
    /// [`Paginator::next_page`].
    pub fn paginate(&self, kind: &str, scope: &Scope, filter: ApiFilter) -> Paginator {
        Paginator {
            adapter: self.clone(),
            kind: kind.to_string(),
            scope: scope.clone(),
            filter,
            cursor: Some(Cursor::Start),
            pages: 0,
        }
    }

    /// Fetch one resource by identity. An absent resource is
    /// [`ScanError::NotFound`].
    pub async fn get(
        &self,
        kind: &str,
        scope: &Scope,
        identity: &Identity,
        cancel: &CancelToken,
    ) -> Result<RawRecord> {
        let client = self.client.as_ref();
        let counters = self.counters.as_ref();
        let operation = format!("get {kind} [{identity}]");
        self.call(&operation, scope, cancel, move || {
            counters.get_calls.fetch_add(1, Ordering::Relaxed);
            client.get(kind, scope, identity)
        })
        .await
    }

    async fn list_page(
        &self,
        kind: &str,
        scope: &Scope,
        filter: &ApiFilter,
        cursor: &Cursor,
        cancel: &CancelToken,
    ) -> Result<Page> {
        let client = self.client.as_ref();
        let counters = self.counters.as_ref();
        let operation = format!("list {kind}");
        self.call(&operation, scope, cancel, move || {
            counters.list_calls.fetch_add(1, Ordering::Relaxed);
            client.list_page(kind, scope, filter, cursor)
        })
        .await
    }

    /// Issue a call, retrying throttled and transient failures.
    async fn call<T, F, Fut>(
        &self,
        operation: &str,
        scope: &Scope,
        cancel: &CancelToken,
        mut issue: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ClientError>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            self.gate.wait(cancel).await?;

            debug!("{} in scope '{}' (attempt {})", operation, scope, attempt + 1);
            let error = match issue().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            attempt += 1;
            if !error.is_retryable() || attempt >= self.retry.max_attempts {
                return Err(self.classify(error, attempt));
            }

            let retry_after = match &error {
                ClientError::RateLimited { retry_after } => *retry_after,
                _ => None,
            };
            let delay = self.retry.delay_for(attempt - 1, retry_after);
            if matches!(error, ClientError::RateLimited { .. }) {
                self.gate.throttle(delay).await;
            }

            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{} in scope '{}' failed ({}), retrying in {:?} ({}/{})",
                operation, scope, error, delay, attempt, self.retry.max_attempts
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
            }
        }
    }

    fn classify(&self, error: ClientError, attempts: u32) -> ScanError {
        match error {
            ClientError::Auth(message) => ScanError::Auth(message),
            ClientError::RateLimited { .. } => ScanError::RateLimitExceeded {
                attempts,
                message: format!("{} kept throttling requests", self.client.name()),
            },
            ClientError::NotFound(what) => ScanError::NotFound(what),
            ClientError::Transient(message) => {
                ScanError::Provider(format!("{message} (after {attempts} attempts)"))
            }
            ClientError::Provider(message) => ScanError::Provider(message),
        }
    }
}

// ============================================================================
// Pagination
// ============================================================================

/// Explicit cursor over a paginated listing.
pub struct Paginator {
    adapter: ResourceAdapter,
    kind: String,
    scope: Scope,
    filter: ApiFilter,
    /// `None` once the listing is exhausted.
    cursor: Option<Cursor>,
    pages: u64,
}

impl Paginator {
    /// Fetch the next page, or `None` once the provider reported the last one.
    pub async fn next_page(&mut self, cancel: &CancelToken) -> Result<Option<Vec<RawRecord>>> {
        let Some(cursor) = self.cursor.take() else {
            return Ok(None);
        };

        let page = match self
            .adapter
            .list_page(&self.kind, &self.scope, &self.filter, &cursor, cancel)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                // Keep the position so a caller may resume after a cancellation.
                self.cursor = Some(cursor);
                return Err(e);
            }
        };
        self.pages += 1;

        self.cursor = match page.next {
            Continuation::More(token) => {
                if cursor == Cursor::Token(token.clone()) {
                    return Err(ScanError::Provider(format!(
                        "{} pagination for {} did not advance past token '{}'",
                        self.adapter.client_name(),
                        self.kind,
                        token
                    )));
                }
                Some(Cursor::Token(token))
            }
            Continuation::Done => None,
        };

        debug!(
            "Fetched page {} of {} in scope '{}' ({} records, more: {})",
            self.pages,
            self.kind,
            self.scope,
            page.records.len(),
            self.cursor.is_some()
        );
        Ok(Some(page.records))
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.is_none()
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// Scripted client: replays a queue of list responses.
    struct ScriptedClient {
        responses: StdMutex<Vec<std::result::Result<Page, ClientError>>>,
        calls: AtomicU64,
    }

    impl ScriptedClient {
        fn new(mut responses: Vec<std::result::Result<Page, ClientError>>) -> Self {
            responses.reverse();
            Self {
                responses: StdMutex::new(responses),
                calls: AtomicU64::new(0),
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceClient for ScriptedClient {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn list_page(
            &self,
            _kind: &str,
            _scope: &Scope,
            _filter: &ApiFilter,
            _cursor: &Cursor,
        ) -> std::result::Result<Page, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ClientError::Provider("script exhausted".into())))
        }

        async fn get(
            &self,
            _kind: &str,
            _scope: &Scope,
            _identity: &Identity,
        ) -> std::result::Result<RawRecord, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::NotFound("nothing here".into()))
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }

    fn page(ids: &[&str], next: Option<&str>) -> std::result::Result<Page, ClientError> {
        Ok(Page {
            records: ids.iter().map(|id| json!({ "id": id })).collect(),
            next: match next {
                Some(token) => Continuation::More(token.to_string()),
                None => Continuation::Done,
            },
        })
    }

    #[test]
    fn test_delay_for_grows_and_caps() {
        let policy = fast_retry(5);
        assert_eq!(policy.delay_for(0, None), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(80));
        assert_eq!(policy.delay_for(10, None), Duration::from_millis(100));
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
    }

    #[tokio::test]
    async fn test_paginator_follows_tokens_until_done() {
        let client = Arc::new(ScriptedClient::new(vec![
            page(&["a", "b"], Some("t1")),
            page(&["c"], Some("t2")),
            page(&[], None),
        ]));
        let adapter = ResourceAdapter::new(client.clone(), fast_retry(3));
        let mut pager = adapter.paginate("instances", &Scope::region("r1"), ApiFilter::default());
        let cancel = CancelToken::new();

        let mut ids = Vec::new();
        while let Some(records) = pager.next_page(&cancel).await.unwrap() {
            ids.extend(records.into_iter().map(|r| r["id"].as_str().unwrap().to_string()));
        }

        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(pager.is_exhausted());
        assert_eq!(pager.pages_fetched(), 3);
        assert_eq!(client.calls(), 3);

        // Exhausted paginators issue no further calls
        assert!(pager.next_page(&cancel).await.unwrap().is_none());
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_paginator_rejects_repeated_token() {
        let client = Arc::new(ScriptedClient::new(vec![
            page(&["a"], Some("t1")),
            page(&["b"], Some("t1")),
        ]));
        let adapter = ResourceAdapter::new(client, fast_retry(3));
        let mut pager = adapter.paginate("instances", &Scope::region("r1"), ApiFilter::default());
        let cancel = CancelToken::new();

        assert!(pager.next_page(&cancel).await.unwrap().is_some());
        let err = pager.next_page(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provider);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retried_then_succeeds() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ClientError::RateLimited { retry_after: None }),
            Err(ClientError::RateLimited { retry_after: None }),
            page(&["a"], None),
        ]));
        let adapter = ResourceAdapter::new(client.clone(), fast_retry(5));
        let mut pager = adapter.paginate("instances", &Scope::region("r1"), ApiFilter::default());

        let records = pager.next_page(&CancelToken::new()).await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(client.calls(), 3);
        assert_eq!(adapter.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhausted() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ClientError::RateLimited { retry_after: None }),
            Err(ClientError::RateLimited { retry_after: None }),
            Err(ClientError::RateLimited { retry_after: None }),
        ]));
        let adapter = ResourceAdapter::new(client.clone(), fast_retry(3));
        let mut pager = adapter.paginate("instances", &Scope::region("r1"), ApiFilter::default());

        let err = pager.next_page(&CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, ScanError::RateLimitExceeded { attempts: 3, .. }));
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_auth_error_not_retried() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ClientError::Auth("token expired".into())),
            page(&["a"], None),
        ]));
        let adapter = ResourceAdapter::new(client.clone(), fast_retry(5));
        let mut pager = adapter.paginate("instances", &Scope::region("r1"), ApiFilter::default());

        let err = pager.next_page(&CancelToken::new()).await.unwrap_err();
        assert_eq!(err, ScanError::Auth("token expired".into()));
        assert_eq!(client.calls(), 1);
        assert_eq!(adapter.stats().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhausted_becomes_provider_error() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ClientError::Transient("502".into())),
            Err(ClientError::Transient("502".into())),
        ]));
        let adapter = ResourceAdapter::new(client, fast_retry(2));
        let mut pager = adapter.paginate("instances", &Scope::region("r1"), ApiFilter::default());

        let err = pager.next_page(&CancelToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert!(err.to_string().contains("after 2 attempts"));
    }

    #[tokio::test]
    async fn test_cancelled_before_call_issues_nothing() {
        let client = Arc::new(ScriptedClient::new(vec![page(&["a"], None)]));
        let adapter = ResourceAdapter::new(client.clone(), fast_retry(3));
        let mut pager = adapter.paginate("instances", &Scope::region("r1"), ApiFilter::default());

        let cancel = CancelToken::new();
        cancel.cancel();

        let err = pager.next_page(&cancel).await.unwrap_err();
        assert_eq!(err, ScanError::Cancelled);
        assert_eq!(client.calls(), 0);
        assert!(!pager.is_exhausted());
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let adapter = ResourceAdapter::new(client, fast_retry(3));

        let err = adapter
            .get(
                "instances/{id}",
                &Scope::region("r1"),
                &Identity::single("id", "abc"),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(adapter.stats().get_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_shares_cooldown() {
        let gate = RateLimitGate::new();
        assert!(gate.cooldown_remaining().await.is_none());

        gate.throttle(Duration::from_secs(5)).await;
        // A shorter throttle never shortens an active cooldown
        gate.throttle(Duration::from_secs(1)).await;
        let remaining = gate.cooldown_remaining().await.unwrap();
        assert!(remaining > Duration::from_secs(4));

        let before = Instant::now();
        gate.wait(&CancelToken::new()).await.unwrap();
        assert!(Instant::now() - before >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_wait_stops_on_cancel() {
        let gate = Arc::new(RateLimitGate::new());
        gate.throttle(Duration::from_secs(60)).await;

        let cancel = CancelToken::new();
        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let before = Instant::now();
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(ScanError::Cancelled));
        assert!(Instant::now() - before < Duration::from_secs(1));
        // The cooldown itself is untouched
        assert!(gate.cooldown_remaining().await.unwrap() > Duration::from_secs(50));
    }
}
