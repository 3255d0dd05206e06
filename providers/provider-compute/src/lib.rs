//! # provider-compute
//!
//! Compute provider for Stratus.
//!
//! Talks to a regional compute REST API and exposes its resources as the
//! `instances`, `volumes` and `regions` tables (see [`tables`]).
//!
//! ## API shape
//!
//! - `GET {endpoint}/v1/regions/{region}/{kind}?pageToken=..&pageSize=..` lists
//!   resources of a region; `GET {endpoint}/v1/{kind}` lists global ones.
//! - List responses look like `{ "items": [...], "nextPageToken": "..." }`; a
//!   missing or empty token marks the last page.
//! - Single resources live under templated paths such as `instances/{id}`.
//! - Requests carry a bearer token.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use stratus_core::prelude::*;
use thiserror::Error;
use tracing::debug;
use url::Url;

mod tables;

pub use tables::{instances_table, regions_table, tables, volumes_table};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("Authentication rejected (HTTP {0})")]
    Unauthorized(u16),

    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Compute API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing identity field '{0}'")]
    MissingIdentity(String),
}

impl From<ComputeError> for ClientError {
    fn from(err: ComputeError) -> Self {
        match err {
            ComputeError::Http(e) if e.is_timeout() || e.is_connect() => {
                ClientError::Transient(e.to_string())
            }
            ComputeError::Http(e) => ClientError::Provider(e.to_string()),
            ComputeError::Unauthorized(status) => {
                ClientError::Auth(format!("compute API rejected the access token (HTTP {status})"))
            }
            ComputeError::RateLimited { retry_after } => ClientError::RateLimited { retry_after },
            ComputeError::NotFound(what) => ClientError::NotFound(what),
            e @ ComputeError::Server { .. } => ClientError::Transient(e.to_string()),
            e => ClientError::Provider(e.to_string()),
        }
    }
}

type Result<T> = std::result::Result<T, ComputeError>;

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<RawRecord>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl From<ListResponse> for Page {
    fn from(response: ListResponse) -> Self {
        let next = match response.next_page_token {
            Some(token) if !token.is_empty() => Continuation::More(token),
            _ => Continuation::Done,
        };
        Page {
            records: response.items,
            next,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the compute client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    /// Base URL of the compute API, e.g. `https://api.compute.example.com`.
    pub endpoint: String,

    /// Bearer token sent with every request.
    pub access_token: String,

    /// Per-request timeout.
    pub timeout: Duration,

    pub user_agent: String,
}

// ============================================================================
// Compute Client
// ============================================================================

/// [`ResourceClient`] over the compute REST API.
pub struct ComputeClient {
    endpoint: Url,
    access_token: String,
    client: Client,
}

impl ComputeClient {
    pub fn new(config: ComputeConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|_| ComputeError::InvalidEndpoint(config.endpoint.clone()))?;
        if endpoint.cannot_be_a_base() {
            return Err(ComputeError::InvalidEndpoint(config.endpoint));
        }

        let client = Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            endpoint,
            access_token: config.access_token,
            client,
        })
    }

    /// URL of `kind` in `scope`. Path segments of `kind` written as `{field}`
    /// are filled from `identity`.
    pub fn resource_url(
        &self,
        kind: &str,
        scope: &Scope,
        identity: Option<&Identity>,
    ) -> Result<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ComputeError::InvalidEndpoint(self.endpoint.to_string()))?;
            segments.pop_if_empty().push("v1");
            if !scope.is_global() {
                segments.push("regions").push(scope.as_str());
            }

            for part in kind.split('/').filter(|p| !p.is_empty()) {
                match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                    Some(field) => {
                        let value = identity
                            .and_then(|id| id.get(field))
                            .ok_or_else(|| ComputeError::MissingIdentity(field.to_string()))?;
                        segments.push(&value.to_param_string());
                    }
                    None => {
                        segments.push(part);
                    }
                }
            }
        }
        Ok(url)
    }

    fn list_url(
        &self,
        kind: &str,
        scope: &Scope,
        filter: &ApiFilter,
        cursor: &Cursor,
    ) -> Result<Url> {
        let mut pairs = Vec::new();
        if let Cursor::Token(token) = cursor {
            pairs.push(("pageToken".to_string(), token.clone()));
        }
        if let Some(size) = filter.page_size {
            pairs.push(("pageSize".to_string(), size.to_string()));
        }
        for param in &filter.params {
            let values: Vec<String> = param.values.iter().map(Value::to_param_string).collect();
            pairs.push((filter_key(param), values.join(",")));
        }

        let mut url = self.resource_url(kind, scope, None)?;
        // An empty query would leave a trailing '?'
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        Ok(url)
    }

    /// Make an authenticated GET request.
    async fn api_request<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<T> {
        debug!("Fetching compute API: {}", url);

        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, url.path(), message));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ComputeError::Parse(e.to_string()))
    }
}

/// API parameter name for a pushed-down filter.
fn filter_key(param: &FilterParam) -> String {
    let suffix = match param.operator {
        Operator::Eq => return param.param.clone(),
        Operator::Ne => "ne",
        Operator::Lt => "lt",
        Operator::Le => "lte",
        Operator::Gt => "gt",
        Operator::Ge => "gte",
    };
    format!("{}.{}", param.param, suffix)
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    path: &str,
    message: String,
) -> ComputeError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ComputeError::Unauthorized(status.as_u16())
        }
        StatusCode::NOT_FOUND => ComputeError::NotFound(path.to_string()),
        StatusCode::TOO_MANY_REQUESTS => ComputeError::RateLimited { retry_after },
        s if s.is_server_error() => ComputeError::Server {
            status: s.as_u16(),
            message,
        },
        s => ComputeError::Api {
            status: s.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl ResourceClient for ComputeClient {
    fn name(&self) -> &str {
        "compute"
    }

    async fn list_page(
        &self,
        kind: &str,
        scope: &Scope,
        filter: &ApiFilter,
        cursor: &Cursor,
    ) -> std::result::Result<Page, ClientError> {
        let url = self.list_url(kind, scope, filter, cursor)?;
        let response: ListResponse = self.api_request(url).await?;
        Ok(response.into())
    }

    async fn get(
        &self,
        kind: &str,
        scope: &Scope,
        identity: &Identity,
    ) -> std::result::Result<RawRecord, ClientError> {
        let url = self.resource_url(kind, scope, Some(identity))?;
        Ok(self.api_request(url).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(endpoint: &str) -> ComputeClient {
        ComputeClient::new(ComputeConfig {
            endpoint: endpoint.to_string(),
            access_token: "test-token".to_string(),
            timeout: Duration::from_secs(5),
            user_agent: "stratus-test/0.1.0".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let result = ComputeClient::new(ComputeConfig {
            endpoint: "not a url".to_string(),
            access_token: String::new(),
            timeout: Duration::from_secs(1),
            user_agent: "test".to_string(),
        });
        assert!(matches!(result, Err(ComputeError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_resource_url_regional_and_global() {
        let client = client("https://api.compute.example.com");

        let url = client
            .resource_url("instances", &Scope::region("region-1"), None)
            .unwrap();
        assert_eq!(url.as_str(), "https://api.compute.example.com/v1/regions/region-1/instances");

        let url = client.resource_url("regions", &Scope::global(), None).unwrap();
        assert_eq!(url.as_str(), "https://api.compute.example.com/v1/regions");
    }

    #[test]
    fn test_resource_url_fills_identity() {
        let client = client("https://api.compute.example.com/base/");
        let identity = Identity::single("id", "i-1 2");

        let url = client
            .resource_url("instances/{id}/attributes", &Scope::region("region-1"), Some(&identity))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.compute.example.com/base/v1/regions/region-1/instances/i-1%202/attributes"
        );

        let err = client
            .resource_url("instances/{id}", &Scope::region("region-1"), None)
            .unwrap_err();
        assert!(matches!(err, ComputeError::MissingIdentity(ref f) if f == "id"));
    }

    #[test]
    fn test_list_url_query() {
        let client = client("https://api.compute.example.com");
        let filter = ApiFilter {
            params: vec![
                FilterParam {
                    param: "state".to_string(),
                    operator: Operator::Eq,
                    values: vec![Value::from("running"), Value::from("pending")],
                },
                FilterParam {
                    param: "launchTime".to_string(),
                    operator: Operator::Ge,
                    values: vec![Value::from("2024-01-01")],
                },
            ],
            page_size: Some(50),
        };

        let url = client
            .list_url("instances", &Scope::region("r1"), &filter, &Cursor::Token("abc".into()))
            .unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("pageToken".to_string(), "abc".to_string()),
                ("pageSize".to_string(), "50".to_string()),
                ("state".to_string(), "running,pending".to_string()),
                ("launchTime.gte".to_string(), "2024-01-01".to_string()),
            ]
        );
    }

    #[test]
    fn test_status_classification() {
        let classify =
            |status| ClientError::from(classify_status(status, None, "/x", String::new()));

        assert!(matches!(classify(StatusCode::UNAUTHORIZED), ClientError::Auth(_)));
        assert!(matches!(classify(StatusCode::FORBIDDEN), ClientError::Auth(_)));
        assert!(matches!(classify(StatusCode::NOT_FOUND), ClientError::NotFound(_)));
        assert!(matches!(classify(StatusCode::TOO_MANY_REQUESTS), ClientError::RateLimited { .. }));
        assert!(matches!(classify(StatusCode::BAD_GATEWAY), ClientError::Transient(_)));
        assert!(matches!(classify(StatusCode::BAD_REQUEST), ClientError::Provider(_)));
    }

    #[test]
    fn test_list_response_continuation() {
        let page: Page = serde_json::from_value::<ListResponse>(json!({
            "items": [{ "id": "a" }],
            "nextPageToken": "t2"
        }))
        .unwrap()
        .into();
        assert_eq!(page.next, Continuation::More("t2".to_string()));

        let page: Page = serde_json::from_value::<ListResponse>(json!({ "nextPageToken": "" }))
            .unwrap()
            .into();
        assert!(page.records.is_empty());
        assert_eq!(page.next, Continuation::Done);
    }

    #[tokio::test]
    async fn test_list_page_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/regions/region-1/instances"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{ "id": "i-1" }, { "id": "i-2" }],
                "nextPageToken": "next"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let page = client(&server.uri())
            .list_page(
                "instances",
                &Scope::region("region-1"),
                &ApiFilter::default(),
                &Cursor::Start,
            )
            .await
            .unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next, Continuation::More("next".to_string()));
    }

    #[tokio::test]
    async fn test_list_page_sends_cursor_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/regions/region-1/instances"))
            .and(query_param("pageToken", "t2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "items": [{ "id": "i-3" }] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let page = client(&server.uri())
            .list_page(
                "instances",
                &Scope::region("region-1"),
                &ApiFilter::default(),
                &Cursor::Token("t2".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(page.records, vec![json!({ "id": "i-3" })]);
        assert_eq!(page.next, Continuation::Done);
    }

    #[tokio::test]
    async fn test_rate_limit_reads_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/regions/region-1/instances/i-1"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .get("instances/{id}", &Scope::region("region-1"), &Identity::single("id", "i-1"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ClientError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/regions/region-1/instances/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .get("instances/{id}", &Scope::region("region-1"), &Identity::single("id", "gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
    }
}
