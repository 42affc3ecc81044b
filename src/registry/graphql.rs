//! GraphQL transport used by the registry adapter.
//!
//! Posts `{query, variables}` documents over HTTP. Transient transport
//! failures of queries (timeouts, refused connections, 429 and 5xx answers)
//! are retried with bounded exponential backoff. Mutations are only retried
//! when the connection could not be established, since any other failure may
//! hide a request the server already applied. GraphQL-level errors are
//! returned to the caller untouched so they can be classified.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// A GraphQL document plus request headers.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQlRequest {
    pub query: String,
    pub variables: Value,
    pub headers: Vec<(String, String)>,
    /// Safe to resend after an ambiguous transport failure.
    pub idempotent: bool,
}

impl GraphQlRequest {
    /// Mutations are marked non-idempotent.
    pub fn new(query: impl Into<String>, variables: Value) -> Self {
        let query = query.into();
        let idempotent = !query.trim_start().starts_with("mutation");
        Self {
            query,
            variables,
            headers: Vec::new(),
            idempotent,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Errors from the GraphQL transport.
#[derive(Debug, thiserror::Error)]
pub enum GraphQlError {
    /// The server answered with a GraphQL error carrying extensions.
    #[error("graphql: {message}")]
    Extended {
        message: String,
        extensions: serde_json::Map<String, Value>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("response carried neither data nor errors")]
    MissingData,
}

/// Executes GraphQL documents and returns the `data` object.
#[async_trait]
pub trait GraphQlClient: Send + Sync {
    async fn execute(&self, request: GraphQlRequest) -> Result<Value, GraphQlError>;
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlResponseError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponseError {
    message: String,
    #[serde(default)]
    extensions: serde_json::Map<String, Value>,
}

/// `reqwest`-backed [`GraphQlClient`].
pub struct HttpGraphQlClient {
    client: Client,
    endpoint: String,
}

impl HttpGraphQlClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, GraphQlError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Backoff configuration for transport retries.
    fn backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(3)
            .with_jitter()
    }

    fn is_retryable(err: &GraphQlError, idempotent: bool) -> bool {
        match err {
            GraphQlError::Http(e) if e.is_connect() => true,
            GraphQlError::Http(e) => idempotent && e.is_timeout(),
            GraphQlError::Status { status, .. } => {
                idempotent && (*status == 429 || *status >= 500)
            }
            _ => false,
        }
    }

    async fn post(&self, request: &GraphQlRequest) -> Result<GraphQlResponse, GraphQlError> {
        let body = json!({
            "query": request.query,
            "variables": request.variables,
        });

        let mut builder = self.client.post(&self.endpoint).json(&body);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GraphQlError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        Ok(response.json::<GraphQlResponse>().await?)
    }
}

#[async_trait]
impl GraphQlClient for HttpGraphQlClient {
    async fn execute(&self, request: GraphQlRequest) -> Result<Value, GraphQlError> {
        let response = (|| async { self.post(&request).await })
            .retry(Self::backoff())
            .when(|err| Self::is_retryable(err, request.idempotent))
            .notify(|err, delay| {
                warn!(endpoint = %self.endpoint, error = %err, ?delay, "Retrying GraphQL request");
            })
            .await?;

        if let Some(first) = response.errors.into_iter().next() {
            debug!(endpoint = %self.endpoint, message = %first.message, "GraphQL error response");
            return Err(GraphQlError::Extended {
                message: first.message,
                extensions: first.extensions,
            });
        }

        response.data.ok_or(GraphQlError::MissingData)
    }
}
