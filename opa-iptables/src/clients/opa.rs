//! Client for the Open Policy Agent data API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, header};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{EngineError, PolicyError};
use crate::rule::RuleSet;

pub type Result<T> = std::result::Result<T, PolicyError>;

/// Per-request timeout so a stalled policy engine cannot stall a poll cycle.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const DATA_API: &str = "/v1/data";

/// Source of desired rule sets, keyed by document path.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn fetch_rules(&self, path: &str, input: &Value) -> Result<RuleSet>;
}

/// HTTP client for the policy engine's document store.
#[derive(Debug, Clone)]
pub struct OpaClient {
    endpoint: String,
    auth_token: Option<String>,
    client: Client,
}

impl OpaClient {
    pub fn new(endpoint: &str, auth_token: Option<String>) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            auth_token: auth_token.filter(|t| !t.is_empty()),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn document_url(&self, path: &str) -> Result<String> {
        let path = path.trim().trim_matches('/');
        if path.is_empty() || path.contains(char::is_whitespace) {
            return Err(PolicyError::InvalidPath(path.to_string()));
        }
        Ok(format!("{}{}/{}", self.endpoint, DATA_API, path))
    }

    /// Evaluate the document at `path` with `input`; returns the raw answer body.
    pub async fn query(&self, path: &str, input: &Value) -> Result<Vec<u8>> {
        let url = self.document_url(path)?;
        let body = if input.is_null() {
            json!({})
        } else {
            json!({ "input": input })
        };
        self.send(Method::POST, &url, Some(serde_json::to_vec(&body)?))
            .await
    }

    pub async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.document_url(path)?;
        self.send(Method::GET, &url, None).await
    }

    pub async fn put_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let url = self.document_url(path)?;
        self.send(Method::PUT, &url, Some(data)).await.map(|_| ())
    }

    pub async fn delete_data(&self, path: &str) -> Result<()> {
        let url = self.document_url(path)?;
        self.send(Method::DELETE, &url, None).await.map(|_| ())
    }

    async fn send(&self, method: Method, url: &str, body: Option<Vec<u8>>) -> Result<Vec<u8>> {
        debug!(%method, url, "Policy engine request");

        let mut request = self
            .client
            .request(method, url)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            return Err(decode_error(status, &bytes));
        }
        Ok(bytes.to_vec())
    }
}

fn decode_error(status: StatusCode, body: &[u8]) -> PolicyError {
    match serde_json::from_slice::<EngineError>(body) {
        Ok(err) => PolicyError::Engine(err),
        Err(_) => PolicyError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

#[async_trait]
impl RuleSource for OpaClient {
    async fn fetch_rules(&self, path: &str, input: &Value) -> Result<RuleSet> {
        let body = self.query(path, input).await?;
        Ok(RuleSet::from_policy_answer(&body)?)
    }
}
