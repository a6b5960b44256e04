use super::{BulkSink, SourceDocument};
use crate::core::{CoordinationError, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(150);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

/// Writes batches to a target cluster through its `_bulk` endpoint.
pub struct HttpBulkSink {
    http: Client,
    bulk_url: Url,
    username: Option<String>,
    password: Option<String>,
    max_retries: u32,
}

impl HttpBulkSink {
    pub fn new(target_url: &str, request_timeout: Duration, max_retries: u32) -> Result<Self> {
        let mut bulk_url = Url::parse(target_url).map_err(|e| {
            CoordinationError::Config(format!("invalid target url '{}': {}", target_url, e))
        })?;
        bulk_url
            .path_segments_mut()
            .map_err(|_| {
                CoordinationError::Config(format!("'{}' cannot be used as a base url", target_url))
            })?
            .pop_if_empty()
            .push("_bulk");

        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CoordinationError::Config(format!("building http client: {}", e)))?;

        Ok(Self {
            http,
            bulk_url,
            username: None,
            password: None,
            max_retries,
        })
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn bulk_url(&self) -> &Url {
        &self.bulk_url
    }

    async fn post_with_retry(&self, body: String) -> Result<Response> {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut attempt = 0;
        loop {
            let mut request = self
                .http
                .post(self.bulk_url.clone())
                .header("Content-Type", "application/x-ndjson")
                .body(body.clone());
            if let Some(username) = &self.username {
                request = request.basic_auth(username, self.password.as_deref());
            }

            let result = request.send().await;
            let retryable = match &result {
                Ok(response) => {
                    response.status().is_server_error()
                        || response.status() == StatusCode::TOO_MANY_REQUESTS
                }
                Err(err) => err.is_connect() || err.is_timeout(),
            };
            if !retryable || attempt >= self.max_retries {
                return result.map_err(|e| CoordinationError::Pipeline(format!("bulk request: {}", e)));
            }

            attempt += 1;
            let jitter = Duration::from_millis(rand::random::<u64>() % 50);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Bulk request failed, retrying");
            tokio::time::sleep(delay + jitter).await;
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }
}

/// Newline-delimited `_bulk` body indexing each document under its own id.
pub fn bulk_body(index_name: &str, documents: &[SourceDocument]) -> String {
    let mut body = String::new();
    for doc in documents {
        body.push_str(&json!({ "index": { "_index": index_name, "_id": doc.id } }).to_string());
        body.push('\n');
        body.push_str(&doc.source.to_string());
        body.push('\n');
    }
    body
}

#[async_trait]
impl BulkSink for HttpBulkSink {
    async fn send_batch(&self, index_name: &str, documents: &[SourceDocument]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }

        let response = self.post_with_retry(bulk_body(index_name, documents)).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoordinationError::Pipeline(format!(
                "bulk request to '{}' failed with {}: {}",
                index_name, status, text
            )));
        }

        let parsed: BulkResponse = response
            .json()
            .await
            .map_err(|e| CoordinationError::Pipeline(format!("bulk response: {}", e)))?;
        if parsed.errors {
            let first_error = parsed
                .items
                .iter()
                .filter_map(|item| item.get("index").and_then(|op| op.get("error")))
                .next()
                .map(|err| err.to_string())
                .unwrap_or_default();
            return Err(CoordinationError::Pipeline(format!(
                "bulk request to '{}' had item failures: {}",
                index_name, first_error
            )));
        }

        debug!(index = %index_name, documents = documents.len(), "Sent bulk batch");
        Ok(())
    }
}
