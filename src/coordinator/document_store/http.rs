use super::client::{
    CreateResult, DocumentStoreClient, DocumentVersion, UpdateResult, VersionedDocument,
};
use crate::config::DocumentStoreSettings;
use crate::core::{CoordinationError, Result};
use crate::work::WorkItemRecord;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

pub const WORKING_STATE_INDEX_PREFIX: &str = ".migrations_working_state";

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(150);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);
const LIST_PAGE_SIZE: usize = 10_000;

/// `DocumentStoreClient` for an OpenSearch/Elasticsearch-compatible cluster.
///
/// Every write passes `refresh=true` so that the next search from any worker
/// observes it.
pub struct HttpDocumentStoreClient {
    http: Client,
    base_url: Url,
    index_name: String,
    username: Option<String>,
    password: Option<String>,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    found: bool,
    #[serde(rename = "_seq_no")]
    seq_no: Option<i64>,
    #[serde(rename = "_primary_term")]
    primary_term: Option<i64>,
    #[serde(rename = "_source")]
    source: Option<WorkItemRecord>,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(rename = "_seq_no")]
    seq_no: i64,
    #[serde(rename = "_primary_term")]
    primary_term: i64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_seq_no")]
    seq_no: Option<i64>,
    #[serde(rename = "_primary_term")]
    primary_term: Option<i64>,
    #[serde(rename = "_source")]
    source: Option<WorkItemRecord>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

impl HttpDocumentStoreClient {
    pub fn new(settings: &DocumentStoreSettings) -> Result<Self> {
        let base_url = Url::parse(&settings.base_url).map_err(|e| {
            CoordinationError::Config(format!("invalid document store url '{}': {}", settings.base_url, e))
        })?;
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url,
            index_name: format!("{}{}", WORKING_STATE_INDEX_PREFIX, settings.index_suffix),
            username: settings.username.clone(),
            password: settings.password.clone(),
            max_retries: settings.max_retries,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                CoordinationError::Config(format!("'{}' cannot be used as a base url", self.base_url))
            })?
            .pop_if_empty()
            .push(&self.index_name)
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }

    /// Sends the request built by `build`, retrying connection failures and
    /// 5xx responses with doubling delay.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut attempt = 0;
        loop {
            let result = self.authorize(build()).send().await;
            let retryable = match &result {
                Ok(response) => response.status().is_server_error(),
                Err(err) => err.is_connect() || err.is_timeout(),
            };
            if !retryable || attempt >= self.max_retries {
                return Ok(result?);
            }

            attempt += 1;
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Document store request failed, retrying"
            );
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    async fn unexpected(response: Response, action: &str) -> CoordinationError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        CoordinationError::Backend(format!("{} failed with {}: {}", action, status, body))
    }

    fn incomplete_query() -> Value {
        json!({ "bool": { "must_not": [ { "exists": { "field": "completedAt" } } ] } })
    }

    /// One page of incomplete ids in `id` order, starting after `after`.
    fn list_page_body(after: Option<&str>) -> Value {
        let mut body = json!({
            "size": LIST_PAGE_SIZE,
            "_source": false,
            "query": Self::incomplete_query(),
            "sort": [ { "id": "asc" } ]
        });
        if let Some(after) = after {
            body["search_after"] = json!([after]);
        }
        body
    }

    fn version_of(seq_no: Option<i64>, primary_term: Option<i64>, id: &str) -> Result<DocumentVersion> {
        match (seq_no, primary_term) {
            (Some(seq_no), Some(primary_term)) => Ok(DocumentVersion {
                seq_no,
                primary_term,
            }),
            _ => Err(CoordinationError::Backend(format!(
                "document '{}' was returned without a sequence number",
                id
            ))),
        }
    }
}

#[async_trait]
impl DocumentStoreClient for HttpDocumentStoreClient {
    async fn ensure_index(&self) -> Result<()> {
        let url = self.url(&[])?;
        let exists = self.send(|| self.http.head(url.clone())).await?;
        if exists.status().is_success() {
            return Ok(());
        }

        let body = json!({
            "settings": { "index": { "number_of_shards": 1, "number_of_replicas": 1 } },
            "mappings": {
                "properties": {
                    "id": { "type": "keyword" },
                    "creatorId": { "type": "keyword" },
                    "completedAt": { "type": "long" },
                    "leaseHolderId": { "type": "keyword" },
                    "leaseExpiry": { "type": "long" },
                    "leaseExponent": { "type": "integer" },
                    "successorItemIds": { "type": "keyword" }
                }
            }
        });
        let response = self.send(|| self.http.put(url.clone()).json(&body)).await?;
        let status = response.status();
        if status.is_success() {
            debug!(index = %self.index_name, "Created working state index");
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        // Another worker created it between our HEAD and PUT.
        if status == StatusCode::BAD_REQUEST && text.contains("resource_already_exists_exception") {
            return Ok(());
        }
        Err(CoordinationError::Backend(format!(
            "creating index '{}' failed with {}: {}",
            self.index_name, status, text
        )))
    }

    async fn create_document(&self, record: &WorkItemRecord) -> Result<CreateResult> {
        let mut url = self.url(&["_doc", &record.id])?;
        url.query_pairs_mut()
            .append_pair("op_type", "create")
            .append_pair("refresh", "true");

        let response = self.send(|| self.http.put(url.clone()).json(record)).await?;
        match response.status() {
            status if status.is_success() => Ok(CreateResult::Created),
            StatusCode::CONFLICT => Ok(CreateResult::AlreadyExists),
            _ => Err(Self::unexpected(response, "create").await),
        }
    }

    async fn get_document(&self, id: &str) -> Result<Option<VersionedDocument>> {
        let url = self.url(&["_doc", id])?;
        let response = self.send(|| self.http.get(url.clone())).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: GetResponse = response.json().await?;
                if !body.found {
                    return Ok(None);
                }
                let version = Self::version_of(body.seq_no, body.primary_term, id)?;
                let record = body.source.ok_or_else(|| {
                    CoordinationError::Integrity(format!("document '{}' has no source", id))
                })?;
                Ok(Some(VersionedDocument { record, version }))
            }
            _ => Err(Self::unexpected(response, "get").await),
        }
    }

    async fn conditional_update(
        &self,
        record: &WorkItemRecord,
        expected: DocumentVersion,
    ) -> Result<UpdateResult> {
        let mut url = self.url(&["_doc", &record.id])?;
        url.query_pairs_mut()
            .append_pair("if_seq_no", &expected.seq_no.to_string())
            .append_pair("if_primary_term", &expected.primary_term.to_string())
            .append_pair("refresh", "true");

        let response = self.send(|| self.http.put(url.clone()).json(record)).await?;
        match response.status() {
            status if status.is_success() => {
                let body: WriteResponse = response.json().await?;
                Ok(UpdateResult::Updated(DocumentVersion {
                    seq_no: body.seq_no,
                    primary_term: body.primary_term,
                }))
            }
            StatusCode::CONFLICT => Ok(UpdateResult::VersionConflict),
            _ => Err(Self::unexpected(response, "conditional update").await),
        }
    }

    async fn search_acquirable(
        &self,
        now_millis: i64,
        limit: usize,
    ) -> Result<Vec<VersionedDocument>> {
        let url = self.url(&["_search"])?;
        let body = json!({
            "size": limit,
            "seq_no_primary_term": true,
            "query": {
                "function_score": {
                    "query": {
                        "bool": {
                            "must_not": [ { "exists": { "field": "completedAt" } } ],
                            "filter": [ { "range": { "leaseExpiry": { "lt": now_millis } } } ]
                        }
                    },
                    "random_score": {},
                    "boost_mode": "replace"
                }
            }
        });

        let response = self.send(|| self.http.post(url.clone()).json(&body)).await?;
        if !response.status().is_success() {
            return Err(Self::unexpected(response, "search").await);
        }

        let body: SearchResponse = response.json().await?;
        body.hits
            .hits
            .into_iter()
            .filter_map(|hit| {
                let id = hit.id;
                let version = Self::version_of(hit.seq_no, hit.primary_term, &id);
                hit.source.map(|record| version.map(|version| VersionedDocument { record, version }))
            })
            .collect()
    }

    async fn count_incomplete(&self) -> Result<u64> {
        let url = self.url(&["_count"])?;
        let body = json!({ "query": Self::incomplete_query() });
        let response = self.send(|| self.http.post(url.clone()).json(&body)).await?;
        if !response.status().is_success() {
            return Err(Self::unexpected(response, "count").await);
        }
        let body: CountResponse = response.json().await?;
        Ok(body.count)
    }

    async fn list_incomplete_ids(&self) -> Result<Vec<String>> {
        let url = self.url(&["_search"])?;
        let mut ids: Vec<String> = Vec::new();
        loop {
            let body = Self::list_page_body(ids.last().map(String::as_str));
            let response = self.send(|| self.http.post(url.clone()).json(&body)).await?;
            if !response.status().is_success() {
                return Err(Self::unexpected(response, "list").await);
            }

            let page: SearchResponse = response.json().await?;
            let fetched = page.hits.hits.len();
            ids.extend(page.hits.hits.into_iter().map(|hit| hit.id));
            if fetched < LIST_PAGE_SIZE {
                return Ok(ids);
            }
        }
    }
}
