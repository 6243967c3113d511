use crate::backend::{validate_index_name, SearchBackend, SearchResponse, StoreError, StoreResult};
use crate::config::ElasticConfig;
use crate::types::Document;
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

const DATE_FORMAT: &str = "date_time_no_millis||epoch_millis";

/// Field mapping applied when monocle creates an index.
pub fn index_mapping() -> Value {
    let keyword = json!({"type": "keyword"});
    let integer = json!({"type": "integer"});
    let date = json!({"type": "date", "format": DATE_FORMAT});
    json!({
        "mappings": {
            "properties": {
                "id": keyword,
                "type": keyword,
                "number": keyword,
                "change_id": keyword,
                "title": {"type": "text", "fields": {"keyword": {"type": "keyword", "ignore_above": 8191}}},
                "text": {"type": "text"},
                "url": keyword,
                "commit_count": integer,
                "additions": integer,
                "deletions": integer,
                "changed_files_count": integer,
                "changed_files": {
                    "properties": {
                        "path": keyword,
                        "additions": integer,
                        "deletions": integer
                    }
                },
                "commits": {
                    "properties": {
                        "sha": keyword,
                        "author": keyword,
                        "committer": keyword,
                        "authored_at": date,
                        "committed_at": date,
                        "additions": integer,
                        "deletions": integer,
                        "title": {"type": "text"}
                    }
                },
                "repository_prefix": keyword,
                "repository_fullname": keyword,
                "repository_shortname": keyword,
                "author": keyword,
                "on_author": keyword,
                "merged_by": keyword,
                "branch": keyword,
                "target_branch": keyword,
                "state": keyword,
                "mergeable": keyword,
                "labels": keyword,
                "assignees": keyword,
                "approval": keyword,
                "created_at": date,
                "on_created_at": date,
                "updated_at": date,
                "merged_at": date,
                "closed_at": date,
                "duration": integer,
                "draft": {"type": "boolean"}
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct ScrollResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    #[serde(flatten)]
    page: SearchResponse,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct DeleteByQueryResponse {
    deleted: u64,
}

/// `SearchBackend` speaking the Elasticsearch REST API.
pub struct ElasticBackend {
    client: reqwest::Client,
    config: ElasticConfig,
}

impl ElasticBackend {
    pub fn new(config: ElasticConfig) -> StoreResult<Self> {
        config
            .validate()
            .map_err(|msg| StoreError::InvalidConfig { message: msg })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::InvalidConfig {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    pub fn with_default_config() -> StoreResult<Self> {
        Self::new(ElasticConfig::default())
    }

    pub fn config(&self) -> &ElasticConfig {
        &self.config
    }

    /// URL of an API endpoint. Each segment is percent-encoded on its own.
    fn url(&self, segments: &[&str], query: &[(&str, &str)]) -> StoreResult<Url> {
        let invalid_url = |message: String| StoreError::InvalidConfig {
            message: format!("Invalid Elasticsearch URL {}: {}", self.config.url, message),
        };
        let mut url = Url::parse(&self.config.url).map_err(|e| invalid_url(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid_url("cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// URL of an endpoint scoped to `index`, refusing names Elasticsearch
    /// would not accept as an index.
    fn index_url(
        &self,
        index: &str,
        endpoint: Option<&str>,
        query: &[(&str, &str)],
    ) -> StoreResult<Url> {
        validate_index_name(index)?;
        let mut segments = vec![index];
        segments.extend(endpoint);
        self.url(&segments, query)
    }

    fn handle_http_error(err: reqwest::Error) -> StoreError {
        if err.is_timeout() {
            StoreError::Unavailable {
                message: "Request timeout".to_string(),
            }
        } else if err.is_connect() {
            StoreError::Unavailable {
                message: "Cannot connect to Elasticsearch".to_string(),
            }
        } else {
            StoreError::Network(err)
        }
    }

    /// Turn a non-2xx response into an error, keeping the body for context.
    async fn check_status(
        index: &str,
        response: reqwest::Response,
    ) -> StoreResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        if status.as_u16() == 404 && error_text.contains("index_not_found_exception") {
            return Err(StoreError::IndexNotFound {
                index: index.to_string(),
            });
        }
        match status.as_u16() {
            502..=504 => Err(StoreError::Unavailable {
                message: format!("Elasticsearch unavailable ({})", status),
            }),
            _ => Err(StoreError::Backend {
                message: format!("Elasticsearch error ({}): {}", status, error_text),
            }),
        }
    }

    async fn post_json(
        &self,
        index: &str,
        url: Url,
        body: &Value,
    ) -> StoreResult<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(Self::handle_http_error)?;
        Self::check_status(index, response).await
    }

    /// Collect the hits of `page` and of every following scroll page.
    /// `scroll_id` tracks the latest context so it can be cleared whatever
    /// the outcome.
    async fn drain_scroll(
        &self,
        index: &str,
        mut page: ScrollResponse,
        scroll_id: &mut Option<String>,
        sources: &mut Vec<Value>,
    ) -> StoreResult<()> {
        loop {
            if page.page.hits.hits.is_empty() {
                return Ok(());
            }
            sources.extend(page.page.hits.hits.drain(..).map(|hit| hit.source));

            let Some(current) = page.scroll_id.take() else {
                return Ok(());
            };
            *scroll_id = Some(current.clone());
            let next = json!({
                "scroll": self.config.scroll_keep_alive,
                "scroll_id": current,
            });
            let url = self.url(&["_search", "scroll"], &[])?;
            let response = self.post_json(index, url, &next).await?;
            page = response.json().await.map_err(Self::handle_http_error)?;
            if page.scroll_id.is_some() {
                scroll_id.clone_from(&page.scroll_id);
            }
        }
    }

    async fn clear_scroll(&self, scroll_id: &str) {
        let url = match self.url(&["_search", "scroll"], &[]) {
            Ok(url) => url,
            Err(e) => {
                warn!("Unable to clear scroll context: {}", e);
                return;
            }
        };
        let result = self
            .client
            .delete(url)
            .json(&json!({ "scroll_id": [scroll_id] }))
            .send()
            .await;
        if let Err(e) = result {
            warn!("Unable to clear scroll context: {}", e);
        }
    }
}

#[async_trait]
impl SearchBackend for ElasticBackend {
    async fn search(&self, index: &str, body: Value) -> StoreResult<SearchResponse> {
        debug!("search on {}: {}", index, body);
        let url = self.index_url(index, Some("_search"), &[("track_total_hits", "true")])?;
        let response = self.post_json(index, url, &body).await?;
        response.json().await.map_err(Self::handle_http_error)
    }

    async fn count(&self, index: &str, body: Value) -> StoreResult<u64> {
        debug!("count on {}: {}", index, body);
        let url = self.index_url(index, Some("_count"), &[])?;
        let response = self.post_json(index, url, &body).await?;
        let count: CountResponse = response.json().await.map_err(Self::handle_http_error)?;
        Ok(count.count)
    }

    async fn scan(&self, index: &str, mut body: Value) -> StoreResult<Vec<Value>> {
        debug!("scan on {}: {}", index, body);
        if let Some(obj) = body.as_object_mut() {
            obj.insert("size".to_string(), json!(self.config.scroll_size));
        }

        let keep_alive = self.config.scroll_keep_alive.as_str();
        let url = self.index_url(index, Some("_search"), &[("scroll", keep_alive)])?;
        let response = self.post_json(index, url, &body).await?;
        let first: ScrollResponse = response.json().await.map_err(Self::handle_http_error)?;

        let mut scroll_id = first.scroll_id.clone();
        let mut sources = Vec::new();
        let drained = self
            .drain_scroll(index, first, &mut scroll_id, &mut sources)
            .await;
        if let Some(scroll_id) = &scroll_id {
            self.clear_scroll(scroll_id).await;
        }
        drained?;

        debug!("scan on {} returned {} documents", index, sources.len());
        Ok(sources)
    }

    async fn bulk_index(&self, index: &str, documents: &[Document]) -> StoreResult<()> {
        validate_index_name(index)?;
        if documents.is_empty() {
            return Ok(());
        }

        let mut payload = String::new();
        for document in documents {
            let action = json!({ "index": { "_index": index, "_id": document.id() } });
            payload.push_str(&serde_json::to_string(&action)?);
            payload.push('\n');
            payload.push_str(&serde_json::to_string(document)?);
            payload.push('\n');
        }

        let response = self
            .client
            .post(self.url(&["_bulk"], &[("refresh", "wait_for")])?)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(payload)
            .send()
            .await
            .map_err(Self::handle_http_error)?;
        let response = Self::check_status(index, response).await?;
        let bulk: BulkResponse = response.json().await.map_err(Self::handle_http_error)?;

        if bulk.errors {
            let first_error = bulk
                .items
                .iter()
                .filter_map(|item| item.get("index").and_then(|i| i.get("error")))
                .next()
                .cloned()
                .unwrap_or(Value::Null);
            error!("Bulk indexing into {} reported errors: {}", index, first_error);
            return Err(StoreError::Backend {
                message: format!("bulk indexing failed: {}", first_error),
            });
        }

        info!("Indexed {} documents into {}", documents.len(), index);
        Ok(())
    }

    async fn delete_by_query(&self, index: &str, body: Value) -> StoreResult<u64> {
        let url = self.index_url(index, Some("_delete_by_query"), &[("refresh", "true")])?;
        let response = self.post_json(index, url, &body).await?;
        let deleted: DeleteByQueryResponse =
            response.json().await.map_err(Self::handle_http_error)?;
        info!("Deleted {} documents from {}", deleted.deleted, index);
        Ok(deleted.deleted)
    }

    async fn ensure_index(&self, index: &str) -> StoreResult<()> {
        let response = self
            .client
            .head(self.index_url(index, None, &[])?)
            .send()
            .await
            .map_err(Self::handle_http_error)?;
        if response.status().is_success() {
            return Ok(());
        }

        info!("Creating index {}", index);
        let response = self
            .client
            .put(self.index_url(index, None, &[])?)
            .json(&index_mapping())
            .send()
            .await
            .map_err(Self::handle_http_error)?;
        Self::check_status(index, response).await?;
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> StoreResult<()> {
        let response = self
            .client
            .delete(self.index_url(index, None, &[])?)
            .send()
            .await
            .map_err(Self::handle_http_error)?;
        match Self::check_status(index, response).await {
            Ok(_) | Err(StoreError::IndexNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> StoreResult<()> {
        let response = self
            .client
            .get(self.url(&["_cluster", "health"], &[])?)
            .send()
            .await
            .map_err(Self::handle_http_error)?;

        if response.status().is_success() {
            debug!("Elasticsearch health check passed");
            Ok(())
        } else {
            error!("Health check failed with status: {}", response.status());
            Err(StoreError::Unavailable {
                message: format!("Health check failed: {}", response.status()),
            })
        }
    }

    fn backend_name(&self) -> &'static str {
        "elasticsearch"
    }
}
