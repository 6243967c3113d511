use crate::backend::{SearchBackend, StoreError, StoreResult};
use crate::params::QueryParams;
use crate::queries::{self, NamedQuery, Scope};
use crate::types::{DocType, Document};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// One monocle index on a search backend.
#[derive(Clone)]
pub struct MonocleDb {
    backend: Arc<dyn SearchBackend>,
    index: String,
}

impl MonocleDb {
    pub fn new(backend: Arc<dyn SearchBackend>, index: impl Into<String>) -> Self {
        Self {
            backend,
            index: index.into(),
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn backend(&self) -> &dyn SearchBackend {
        self.backend.as_ref()
    }

    pub async fn ensure_index(&self) -> StoreResult<()> {
        self.backend.ensure_index(&self.index).await
    }

    /// Index `documents`, replacing any stored document with the same id.
    pub async fn update(&self, documents: &[Document]) -> StoreResult<()> {
        if documents.is_empty() {
            return Ok(());
        }
        debug!("indexing {} documents into {}", documents.len(), self.index);
        self.backend.bulk_index(&self.index, documents).await
    }

    /// Remove every document of the repositories matching `repository_regexp`.
    pub async fn delete_repository(&self, repository_regexp: &str) -> StoreResult<u64> {
        let body = json!({
            "query": {
                "bool": {
                    "filter": [
                        { "regexp": { "repository_fullname": { "value": repository_regexp } } }
                    ]
                }
            }
        });
        let deleted = self.backend.delete_by_query(&self.index, body).await?;
        info!(
            "deleted {} documents of {} from {}",
            deleted, repository_regexp, self.index
        );
        Ok(deleted)
    }

    /// Most recent `updated_at` among the changes of the matching repositories.
    pub async fn get_last_updated(
        &self,
        repository_regexp: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let body = json!({
            "sort": [{ "updated_at": { "order": "desc" } }],
            "size": 1,
            "query": {
                "bool": {
                    "filter": [
                        { "term": { "type": DocType::Change.as_str() } },
                        { "regexp": { "repository_fullname": { "value": repository_regexp } } }
                    ]
                }
            }
        });
        let data = match self.backend.search(&self.index, body).await {
            Ok(data) => data,
            Err(StoreError::IndexNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let first = data
            .sources()
            .next()
            .and_then(|source| source.get("updated_at").cloned());
        first
            .map(serde_json::from_value)
            .transpose()
            .map_err(StoreError::from)
    }

    pub async fn run_named_query(
        &self,
        name: &str,
        repositories: &[String],
        params: &QueryParams,
    ) -> StoreResult<Value> {
        let query: NamedQuery = name.parse()?;
        let scope = Scope::new(self.backend.as_ref(), &self.index, repositories);
        queries::run(query, scope, params).await
    }
}
