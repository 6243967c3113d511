use crate::types::Document;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Index not found: {index}")]
    IndexNotFound { index: String },

    #[error("Unknown query: {name}")]
    UnknownQuery { name: String },

    #[error("Invalid parameter {name}: {message}")]
    InvalidParam { name: String, message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("Backend error: {message}")]
    Backend { message: String },

    #[error("Unexpected response: {message}")]
    UnexpectedResponse { message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// `hits.total` is an object since Elasticsearch 7 and a bare number before.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TotalHits {
    Count(u64),
    Object { value: u64 },
}

impl TotalHits {
    pub fn value(&self) -> u64 {
        match self {
            TotalHits::Count(value) | TotalHits::Object { value } => *value,
        }
    }
}

impl Default for TotalHits {
    fn default() -> Self {
        TotalHits::Count(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(rename = "_source", default)]
    pub source: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hits {
    #[serde(default)]
    pub total: TotalHits,
    #[serde(default)]
    pub hits: Vec<Hit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub hits: Hits,
    #[serde(default)]
    pub aggregations: Option<Value>,
}

impl SearchResponse {
    pub fn total(&self) -> u64 {
        self.hits.total.value()
    }

    pub fn sources(&self) -> impl Iterator<Item = &Value> {
        self.hits.hits.iter().map(|hit| &hit.source)
    }

    /// Deserialize the aggregation named `name`.
    pub fn aggregation<T: serde::de::DeserializeOwned>(&self, name: &str) -> StoreResult<T> {
        let agg = self
            .aggregations
            .as_ref()
            .and_then(|aggs| aggs.get(name))
            .ok_or_else(|| StoreError::UnexpectedResponse {
                message: format!("missing aggregation {}", name),
            })?;
        Ok(serde_json::from_value(agg.clone())?)
    }
}

const INDEX_FORBIDDEN_CHARS: &[char] = &[
    '\\', '/', '*', '?', '"', '<', '>', '|', ' ', ',', '#', ':',
];

/// Check `index` against the Elasticsearch index naming rules. An index name
/// ends up in URL paths so anything else is refused.
pub fn validate_index_name(index: &str) -> StoreResult<()> {
    let invalid = |message: &str| {
        Err(StoreError::InvalidParam {
            name: "index".to_string(),
            message: format!("{:?} {}", index, message),
        })
    };

    if index.is_empty() || index == "." || index == ".." {
        return invalid("is not an index name");
    }
    if index.len() > 255 {
        return invalid("is longer than 255 bytes");
    }
    if index.starts_with(['_', '-', '+']) {
        return invalid("must not start with '_', '-' or '+'");
    }
    if index.chars().any(|c| c.is_uppercase()) {
        return invalid("must be lowercase");
    }
    if index.contains(INDEX_FORBIDDEN_CHARS) || index.chars().any(char::is_control) {
        return invalid("contains a forbidden character");
    }
    Ok(())
}

/// Storage and search operations monocle needs from its document store.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, index: &str, body: Value) -> StoreResult<SearchResponse>;

    async fn count(&self, index: &str, body: Value) -> StoreResult<u64>;

    /// Return the `_source` of every document matching `body`.
    async fn scan(&self, index: &str, body: Value) -> StoreResult<Vec<Value>>;

    async fn bulk_index(&self, index: &str, documents: &[Document]) -> StoreResult<()>;

    async fn delete_by_query(&self, index: &str, body: Value) -> StoreResult<u64>;

    async fn ensure_index(&self, index: &str) -> StoreResult<()>;

    async fn delete_index(&self, index: &str) -> StoreResult<()>;

    async fn health_check(&self) -> StoreResult<()>;

    fn backend_name(&self) -> &'static str;
}

/// Poll `health_check` until the backend answers or `timeout` elapses.
pub async fn wait_for_backend(backend: &dyn SearchBackend, timeout: Duration) -> StoreResult<()> {
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match backend.health_check().await {
            Ok(()) => {
                info!(
                    "{} backend reachable after {} attempt(s)",
                    backend.backend_name(),
                    attempt
                );
                return Ok(());
            }
            Err(e) if start.elapsed() >= timeout => {
                warn!(
                    "{} backend still unreachable after {:?}: {}",
                    backend.backend_name(),
                    timeout,
                    e
                );
                return Err(StoreError::Unavailable {
                    message: format!("gave up after {} attempts: {}", attempt, e),
                });
            }
            Err(e) => {
                debug!("Backend health check failed (attempt {}): {}", attempt, e);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBackend {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl SearchBackend for FlakyBackend {
        async fn search(&self, _index: &str, _body: Value) -> StoreResult<SearchResponse> {
            Ok(SearchResponse::default())
        }

        async fn count(&self, _index: &str, _body: Value) -> StoreResult<u64> {
            Ok(0)
        }

        async fn scan(&self, _index: &str, _body: Value) -> StoreResult<Vec<Value>> {
            Ok(vec![])
        }

        async fn bulk_index(&self, _index: &str, _documents: &[Document]) -> StoreResult<()> {
            Ok(())
        }

        async fn delete_by_query(&self, _index: &str, _body: Value) -> StoreResult<u64> {
            Ok(0)
        }

        async fn ensure_index(&self, _index: &str) -> StoreResult<()> {
            Ok(())
        }

        async fn delete_index(&self, _index: &str) -> StoreResult<()> {
            Ok(())
        }

        async fn health_check(&self) -> StoreResult<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(());
            }
            self.failures_left.store(left - 1, Ordering::SeqCst);
            Err(StoreError::Unavailable {
                message: "starting".to_string(),
            })
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[test]
    fn test_total_hits_formats() {
        let legacy: Hits = serde_json::from_value(serde_json::json!({"total": 3})).unwrap();
        assert_eq!(legacy.total.value(), 3);

        let modern: Hits = serde_json::from_value(
            serde_json::json!({"total": {"value": 5, "relation": "eq"}, "hits": []}),
        )
        .unwrap();
        assert_eq!(modern.total.value(), 5);
    }

    #[test]
    fn test_missing_aggregation_is_an_error() {
        let response = SearchResponse::default();
        let result: StoreResult<Value> = response.aggregation("agg1");
        assert!(matches!(result, Err(StoreError::UnexpectedResponse { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_backend_retries() {
        let backend = FlakyBackend {
            failures_left: AtomicU32::new(2),
        };
        wait_for_backend(&backend, Duration::from_secs(5)).await.unwrap();
        assert_eq!(backend.failures_left.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wait_for_backend_gives_up() {
        let backend = FlakyBackend {
            failures_left: AtomicU32::new(u32::MAX),
        };
        let result = wait_for_backend(&backend, Duration::from_millis(0)).await;
        assert!(matches!(result, Err(StoreError::Unavailable { .. })));
    }

    #[test]
    fn test_validate_index_name() {
        for index in ["monocle", "monocle-unittest-histo", "monocle.2020", "repo_1"] {
            assert!(validate_index_name(index).is_ok(), "{}", index);
        }
        for index in [
            "",
            ".",
            "_all",
            "-monocle",
            "+monocle",
            "Monocle",
            "monocle/_delete_by_query#",
            "a/_delete_by_query",
            "monocle,other",
            "mono cle",
            "monocle?pretty",
            "monocle:1",
            "monocle\n",
        ] {
            assert!(
                matches!(
                    validate_index_name(index),
                    Err(StoreError::InvalidParam { ref name, .. }) if name == "index"
                ),
                "{}",
                index
            );
        }
        assert!(validate_index_name(&"m".repeat(256)).is_err());
    }
}
