use crate::error::{CrawlerError, CrawlerResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

pub const GITHUB_GRAPHQL_URL: &str = "https://api.github.com/graphql";

/// Something able to run a GraphQL query and hand back the JSON reply.
#[async_trait]
pub trait GraphQlClient: Send + Sync {
    /// Run `query`. Replies carrying `data` are returned whole, including any
    /// partial `errors`.
    async fn query(&self, query: &str) -> CrawlerResult<Value>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQlConfig {
    pub url: String,
    pub token: String,
    pub timeout: Duration,
}

impl Default for GraphQlConfig {
    fn default() -> Self {
        Self {
            url: GITHUB_GRAPHQL_URL.to_string(),
            token: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl GraphQlConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("GraphQL URL cannot be empty".to_string());
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err("GraphQL URL must start with http:// or https://".to_string());
        }

        if self.token.is_empty() {
            return Err("API token cannot be empty".to_string());
        }

        if self.timeout.is_zero() {
            return Err("Timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlErrorItem {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    message: String,
}

/// GitHub's GraphQL v4 API.
pub struct GithubGraphQl {
    client: reqwest::Client,
    config: GraphQlConfig,
}

impl GithubGraphQl {
    pub fn new(config: GraphQlConfig) -> CrawlerResult<Self> {
        config
            .validate()
            .map_err(|msg| CrawlerError::InvalidConfig { message: msg })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("monocle/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CrawlerError::InvalidConfig {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GraphQlConfig {
        &self.config
    }

    fn handle_http_error(err: reqwest::Error) -> CrawlerError {
        if err.is_timeout() {
            CrawlerError::RequestTimeout {
                message: "Client side timeout".to_string(),
            }
        } else {
            CrawlerError::Network(err)
        }
    }

    fn check_errors(reply: &Value) -> CrawlerResult<()> {
        let errors: Vec<GraphQlErrorItem> = match reply.get("errors") {
            Some(errors) => serde_json::from_value(errors.clone())?,
            None => return Ok(()),
        };
        let messages = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");

        if errors
            .iter()
            .any(|e| e.kind.as_deref() == Some("RATE_LIMITED"))
        {
            return Err(CrawlerError::RateLimit { message: messages });
        }
        if reply.get("data").map_or(true, Value::is_null) {
            return Err(CrawlerError::GraphQl { message: messages });
        }
        warn!("GraphQL reply carries errors: {}", messages);
        Ok(())
    }
}

#[async_trait]
impl GraphQlClient for GithubGraphQl {
    async fn query(&self, query: &str) -> CrawlerResult<Value> {
        debug!("GraphQL query on {}", self.config.url);
        let response = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.token)
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(Self::handle_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 => CrawlerError::Authentication {
                    message: error_text,
                },
                403 | 429 => CrawlerError::RateLimit {
                    message: error_text,
                },
                502 | 504 => CrawlerError::RequestTimeout {
                    message: format!("Server side timeout ({})", status),
                },
                _ => CrawlerError::GraphQl {
                    message: format!("HTTP {}: {}", status, error_text),
                },
            });
        }

        let reply: Value = response.json().await.map_err(Self::handle_http_error)?;
        Self::check_errors(&reply)?;
        Ok(reply)
    }
}
