use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticConfig {
    pub url: String,
    pub timeout: Duration,
    pub scroll_size: usize,
    pub scroll_keep_alive: String,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            timeout: Duration::from_secs(30),
            scroll_size: 1000,
            scroll_keep_alive: "1m".to_string(),
        }
    }
}

impl ElasticConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from a `host:port` connection string, as accepted on the
    /// command line. A missing scheme defaults to `http://`.
    pub fn from_conn(conn: &str) -> Self {
        Self::default().with_url(conn)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url
        } else {
            format!("http://{}", url)
        };
        self.url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_scroll_size(mut self, scroll_size: usize) -> Self {
        self.scroll_size = scroll_size;
        self
    }

    pub fn with_scroll_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.scroll_keep_alive = keep_alive.into();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Elasticsearch URL cannot be empty".to_string());
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err("Elasticsearch URL must start with http:// or https://".to_string());
        }

        if self.timeout.is_zero() {
            return Err("Timeout must be greater than 0".to_string());
        }

        if self.scroll_size == 0 {
            return Err("Scroll size must be greater than 0".to_string());
        }

        if self.scroll_keep_alive.is_empty() {
            return Err("Scroll keep-alive cannot be empty".to_string());
        }

        Ok(())
    }
}
