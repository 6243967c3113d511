use store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlerError {
    #[error("Request timeout: {message}")]
    RequestTimeout { message: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimit { message: String },

    #[error("GraphQL error: {message}")]
    GraphQl { message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Unable to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CrawlerResult<T> = Result<T, CrawlerError>;
