//! GitHub pull request crawler for monocle
//!
//! Pulls pull requests through the GitHub GraphQL API, turns them into
//! changes and events, and indexes them with the `store` crate.

pub mod config;
pub mod error;
pub mod graphql;
pub mod pullrequest;
pub mod worker;

pub use config::{CrawlerConfig, CrawlerSettings, GithubOrg, Project};
pub use error::{CrawlerError, CrawlerResult};
pub use graphql::{GithubGraphQl, GraphQlClient, GraphQlConfig};
pub use pullrequest::PullRequestFetcher;
pub use worker::{crawlers_from_config, Crawler};
