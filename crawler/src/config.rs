use crate::error::{CrawlerError, CrawlerResult};
use crate::pullrequest::GITHUB_URL;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// One GitHub organization, or a single repository of it, to crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GithubOrg {
    pub name: String,
    #[serde(default)]
    pub repository: Option<String>,
    pub updated_since: String,
    pub token: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    GITHUB_URL.to_string()
}

fn default_loop_delay() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrawlerSettings {
    /// Seconds to wait between two crawls.
    #[serde(default = "default_loop_delay")]
    pub loop_delay: u64,
    #[serde(default)]
    pub github_orgs: Vec<GithubOrg>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Project {
    pub index: String,
    pub crawler: CrawlerSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrawlerConfig {
    #[serde(default)]
    pub projects: Vec<Project>,
}

impl GithubOrg {
    pub fn new(
        name: impl Into<String>,
        updated_since: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            repository: None,
            updated_since: updated_since.into(),
            token: token.into(),
            base_url: default_base_url(),
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Regexp matching the `repository_fullname` of everything this entry crawls.
    pub fn repository_regexp(&self) -> String {
        match &self.repository {
            Some(repository) => format!("{}/{}", self.name, repository),
            None => format!("{}/.*", self.name),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Organization name cannot be empty".to_string());
        }

        if self.repository.as_deref() == Some("") {
            return Err(format!("Repository of {} cannot be empty", self.name));
        }

        if self.token.is_empty() {
            return Err(format!("API token of {} cannot be empty", self.name));
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(format!(
                "Base URL of {} must start with http:// or https://",
                self.name
            ));
        }

        NaiveDate::parse_from_str(&self.updated_since, "%Y-%m-%d").map_err(|_| {
            format!(
                "updated_since of {} must be a YYYY-MM-DD date, got {:?}",
                self.name, self.updated_since
            )
        })?;

        Ok(())
    }
}

impl CrawlerConfig {
    pub fn from_yaml(yaml: &str) -> CrawlerResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config
            .validate()
            .map_err(|msg| CrawlerError::InvalidConfig { message: msg })?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> CrawlerResult<Self> {
        let path = path.as_ref();
        debug!("loading crawler configuration from {}", path.display());
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<(), String> {
        for project in &self.projects {
            if project.index.is_empty() {
                return Err("Project index cannot be empty".to_string());
            }
            store::validate_index_name(&project.index).map_err(|e| e.to_string())?;

            if project.crawler.loop_delay == 0 {
                return Err(format!(
                    "Loop delay of project {} must be greater than 0",
                    project.index
                ));
            }

            for org in &project.crawler.github_orgs {
                org.validate()
                    .map_err(|msg| format!("Project {}: {}", project.index, msg))?;
            }
        }

        Ok(())
    }
}
