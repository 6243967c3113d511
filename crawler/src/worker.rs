use crate::config::{CrawlerConfig, GithubOrg};
use crate::error::CrawlerResult;
use crate::graphql::{GithubGraphQl, GraphQlClient, GraphQlConfig};
use crate::pullrequest::PullRequestFetcher;
use std::sync::Arc;
use std::time::Duration;
use store::{MonocleDb, SearchBackend};
use tracing::{error, info};

/// Periodically crawls one GitHub organization or repository into an index.
pub struct Crawler {
    org: GithubOrg,
    fetcher: PullRequestFetcher,
    db: MonocleDb,
    loop_delay: Duration,
}

impl Crawler {
    pub fn new(
        org: GithubOrg,
        graphql: Arc<dyn GraphQlClient>,
        db: MonocleDb,
        loop_delay: Duration,
    ) -> Self {
        let fetcher = PullRequestFetcher::new(
            graphql,
            org.base_url.clone(),
            org.name.clone(),
            org.repository.clone(),
        );
        Self {
            org,
            fetcher,
            db,
            loop_delay,
        }
    }

    pub fn name(&self) -> String {
        self.org.repository_regexp()
    }

    /// Crawl once. Resumes from the most recently updated change already
    /// indexed, or from the configured date on a first run. Returns the
    /// number of documents indexed.
    pub async fn run_step(&self) -> CrawlerResult<usize> {
        let updated_since = match self.db.get_last_updated(&self.name()).await? {
            Some(last) => last.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            None => self.org.updated_since.clone(),
        };
        info!("Crawling {} for PRs updated since {}", self.name(), updated_since);

        let prs = self.fetcher.get(&updated_since).await?;
        let documents = self.fetcher.extract_objects(&prs);
        self.db.update(&documents).await?;
        info!(
            "{} PRs and {} documents indexed for {}",
            prs.len(),
            documents.len(),
            self.name()
        );
        Ok(documents.len())
    }

    /// Crawl forever, `loop_delay` apart. Failed steps are logged and retried
    /// on the next round.
    pub async fn run(&self) {
        if let Err(e) = self.db.ensure_index().await {
            error!("Unable to prepare index {}: {}", self.db.index(), e);
        }
        loop {
            if let Err(e) = self.run_step().await {
                error!("Crawl of {} failed: {}", self.name(), e);
            }
            tokio::time::sleep(self.loop_delay).await;
        }
    }
}

/// One crawler per configured organization.
pub fn crawlers_from_config(
    config: &CrawlerConfig,
    backend: Arc<dyn SearchBackend>,
) -> CrawlerResult<Vec<Crawler>> {
    let mut crawlers = Vec::new();
    for project in &config.projects {
        let db = MonocleDb::new(backend.clone(), project.index.clone());
        let loop_delay = Duration::from_secs(project.crawler.loop_delay);
        for org in &project.crawler.github_orgs {
            let graphql = GithubGraphQl::new(GraphQlConfig::new(org.token.clone()))?;
            crawlers.push(Crawler::new(
                org.clone(),
                Arc::new(graphql),
                db.clone(),
                loop_delay,
            ));
        }
    }
    Ok(crawlers)
}
