//! Fetch GitHub pull requests and turn them into monocle documents.

use crate::error::{CrawlerError, CrawlerResult};
use crate::graphql::GraphQlClient;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use store::{Change, ChangeKind, ChangeState, ChangedFile, Commit, Document, Event, EventKind};
use tracing::{debug, info, warn};

pub const MAX_TRY: u32 = 3;
pub const MAX_BULK_SIZE: usize = 100;
pub const REDUCE: usize = 2;
pub const AUGMENT: f64 = 1.1;

pub const GITHUB_URL: &str = "https://github.com";
const GHOST: &str = "ghost";

const PR_FIELDS: &str = r#"
          id
          updatedAt
          createdAt
          mergedAt
          closedAt
          additions
          deletions
          changedFiles
          title
          headRefName
          baseRefName
          bodyText
          state
          reviewDecision
          number
          mergeable
          isDraft
          labels (first: 100) { edges { node { name } } }
          assignees (first: 100) { edges { node { login } } }
          comments (first: 100) {
            edges { node { id createdAt author { login } } }
          }
          files (first: 100) {
            edges { node { additions deletions path } }
          }
          timelineItems (first: 100 itemTypes: [
                CLOSED_EVENT,
                PULL_REQUEST_REVIEW,
                HEAD_REF_FORCE_PUSHED_EVENT]) {
            edges {
              node {
                __typename
                ... on ClosedEvent { id createdAt actor { login } }
                ... on PullRequestReview { id createdAt state author { login } }
                ... on HeadRefForcePushedEvent { id createdAt actor { login } }
              }
            }
          }
          author { login }
          mergedBy { login }
          repository { owner { login } name }
"#;

const PR_COMMITS: &str = r#"
          commits (first: 100) {
            edges {
              node {
                commit {
                  oid
                  pushedDate
                  authoredDate
                  committedDate
                  additions
                  deletions
                  message
                  author { user { login } }
                  committer { user { login } }
                }
              }
            }
          }
"#;

fn pr_fields(with_commits: bool) -> String {
    let mut fields = PR_FIELDS.to_string();
    if with_commits {
        fields.push_str(PR_COMMITS);
    }
    fields
}

#[derive(Debug, Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Debug, Deserialize)]
struct Connection<T> {
    #[serde(default = "Vec::new")]
    edges: Vec<Edge<T>>,
}

impl<T> Default for Connection<T> {
    fn default() -> Self {
        Self { edges: Vec::new() }
    }
}

impl<T> Connection<T> {
    fn nodes(&self) -> impl Iterator<Item = &T> {
        self.edges.iter().map(|edge| &edge.node)
    }
}

#[derive(Debug, Default, Deserialize)]
struct Actor {
    #[serde(default)]
    login: Option<String>,
}

fn login(actor: &Option<Actor>) -> String {
    actor
        .as_ref()
        .and_then(|a| a.login.clone())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| GHOST.to_string())
}

#[derive(Debug, Deserialize)]
struct Label {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawComment {
    id: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    author: Option<Actor>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "__typename")]
enum TimelineItem {
    ClosedEvent {
        id: String,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
        #[serde(default)]
        actor: Option<Actor>,
    },
    PullRequestReview {
        id: String,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
        state: String,
        #[serde(default)]
        author: Option<Actor>,
    },
    HeadRefForcePushedEvent {
        id: String,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
        #[serde(default)]
        actor: Option<Actor>,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Default, Deserialize)]
struct GitActor {
    #[serde(default)]
    user: Option<Actor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCommit {
    oid: String,
    #[serde(default)]
    pushed_date: Option<DateTime<Utc>>,
    authored_date: DateTime<Utc>,
    committed_date: DateTime<Utc>,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    author: GitActor,
    #[serde(default)]
    committer: GitActor,
}

#[derive(Debug, Deserialize)]
struct CommitNode {
    commit: RawCommit,
}

#[derive(Debug, Deserialize)]
struct RawRepository {
    #[serde(default)]
    owner: Option<Actor>,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPullRequest {
    id: String,
    updated_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    #[serde(default)]
    changed_files: u64,
    title: String,
    head_ref_name: String,
    base_ref_name: String,
    #[serde(default)]
    body_text: String,
    state: ChangeState,
    #[serde(default)]
    review_decision: Option<String>,
    number: u64,
    #[serde(default)]
    mergeable: Option<String>,
    #[serde(default)]
    is_draft: bool,
    #[serde(default)]
    labels: Connection<Label>,
    #[serde(default)]
    assignees: Connection<Option<Actor>>,
    #[serde(default)]
    comments: Connection<RawComment>,
    #[serde(default)]
    files: Option<Connection<RawFile>>,
    #[serde(default)]
    timeline_items: Connection<TimelineItem>,
    #[serde(default)]
    commits: Connection<Option<CommitNode>>,
    #[serde(default)]
    author: Option<Actor>,
    #[serde(default)]
    merged_by: Option<Actor>,
    repository: RawRepository,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    #[serde(default)]
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    issue_count: usize,
    page_info: PageInfo,
    #[serde(default)]
    edges: Vec<Edge<Value>>,
}

#[derive(Debug, Deserialize)]
struct SearchData {
    search: SearchResult,
}

fn decode_data<T: DeserializeOwned>(reply: Value) -> CrawlerResult<T> {
    match reply.get("data") {
        Some(data) if !data.is_null() => Ok(serde_json::from_value(data.clone())?),
        _ => Err(CrawlerError::GraphQl {
            message: format!("No data collected: {}", reply),
        }),
    }
}

/// Mutable state of one `get` run.
struct SearchCursor {
    updated_since: String,
    created_before: String,
    after: Option<String>,
    size: usize,
    with_commits: bool,
    total: usize,
}

/// Fetches the pull requests of a GitHub organization, or of one repository
/// when `repository` is set.
pub struct PullRequestFetcher {
    graphql: Arc<dyn GraphQlClient>,
    base_url: String,
    org: String,
    repository: Option<String>,
}

impl PullRequestFetcher {
    pub fn new(
        graphql: Arc<dyn GraphQlClient>,
        base_url: impl Into<String>,
        org: impl Into<String>,
        repository: Option<String>,
    ) -> Self {
        Self {
            graphql,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            org: org.into(),
            repository,
        }
    }

    fn scope(&self) -> String {
        match &self.repository {
            Some(repository) => format!("repo:{}/{}", self.org, repository),
            None => format!("org:{}", self.org),
        }
    }

    fn search_query(&self, cursor: &SearchCursor) -> String {
        let after = cursor
            .after
            .as_ref()
            .map(|after| format!("after: \"{}\"", after))
            .unwrap_or_default();
        format!(
            r#"{{
          search(
              query: "{} is:pr archived:false sort:created updated:>{} created:<{}"
              type: ISSUE first: {} {}) {{
            issueCount
            pageInfo {{
              hasNextPage endCursor
            }}
            edges {{
              node {{
                ... on PullRequest {{
                    {}
                }}
              }}
            }}
          }}
        }}"#,
            self.scope(),
            cursor.updated_since,
            cursor.created_before,
            cursor.size,
            after,
            pr_fields(cursor.with_commits),
        )
    }

    /// Fetch one page into `prs`. Returns whether another page follows.
    async fn get_page(
        &self,
        cursor: &mut SearchCursor,
        prs: &mut Vec<Value>,
    ) -> CrawlerResult<bool> {
        let reply = self.graphql.query(&self.search_query(cursor)).await?;
        let data: SearchData = decode_data(reply)?;
        if cursor.total == 0 {
            cursor.total = data.search.issue_count;
            info!("Total PRs to fetch: {}", cursor.total);
        }
        prs.extend(data.search.edges.into_iter().map(|edge| edge.node));
        if data.search.page_info.has_next_page {
            cursor.after = data.search.page_info.end_cursor;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Fetch every pull request updated after `updated_since`.
    ///
    /// The page size adapts to server timeouts. Search results are capped by
    /// GitHub, so once paging runs dry below the announced total the search
    /// restarts from the creation date of the last pull request fetched.
    pub async fn get(&self, updated_since: &str) -> CrawlerResult<Vec<Value>> {
        let mut prs = Vec::new();
        let mut cursor = SearchCursor {
            updated_since: updated_since.to_string(),
            created_before: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            after: None,
            size: MAX_BULK_SIZE,
            with_commits: true,
            total: 0,
        };
        let mut timeouts_at_one = 0;

        loop {
            info!(
                "Running request on {} (updated>{} created<{} size={} after={:?})",
                self.scope(),
                cursor.updated_since,
                cursor.created_before,
                cursor.size,
                cursor.after
            );
            let has_next_page = match self.get_page(&mut cursor, &mut prs).await {
                Ok(has_next_page) => has_next_page,
                Err(CrawlerError::RequestTimeout { message }) => {
                    cursor.size = (cursor.size / REDUCE).max(1);
                    if cursor.size == 1 {
                        timeouts_at_one += 1;
                        if timeouts_at_one == MAX_TRY - 1 {
                            info!(
                                "{} timeouts in a row for one PR, retrying without commits",
                                timeouts_at_one
                            );
                            cursor.with_commits = false;
                        } else if timeouts_at_one >= MAX_TRY {
                            info!("{} timeouts in a row for one PR, giving up", MAX_TRY);
                            return Err(CrawlerError::RequestTimeout { message });
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            cursor.size = MAX_BULK_SIZE.min((cursor.size as f64 * AUGMENT) as usize + 1);
            timeouts_at_one = 0;
            if !cursor.with_commits {
                info!("Will get full commits on next query");
                cursor.with_commits = true;
            }
            info!("{} PRs fetched", prs.len());

            if has_next_page {
                continue;
            }
            if prs.len() >= cursor.total {
                break;
            }
            let last_created = prs
                .last()
                .and_then(|pr| pr.get("createdAt"))
                .and_then(Value::as_str)
                .map(str::to_string);
            match last_created {
                Some(created) if created != cursor.created_before => {
                    debug!("Restarting search before {}", created);
                    cursor.created_before = created;
                    cursor.after = None;
                }
                _ => {
                    warn!(
                        "Search ended with {} of {} PRs fetched",
                        prs.len(),
                        cursor.total
                    );
                    break;
                }
            }
        }
        Ok(prs)
    }

    /// Fetch a single pull request. Returns the raw reply and its documents.
    pub async fn get_one(
        &self,
        org: &str,
        repository: &str,
        number: u64,
    ) -> CrawlerResult<(Value, Vec<Document>)> {
        let query = format!(
            r#"{{
          repository(owner: "{}", name: "{}") {{
            pullRequest(number: {}) {{
              {}
            }}
          }}
        }}"#,
            org,
            repository,
            number,
            pr_fields(true)
        );
        let reply = self.graphql.query(&query).await?;
        let data: Value = decode_data(reply)?;
        let raw = data
            .get("repository")
            .and_then(|repository| repository.get("pullRequest"))
            .filter(|pr| !pr.is_null())
            .cloned()
            .ok_or_else(|| CrawlerError::GraphQl {
                message: format!("Pull request {}/{}#{} not found", org, repository, number),
            })?;
        let documents = self.extract_objects(std::slice::from_ref(&raw));
        Ok((raw, documents))
    }

    /// Turn raw pull requests into a change and its events each. Pull
    /// requests that cannot be decoded are logged and skipped.
    pub fn extract_objects(&self, prs: &[Value]) -> Vec<Document> {
        let mut documents = Vec::new();
        for pr in prs {
            match serde_json::from_value::<RawPullRequest>(pr.clone()) {
                Ok(raw) => documents.extend(self.extract_pr_objects(raw)),
                Err(e) => warn!("Unable to extract PR: {}: {}", e, pr),
            }
        }
        documents
    }

    fn extract_pr_objects(&self, pr: RawPullRequest) -> Vec<Document> {
        let owner = login(&pr.repository.owner);
        let repository_fullname = format!("{}/{}", owner, pr.repository.name);
        let changed_files = match &pr.files {
            Some(files) => files
                .nodes()
                .map(|file| ChangedFile {
                    path: file.path.clone(),
                    additions: Some(file.additions),
                    deletions: Some(file.deletions),
                })
                .collect(),
            None => Vec::new(),
        };
        let duration = match (pr.state.is_closed(), pr.closed_at) {
            (true, Some(closed_at)) => Some((closed_at - pr.created_at).num_seconds()),
            _ => None,
        };
        let commits: Vec<&RawCommit> = pr.commits.nodes().flatten().map(|n| &n.commit).collect();

        let mut change = Change {
            kind: ChangeKind::Change,
            id: pr.id.clone(),
            number: pr.number,
            change_id: format!("{}@{}", repository_fullname.replace('/', "@"), pr.number),
            title: pr.title.clone(),
            text: pr.body_text.clone(),
            url: format!("{}/{}/pull/{}", self.base_url, repository_fullname, pr.number),
            commit_count: pr.commits.edges.len() as u64,
            additions: pr.additions,
            deletions: pr.deletions,
            changed_files_count: pr.changed_files,
            changed_files,
            commits: Vec::new(),
            repository_prefix: owner,
            repository_fullname,
            repository_shortname: pr.repository.name.clone(),
            author: login(&pr.author),
            merged_by: pr.merged_by.as_ref().map(|_| login(&pr.merged_by)),
            branch: pr.head_ref_name.clone(),
            target_branch: pr.base_ref_name.clone(),
            created_at: pr.created_at,
            merged_at: pr.merged_at,
            updated_at: pr.updated_at,
            closed_at: pr.closed_at,
            state: pr.state,
            duration,
            mergeable: pr.mergeable.clone(),
            labels: pr.labels.nodes().map(|label| label.name.clone()).collect(),
            assignees: pr.assignees.nodes().map(login).collect(),
            approval: pr.review_decision.iter().cloned().collect(),
            draft: pr.is_draft,
        };

        let mut events = vec![Event::on_change(
            EventKind::ChangeCreatedEvent,
            format!("CCE{}", change.id),
            change.created_at,
            Some(change.author.clone()),
            &change,
        )];
        for comment in pr.comments.nodes() {
            events.push(Event::on_change(
                EventKind::ChangeCommentedEvent,
                comment.id.clone(),
                comment.created_at,
                Some(login(&comment.author)),
                &change,
            ));
        }
        for item in pr.timeline_items.nodes() {
            let event = match item {
                TimelineItem::ClosedEvent {
                    id,
                    created_at,
                    actor,
                } => {
                    if change.state == ChangeState::Merged {
                        Event::on_change(
                            EventKind::ChangeMergedEvent,
                            id.clone(),
                            *created_at,
                            change.merged_by.clone(),
                            &change,
                        )
                    } else {
                        Event::on_change(
                            EventKind::ChangeAbandonedEvent,
                            id.clone(),
                            *created_at,
                            Some(login(actor)),
                            &change,
                        )
                    }
                }
                TimelineItem::PullRequestReview {
                    id,
                    created_at,
                    state,
                    author,
                } => Event::on_change(
                    EventKind::ChangeReviewedEvent,
                    id.clone(),
                    *created_at,
                    Some(login(author)),
                    &change,
                )
                .with_approval(state.clone()),
                TimelineItem::HeadRefForcePushedEvent {
                    id,
                    created_at,
                    actor,
                } => Event::on_change(
                    EventKind::ChangeCommitForcePushedEvent,
                    id.clone(),
                    *created_at,
                    Some(login(actor)),
                    &change,
                ),
                TimelineItem::Unsupported => continue,
            };
            events.push(event);
        }
        for commit in &commits {
            events.push(Event::on_change(
                EventKind::ChangeCommitPushedEvent,
                commit.oid.clone(),
                commit.pushed_date.unwrap_or(change.created_at),
                commit.committer.user.as_ref().map(|_| login(&commit.committer.user)),
                &change,
            ));
        }

        change.commits = commits
            .iter()
            .map(|commit| Commit {
                sha: commit.oid.clone(),
                author: commit.author.user.as_ref().map(|_| login(&commit.author.user)),
                committer: commit.committer.user.as_ref().map(|_| login(&commit.committer.user)),
                authored_at: commit.authored_date,
                committed_at: commit.committed_date,
                additions: commit.additions,
                deletions: commit.deletions,
                title: commit.message.clone(),
            })
            .collect();

        let mut documents = vec![Document::from(change)];
        documents.extend(events.into_iter().map(Document::from));
        documents
    }
}
