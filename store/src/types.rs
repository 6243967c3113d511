use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every value the `type` field of a stored document can take.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DocType {
    Change,
    ChangeCreatedEvent,
    ChangeCommentedEvent,
    ChangeReviewedEvent,
    ChangeAbandonedEvent,
    ChangeMergedEvent,
    ChangeCommitPushedEvent,
    ChangeCommitForcePushedEvent,
}

impl DocType {
    /// Event types selected when a query does not narrow the `type` filter.
    pub const EVENTS: [DocType; 7] = [
        DocType::ChangeCreatedEvent,
        DocType::ChangeAbandonedEvent,
        DocType::ChangeMergedEvent,
        DocType::ChangeCommentedEvent,
        DocType::ChangeReviewedEvent,
        DocType::ChangeCommitPushedEvent,
        DocType::ChangeCommitForcePushedEvent,
    ];

    /// Event types that describe the life of a change, from creation to closing.
    pub const LIFECYCLE: [DocType; 5] = [
        DocType::ChangeCreatedEvent,
        DocType::ChangeMergedEvent,
        DocType::ChangeAbandonedEvent,
        DocType::ChangeCommitPushedEvent,
        DocType::ChangeCommitForcePushedEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Change => "Change",
            DocType::ChangeCreatedEvent => "ChangeCreatedEvent",
            DocType::ChangeCommentedEvent => "ChangeCommentedEvent",
            DocType::ChangeReviewedEvent => "ChangeReviewedEvent",
            DocType::ChangeAbandonedEvent => "ChangeAbandonedEvent",
            DocType::ChangeMergedEvent => "ChangeMergedEvent",
            DocType::ChangeCommitPushedEvent => "ChangeCommitPushedEvent",
            DocType::ChangeCommitForcePushedEvent => "ChangeCommitForcePushedEvent",
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        std::iter::once(DocType::Change)
            .chain(DocType::EVENTS)
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown document type: {}", s))
    }
}

/// The `type` tag of a change document. It only ever holds `"Change"`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ChangeKind {
    #[default]
    Change,
}

/// The `type` tag of an event document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChangeCreatedEvent,
    ChangeCommentedEvent,
    ChangeReviewedEvent,
    ChangeAbandonedEvent,
    ChangeMergedEvent,
    ChangeCommitPushedEvent,
    ChangeCommitForcePushedEvent,
}

impl From<EventKind> for DocType {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::ChangeCreatedEvent => DocType::ChangeCreatedEvent,
            EventKind::ChangeCommentedEvent => DocType::ChangeCommentedEvent,
            EventKind::ChangeReviewedEvent => DocType::ChangeReviewedEvent,
            EventKind::ChangeAbandonedEvent => DocType::ChangeAbandonedEvent,
            EventKind::ChangeMergedEvent => DocType::ChangeMergedEvent,
            EventKind::ChangeCommitPushedEvent => DocType::ChangeCommitPushedEvent,
            EventKind::ChangeCommitForcePushedEvent => DocType::ChangeCommitForcePushedEvent,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeState {
    Open,
    Merged,
    Closed,
}

impl ChangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeState::Open => "OPEN",
            ChangeState::Merged => "MERGED",
            ChangeState::Closed => "CLOSED",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ChangeState::Merged | ChangeState::Closed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangedFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletions: Option<u64>,
}

impl ChangedFile {
    /// The path-only form attached to events.
    pub fn path_only(&self) -> Self {
        Self {
            path: self.path.clone(),
            additions: None,
            deletions: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Commit {
    pub sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committer: Option<String>,
    pub authored_at: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
    pub additions: u64,
    pub deletions: u64,
    pub title: String,
}

/// A pull request, as stored in the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Change {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub id: String,
    pub number: u64,
    pub change_id: String,
    pub title: String,
    #[serde(default)]
    pub text: String,
    pub url: String,
    #[serde(default)]
    pub commit_count: u64,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default)]
    pub changed_files_count: u64,
    #[serde(default)]
    pub changed_files: Vec<ChangedFile>,
    #[serde(default)]
    pub commits: Vec<Commit>,
    pub repository_prefix: String,
    pub repository_fullname: String,
    pub repository_shortname: String,
    pub author: String,
    #[serde(default)]
    pub merged_by: Option<String>,
    pub branch: String,
    pub target_branch: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    pub state: ChangeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default)]
    pub mergeable: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub approval: Vec<String>,
    #[serde(default)]
    pub draft: bool,
}

/// Something that happened on a change. Events carry a copy of the change
/// attributes so they can be filtered without a join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<String>,
    pub repository_prefix: String,
    pub repository_fullname: String,
    pub repository_shortname: String,
    pub branch: String,
    pub target_branch: String,
    pub number: u64,
    pub change_id: String,
    pub url: String,
    pub on_author: String,
    pub on_created_at: DateTime<Utc>,
    #[serde(default)]
    pub changed_files: Vec<ChangedFile>,
}

impl Event {
    /// Build an event attached to `change`.
    pub fn on_change(
        kind: EventKind,
        id: impl Into<String>,
        created_at: DateTime<Utc>,
        author: Option<String>,
        change: &Change,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            created_at,
            author,
            approval: None,
            repository_prefix: change.repository_prefix.clone(),
            repository_fullname: change.repository_fullname.clone(),
            repository_shortname: change.repository_shortname.clone(),
            branch: change.branch.clone(),
            target_branch: change.target_branch.clone(),
            number: change.number,
            change_id: change.change_id.clone(),
            url: change.url.clone(),
            on_author: change.author.clone(),
            on_created_at: change.created_at,
            changed_files: change.changed_files.iter().map(ChangedFile::path_only).collect(),
        }
    }

    pub fn with_approval(mut self, approval: impl Into<String>) -> Self {
        self.approval = Some(approval.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Document {
    Change(Box<Change>),
    Event(Event),
}

impl Document {
    pub fn id(&self) -> &str {
        match self {
            Document::Change(change) => &change.id,
            Document::Event(event) => &event.id,
        }
    }

    pub fn doc_type(&self) -> DocType {
        match self {
            Document::Change(_) => DocType::Change,
            Document::Event(event) => event.kind.into(),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Document::Change(change) => change.created_at,
            Document::Event(event) => event.created_at,
        }
    }
}

impl From<Change> for Document {
    fn from(change: Change) -> Self {
        Document::Change(Box::new(change))
    }
}

impl From<Event> for Document {
    fn from(event: Event) -> Self {
        Document::Event(event)
    }
}
