//! The catalogue of named analytics queries.
//!
//! Every query runs against one index and a set of repository regexps, and
//! narrows the shared filter built by [`generate_filter`] by overriding the
//! document types, change state or author fields of the caller's parameters.

use crate::backend::{SearchBackend, StoreError, StoreResult};
use crate::filter::generate_filter;
use crate::params::QueryParams;
use crate::types::{Change, ChangeState, DocType, Document, Event};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

const TOP_TERMS_DEPTH: usize = 1000;
const HOT_CHANGES_DEPTH: usize = 500;
const NEW_CONTRIBUTORS_DEPTH: usize = 10000;
const FIRST_RESPONDERS: usize = 10;
const DAY: i64 = 24 * 3600;

/// Where a query runs: a backend, an index and the repositories in scope.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub backend: &'a dyn SearchBackend,
    pub index: &'a str,
    pub repositories: &'a [String],
}

impl<'a> Scope<'a> {
    pub fn new(
        backend: &'a dyn SearchBackend,
        index: &'a str,
        repositories: &'a [String],
    ) -> Self {
        Self {
            backend,
            index,
            repositories,
        }
    }

    fn filter(&self, params: &QueryParams) -> Value {
        generate_filter(self.repositories, params)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TermBucket {
    pub key: String,
    pub doc_count: u64,
}

/// A page of the most frequent values of a field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopTerms {
    pub items: Vec<TermBucket>,
    pub count_avg: f64,
    pub count_median: f64,
    pub total: usize,
    pub total_hits: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoBucket {
    pub key_as_string: String,
    pub key: i64,
    pub doc_count: u64,
}

/// Date histogram buckets and the average bucket count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsHisto(pub Vec<HistoBucket>, pub f64);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DurationBucket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<f64>,
    pub doc_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvgValue {
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClosedRatios {
    #[serde(rename = "merged/created")]
    pub merged: f64,
    #[serde(rename = "abandoned/created")]
    pub abandoned: f64,
    #[serde(rename = "iterations/created")]
    pub iterations: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FirstEventStats {
    pub first_event_delay_avg: i64,
    pub top_authors: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Items<T> {
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HotChange {
    #[serde(flatten)]
    pub change: Change,
    pub hot_score: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventCounts {
    pub events_count: u64,
    pub authors_count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LifecycleStats {
    pub ratios: ClosedRatios,
    pub histos: BTreeMap<DocType, EventsHisto>,
    pub avgs: BTreeMap<DocType, f64>,
    #[serde(flatten)]
    pub counts: BTreeMap<DocType, EventCounts>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FirstEventDelay {
    pub comment: FirstEventStats,
    pub review: FirstEventStats,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReviewStats {
    pub first_event_delay: FirstEventDelay,
    pub histos: BTreeMap<DocType, EventsHisto>,
    #[serde(flatten)]
    pub counts: BTreeMap<DocType, EventCounts>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReviewedAuthors {
    pub reviewed: TopTerms,
    pub commented: TopTerms,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StateChangedChanges {
    pub merged_changes: Page<Change>,
    pub opened_changes: Page<Change>,
}

macro_rules! named_queries {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Queries reachable by name from the CLI and the HTTP API.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum NamedQuery {
            $($variant),+
        }

        impl NamedQuery {
            pub const ALL: &'static [NamedQuery] = &[$(NamedQuery::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(NamedQuery::$variant => $name),+
                }
            }
        }
    };
}

named_queries! {
    CountEvents => "count_events",
    CountAuthors => "count_authors",
    EventsHisto => "events_histo",
    ReposTopMerged => "repos_top_merged",
    ReposTopOpened => "repos_top_opened",
    EventsTopAuthors => "events_top_authors",
    ChangesTopApproval => "changes_top_approval",
    ChangesTopCommented => "changes_top_commented",
    ChangesTopReviewed => "changes_top_reviewed",
    AuthorsTopReviewed => "authors_top_reviewed",
    AuthorsTopCommented => "authors_top_commented",
    AuthorsTopMerged => "authors_top_merged",
    AuthorsTopOpened => "authors_top_opened",
    PeersExchangeStrength => "peers_exchange_strength",
    ChangeMergedCountByDuration => "change_merged_count_by_duration",
    ChangeMergedAvgDuration => "change_merged_avg_duration",
    ChangesClosedRatios => "changes_closed_ratios",
    FirstCommentOnChanges => "first_comment_on_changes",
    FirstReviewOnChanges => "first_review_on_changes",
    ColdChanges => "cold_changes",
    HotChanges => "hot_changes",
    ChangesLifecycleHistos => "changes_lifecycle_histos",
    ChangesLifecycleStats => "changes_lifecycle_stats",
    ChangesReviewHistos => "changes_review_histos",
    ChangesReviewStats => "changes_review_stats",
    MostActiveAuthorsStats => "most_active_authors_stats",
    MostReviewedAuthorsStats => "most_reviewed_authors_stats",
    LastMergedChanges => "last_merged_changes",
    LastReviewEvents => "last_review_events",
    LastCommentEvents => "last_comment_events",
    LastOpenedChanges => "last_opened_changes",
    LastStateChangedChanges => "last_state_changed_changes",
    OldestOpenChanges => "oldest_open_changes",
    ChangesAndEvents => "changes_and_events",
    LastAbandonedChanges => "last_abandoned_changes",
    NewContributors => "new_contributors",
}

impl fmt::Display for NamedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NamedQuery {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NamedQuery::ALL
            .iter()
            .copied()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| StoreError::UnknownQuery {
                name: s.to_string(),
            })
    }
}

/// Run `query` and return its result as JSON.
pub async fn run(query: NamedQuery, scope: Scope<'_>, params: &QueryParams) -> StoreResult<Value> {
    debug!("running query {} on {}", query, scope.index);
    let value = match query {
        NamedQuery::CountEvents => json!(count_events(scope, params).await?),
        NamedQuery::CountAuthors => json!(count_authors(scope, params).await?),
        NamedQuery::EventsHisto => serde_json::to_value(events_histo(scope, params).await?)?,
        NamedQuery::ReposTopMerged => {
            serde_json::to_value(repos_top_merged(scope, params).await?)?
        }
        NamedQuery::ReposTopOpened => {
            serde_json::to_value(repos_top_opened(scope, params).await?)?
        }
        NamedQuery::EventsTopAuthors => {
            serde_json::to_value(events_top_authors(scope, params).await?)?
        }
        NamedQuery::ChangesTopApproval => {
            serde_json::to_value(changes_top_approval(scope, params).await?)?
        }
        NamedQuery::ChangesTopCommented => {
            serde_json::to_value(changes_top_commented(scope, params).await?)?
        }
        NamedQuery::ChangesTopReviewed => {
            serde_json::to_value(changes_top_reviewed(scope, params).await?)?
        }
        NamedQuery::AuthorsTopReviewed => {
            serde_json::to_value(authors_top_reviewed(scope, params).await?)?
        }
        NamedQuery::AuthorsTopCommented => {
            serde_json::to_value(authors_top_commented(scope, params).await?)?
        }
        NamedQuery::AuthorsTopMerged => {
            serde_json::to_value(authors_top_merged(scope, params).await?)?
        }
        NamedQuery::AuthorsTopOpened => {
            serde_json::to_value(authors_top_opened(scope, params).await?)?
        }
        NamedQuery::PeersExchangeStrength => {
            serde_json::to_value(peers_exchange_strength(scope, params).await?)?
        }
        NamedQuery::ChangeMergedCountByDuration => {
            serde_json::to_value(change_merged_count_by_duration(scope, params).await?)?
        }
        NamedQuery::ChangeMergedAvgDuration => {
            serde_json::to_value(change_merged_avg_duration(scope, params).await?)?
        }
        NamedQuery::ChangesClosedRatios => {
            serde_json::to_value(changes_closed_ratios(scope, params).await?)?
        }
        NamedQuery::FirstCommentOnChanges => {
            serde_json::to_value(first_comment_on_changes(scope, params).await?)?
        }
        NamedQuery::FirstReviewOnChanges => {
            serde_json::to_value(first_review_on_changes(scope, params).await?)?
        }
        NamedQuery::ColdChanges => serde_json::to_value(cold_changes(scope, params).await?)?,
        NamedQuery::HotChanges => serde_json::to_value(hot_changes(scope, params).await?)?,
        NamedQuery::ChangesLifecycleHistos => {
            serde_json::to_value(changes_lifecycle_histos(scope, params).await?)?
        }
        NamedQuery::ChangesLifecycleStats => {
            serde_json::to_value(changes_lifecycle_stats(scope, params).await?)?
        }
        NamedQuery::ChangesReviewHistos => {
            serde_json::to_value(changes_review_histos(scope, params).await?)?
        }
        NamedQuery::ChangesReviewStats => {
            serde_json::to_value(changes_review_stats(scope, params).await?)?
        }
        NamedQuery::MostActiveAuthorsStats => {
            serde_json::to_value(most_active_authors_stats(scope, params).await?)?
        }
        NamedQuery::MostReviewedAuthorsStats => {
            serde_json::to_value(most_reviewed_authors_stats(scope, params).await?)?
        }
        NamedQuery::LastMergedChanges => {
            serde_json::to_value(last_merged_changes(scope, params).await?)?
        }
        NamedQuery::LastReviewEvents => {
            serde_json::to_value(last_review_events(scope, params).await?)?
        }
        NamedQuery::LastCommentEvents => {
            serde_json::to_value(last_comment_events(scope, params).await?)?
        }
        NamedQuery::LastOpenedChanges => {
            serde_json::to_value(last_opened_changes(scope, params).await?)?
        }
        NamedQuery::LastStateChangedChanges => {
            serde_json::to_value(last_state_changed_changes(scope, params).await?)?
        }
        NamedQuery::OldestOpenChanges => {
            serde_json::to_value(oldest_open_changes(scope, params).await?)?
        }
        NamedQuery::ChangesAndEvents => {
            serde_json::to_value(changes_and_events(scope, params).await?)?
        }
        NamedQuery::LastAbandonedChanges => {
            serde_json::to_value(last_abandoned_changes(scope, params).await?)?
        }
        NamedQuery::NewContributors => {
            serde_json::to_value(new_contributors(scope, params).await?)?
        }
    };
    Ok(value)
}

fn decode_all<T: DeserializeOwned>(
    values: impl IntoIterator<Item = Value>,
) -> StoreResult<Vec<T>> {
    values
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(StoreError::from))
        .collect()
}

fn mean(series: &[u64]) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    series.iter().sum::<u64>() as f64 / series.len() as f64
}

fn median(series: &[u64]) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    let mut sorted = series.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn float_trunc(value: f64) -> f64 {
    (value * 100.0).trunc() / 100.0
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator != 0).then(|| numerator as f64 / denominator as f64)
}

/// Source documents of every match.
pub async fn scan(scope: Scope<'_>, params: &QueryParams) -> StoreResult<Vec<Value>> {
    let body = json!({ "query": scope.filter(params) });
    scope.backend.scan(scope.index, body).await
}

/// Creation date of the oldest matching document.
pub async fn first_created_event(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<Option<DateTime<Utc>>> {
    let body = json!({
        "sort": [{ "created_at": { "order": "asc" } }],
        "size": 1,
        "query": scope.filter(params),
    });
    let data = scope.backend.search(scope.index, body).await?;
    let first = data
        .sources()
        .next()
        .and_then(|source| source.get("created_at").cloned());
    first
        .map(serde_json::from_value)
        .transpose()
        .map_err(StoreError::from)
}

pub async fn count_events(scope: Scope<'_>, params: &QueryParams) -> StoreResult<u64> {
    let body = json!({ "query": scope.filter(params) });
    scope.backend.count(scope.index, body).await
}

pub async fn count_authors(scope: Scope<'_>, params: &QueryParams) -> StoreResult<u64> {
    #[derive(Deserialize)]
    struct Cardinality {
        value: u64,
    }

    let body = json!({
        "aggs": {
            "agg1": { "cardinality": { "field": "author", "precision_threshold": 3000 } }
        },
        "size": 0,
        "query": scope.filter(params),
    });
    let data = scope.backend.search(scope.index, body).await?;
    let agg: Cardinality = data.aggregation("agg1")?;
    Ok(agg.value)
}

fn interval_to_format(interval: &str) -> &'static str {
    match interval.chars().last() {
        Some('h') => "yyyy-MM-dd HH:00",
        Some('d') | Some('w') => "yyyy-MM-dd",
        Some('M') => "yyyy-MM",
        Some('y') => "yyyy",
        _ => "yyyy-MM-dd HH:mm",
    }
}

/// Calendar units only accept a single unit, everything else is a fixed span.
fn interval_kind(interval: &str) -> &'static str {
    let calendar_unit = matches!(interval.chars().last(), Some('w' | 'M' | 'q' | 'y'));
    if calendar_unit && interval.trim_end_matches(['w', 'M', 'q', 'y']) == "1" {
        "calendar_interval"
    } else {
        "fixed_interval"
    }
}

pub async fn events_histo(scope: Scope<'_>, params: &QueryParams) -> StoreResult<EventsHisto> {
    #[derive(Deserialize)]
    struct Histogram {
        buckets: Vec<HistoBucket>,
    }

    let mut histogram = serde_json::Map::new();
    histogram.insert("field".to_string(), json!("created_at"));
    histogram.insert(interval_kind(&params.interval).to_string(), json!(params.interval));
    histogram.insert("format".to_string(), json!(interval_to_format(&params.interval)));
    histogram.insert("min_doc_count".to_string(), json!(0));
    if params.gte.is_some() || params.lte.is_some() {
        let mut bounds = serde_json::Map::new();
        if let Some(gte) = params.gte {
            bounds.insert("min".to_string(), json!(gte));
        }
        if let Some(lte) = params.lte {
            bounds.insert("max".to_string(), json!(lte));
        }
        histogram.insert("extended_bounds".to_string(), Value::Object(bounds));
    }

    let body = json!({
        "aggs": {
            "agg1": { "date_histogram": histogram },
            "avg_count": { "avg_bucket": { "buckets_path": "agg1>_count" } },
        },
        "size": 0,
        "query": scope.filter(params),
    });
    let data = scope.backend.search(scope.index, body).await?;
    let histo: Histogram = data.aggregation("agg1")?;
    let avg: AvgValue = data.aggregation("avg_count")?;
    Ok(EventsHisto(histo.buckets, avg.value.unwrap_or(0.0)))
}

/// Most frequent values of `field`, paginated with the `from`/`size` params.
pub async fn events_top(
    scope: Scope<'_>,
    field: &str,
    params: &QueryParams,
) -> StoreResult<TopTerms> {
    #[derive(Deserialize)]
    struct Terms {
        buckets: Vec<TermBucket>,
    }

    let body = json!({
        "aggs": {
            "agg1": {
                "terms": {
                    "field": field,
                    "size": TOP_TERMS_DEPTH,
                    "order": { "_count": "desc" },
                }
            }
        },
        "size": 0,
        "query": scope.filter(params),
    });
    let data = scope.backend.search(scope.index, body).await?;
    let terms: Terms = data.aggregation("agg1")?;

    let counts: Vec<u64> = terms.buckets.iter().map(|b| b.doc_count).collect();
    let total = terms.buckets.len();
    let items = terms
        .buckets
        .into_iter()
        .skip(params.from)
        .take(params.size)
        .collect();
    Ok(TopTerms {
        items,
        count_avg: mean(&counts),
        count_median: median(&counts),
        total,
        total_hits: data.total(),
    })
}

pub async fn repos_top_merged(scope: Scope<'_>, params: &QueryParams) -> StoreResult<TopTerms> {
    let mut params = params.clone().with_etype(&[DocType::ChangeMergedEvent]);
    params.switch_to_on_authors();
    events_top(scope, "repository_fullname", &params).await
}

pub async fn repos_top_opened(scope: Scope<'_>, params: &QueryParams) -> StoreResult<TopTerms> {
    let params = params
        .clone()
        .with_etype(&[DocType::Change])
        .with_state(ChangeState::Open);
    events_top(scope, "repository_fullname", &params).await
}

pub async fn events_top_authors(scope: Scope<'_>, params: &QueryParams) -> StoreResult<TopTerms> {
    events_top(scope, "author", params).await
}

pub async fn changes_top_approval(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<TopTerms> {
    let params = params.clone().with_etype(&[DocType::ChangeReviewedEvent]);
    events_top(scope, "approval", &params).await
}

pub async fn changes_top_commented(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<TopTerms> {
    let params = params.clone().with_etype(&[DocType::ChangeCommentedEvent]);
    events_top(scope, "change_id", &params).await
}

pub async fn changes_top_reviewed(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<TopTerms> {
    let params = params.clone().with_etype(&[DocType::ChangeReviewedEvent]);
    events_top(scope, "change_id", &params).await
}

pub async fn authors_top_reviewed(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<TopTerms> {
    let params = params.clone().with_etype(&[DocType::ChangeReviewedEvent]);
    events_top(scope, "on_author", &params).await
}

pub async fn authors_top_commented(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<TopTerms> {
    let params = params.clone().with_etype(&[DocType::ChangeCommentedEvent]);
    events_top(scope, "on_author", &params).await
}

pub async fn authors_top_merged(scope: Scope<'_>, params: &QueryParams) -> StoreResult<TopTerms> {
    let mut params = params.clone().with_etype(&[DocType::ChangeMergedEvent]);
    params.switch_to_on_authors();
    events_top(scope, "on_author", &params).await
}

pub async fn authors_top_opened(scope: Scope<'_>, params: &QueryParams) -> StoreResult<TopTerms> {
    let params = params
        .clone()
        .with_etype(&[DocType::Change])
        .with_state(ChangeState::Open);
    events_top(scope, "author", &params).await
}

/// Pairs of people who review or comment each other's changes the most.
pub async fn peers_exchange_strength(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<Vec<((String, String), u64)>> {
    let mut params = params
        .clone()
        .with_etype(&[DocType::ChangeReviewedEvent, DocType::ChangeCommentedEvent]);
    let authors: Vec<String> = events_top(scope, "author", &params)
        .await?
        .items
        .into_iter()
        .map(|bucket| bucket.key)
        .collect();

    let mut strength: BTreeMap<(String, String), u64> = BTreeMap::new();
    for author in authors {
        params.authors = Some(vec![author.clone()]);
        let peers = events_top(scope, "on_author", &params).await?.items;
        for bucket in peers {
            if bucket.key == author {
                continue;
            }
            let pair = if author <= bucket.key {
                (author.clone(), bucket.key)
            } else {
                (bucket.key, author.clone())
            };
            *strength.entry(pair).or_insert(0) += bucket.doc_count;
        }
    }

    let mut ranked: Vec<((String, String), u64)> = strength.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(ranked)
}

pub async fn change_merged_count_by_duration(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<BTreeMap<String, DurationBucket>> {
    #[derive(Deserialize)]
    struct Ranges {
        buckets: BTreeMap<String, DurationBucket>,
    }

    let params = params
        .clone()
        .with_etype(&[DocType::Change])
        .with_state(ChangeState::Merged);
    let body = json!({
        "aggs": {
            "agg1": {
                "range": {
                    "field": "duration",
                    "ranges": [
                        { "to": DAY },
                        { "from": DAY + 1, "to": 7 * DAY },
                        { "from": 7 * DAY + 1, "to": 31 * DAY },
                        { "from": 31 * DAY + 1 },
                    ],
                    "keyed": true,
                }
            }
        },
        "size": 0,
        "query": scope.filter(&params),
    });
    let data = scope.backend.search(scope.index, body).await?;
    let ranges: Ranges = data.aggregation("agg1")?;
    Ok(ranges.buckets)
}

pub async fn change_merged_avg_duration(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<AvgValue> {
    let params = params
        .clone()
        .with_etype(&[DocType::Change])
        .with_state(ChangeState::Merged);
    let body = json!({
        "aggs": { "agg1": { "avg": { "field": "duration" } } },
        "size": 0,
        "query": scope.filter(&params),
    });
    let data = scope.backend.search(scope.index, body).await?;
    data.aggregation("agg1")
}

pub async fn changes_closed_ratios(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<ClosedRatios> {
    let mut params = params.clone();
    params.switch_to_on_authors();

    let mut counts = HashMap::new();
    for etype in DocType::LIFECYCLE {
        let params = params.clone().with_etype(&[etype]);
        counts.insert(etype, count_events(scope, &params).await?);
    }
    let count = |t: DocType| counts.get(&t).copied().unwrap_or(0);
    let created = count(DocType::ChangeCreatedEvent);
    let pushes =
        count(DocType::ChangeCommitPushedEvent) + count(DocType::ChangeCommitForcePushedEvent);

    Ok(ClosedRatios {
        merged: ratio(count(DocType::ChangeMergedEvent), created)
            .map(|r| round1(r * 100.0))
            .unwrap_or(0.0),
        abandoned: ratio(count(DocType::ChangeAbandonedEvent), created)
            .map(|r| round1(r * 100.0))
            .unwrap_or(0.0),
        iterations: ratio(pushes, created)
            .map(|r| round1(r + 1.0))
            .unwrap_or(1.0),
    })
}

#[derive(Deserialize)]
struct EventTiming {
    change_id: String,
    created_at: DateTime<Utc>,
    on_created_at: DateTime<Utc>,
    author: Option<String>,
}

/// For each change, how long it waited for its first matching event and who
/// authored that event.
pub async fn first_event_on_changes(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<FirstEventStats> {
    let events: Vec<EventTiming> = decode_all(scan(scope, params).await?)?;

    let mut firsts: HashMap<String, &EventTiming> = HashMap::new();
    for event in &events {
        firsts
            .entry(event.change_id.clone())
            .and_modify(|first| {
                if event.created_at < first.created_at {
                    *first = event;
                }
            })
            .or_insert(event);
    }

    let mut delay_total = 0i64;
    let mut responders: BTreeMap<String, u64> = BTreeMap::new();
    for first in firsts.values() {
        delay_total += (first.created_at - first.on_created_at).num_seconds();
        let author = first.author.clone().unwrap_or_else(|| "ghost".to_string());
        *responders.entry(author).or_insert(0) += 1;
    }

    let first_event_delay_avg = if firsts.is_empty() {
        0
    } else {
        delay_total / firsts.len() as i64
    };
    let mut top_authors: Vec<(String, u64)> = responders.into_iter().collect();
    top_authors.sort_by(|a, b| b.1.cmp(&a.1));
    top_authors.truncate(FIRST_RESPONDERS);

    Ok(FirstEventStats {
        first_event_delay_avg,
        top_authors,
    })
}

pub async fn first_comment_on_changes(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<FirstEventStats> {
    let params = params.clone().with_etype(&[DocType::ChangeCommentedEvent]);
    first_event_on_changes(scope, &params).await
}

pub async fn first_review_on_changes(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<FirstEventStats> {
    let params = params.clone().with_etype(&[DocType::ChangeReviewedEvent]);
    first_event_on_changes(scope, &params).await
}

/// Open changes nobody commented or reviewed yet, oldest first.
pub async fn cold_changes(scope: Scope<'_>, params: &QueryParams) -> StoreResult<Items<Change>> {
    let change_params = params
        .clone()
        .with_etype(&[DocType::Change])
        .with_state(ChangeState::Open);
    let changes: Vec<Change> = decode_all(scan(scope, &change_params).await?)?;

    let event_params = params
        .clone()
        .with_etype(&[DocType::ChangeCommentedEvent, DocType::ChangeReviewedEvent]);
    let touched: HashSet<String> = scan(scope, &event_params)
        .await?
        .into_iter()
        .filter_map(|event| event.get("change_id")?.as_str().map(str::to_string))
        .collect();

    let mut items: Vec<Change> = changes
        .into_iter()
        .filter(|change| !touched.contains(&change.change_id))
        .collect();
    items.sort_by_key(|change| change.created_at);
    if params.size > 0 {
        items.truncate(params.size);
    }
    Ok(Items { items })
}

/// Open changes with more comments than the median, the busiest first.
pub async fn hot_changes(scope: Scope<'_>, params: &QueryParams) -> StoreResult<Items<HotChange>> {
    let size = params.size;
    let mut deep = params.clone();
    deep.size = HOT_CHANGES_DEPTH;
    let top = changes_top_commented(scope, &deep).await?;

    let scores: HashMap<String, u64> = top
        .items
        .iter()
        .filter(|bucket| bucket.doc_count as f64 > top.count_median)
        .map(|bucket| (bucket.key.clone(), bucket.doc_count))
        .collect();
    if scores.is_empty() {
        return Ok(Items { items: vec![] });
    }

    let change_params = QueryParams {
        change_ids: Some(scores.keys().cloned().collect()),
        ..QueryParams::default()
    }
    .with_etype(&[DocType::Change])
    .with_state(ChangeState::Open);
    let changes: Vec<Change> = decode_all(scan(scope, &change_params).await?)?;

    let mut items: Vec<HotChange> = changes
        .into_iter()
        .filter_map(|change| {
            let hot_score = scores.get(&change.change_id).copied()?;
            Some(HotChange { change, hot_score })
        })
        .collect();
    items.sort_by(|a, b| b.hot_score.cmp(&a.hot_score));
    if size > 0 {
        items.truncate(size);
    }
    Ok(Items { items })
}

async fn histos_for(
    scope: Scope<'_>,
    params: &QueryParams,
    etypes: &[DocType],
) -> StoreResult<BTreeMap<DocType, EventsHisto>> {
    let mut histos = BTreeMap::new();
    for etype in etypes {
        let params = params.clone().with_etype(&[*etype]);
        histos.insert(*etype, events_histo(scope, &params).await?);
    }
    Ok(histos)
}

async fn counts_for(
    scope: Scope<'_>,
    params: &QueryParams,
    etypes: &[DocType],
) -> StoreResult<BTreeMap<DocType, EventCounts>> {
    let mut counts = BTreeMap::new();
    for etype in etypes {
        let params = params.clone().with_etype(&[*etype]);
        counts.insert(
            *etype,
            EventCounts {
                events_count: count_events(scope, &params).await?,
                authors_count: count_authors(scope, &params).await?,
            },
        );
    }
    Ok(counts)
}

pub async fn changes_lifecycle_histos(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<BTreeMap<DocType, EventsHisto>> {
    let mut params = params.clone();
    params.switch_to_on_authors();
    histos_for(scope, &params, &DocType::LIFECYCLE).await
}

pub async fn changes_lifecycle_stats(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<LifecycleStats> {
    let mut params = params.clone();
    params.switch_to_on_authors();

    let ratios = changes_closed_ratios(scope, &params).await?;
    let histos = changes_lifecycle_histos(scope, &params).await?;
    let avgs = histos
        .iter()
        .map(|(etype, histo)| (*etype, float_trunc(histo.1)))
        .collect();
    let counts = counts_for(scope, &params, &DocType::LIFECYCLE).await?;

    Ok(LifecycleStats {
        ratios,
        histos,
        avgs,
        counts,
    })
}

const REVIEW_TYPES: [DocType; 2] = [DocType::ChangeCommentedEvent, DocType::ChangeReviewedEvent];

pub async fn changes_review_histos(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<BTreeMap<DocType, EventsHisto>> {
    histos_for(scope, params, &REVIEW_TYPES).await
}

pub async fn changes_review_stats(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<ReviewStats> {
    Ok(ReviewStats {
        first_event_delay: FirstEventDelay {
            comment: first_comment_on_changes(scope, params).await?,
            review: first_review_on_changes(scope, params).await?,
        },
        histos: changes_review_histos(scope, params).await?,
        counts: counts_for(scope, params, &REVIEW_TYPES).await?,
    })
}

pub async fn most_active_authors_stats(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<BTreeMap<DocType, TopTerms>> {
    let mut stats = BTreeMap::new();
    for etype in [
        DocType::ChangeCreatedEvent,
        DocType::ChangeReviewedEvent,
        DocType::ChangeCommentedEvent,
    ] {
        let params = params.clone().with_etype(&[etype]);
        stats.insert(etype, events_top_authors(scope, &params).await?);
    }
    let mut params = params.clone();
    params.switch_to_on_authors();
    stats.insert(
        DocType::ChangeMergedEvent,
        authors_top_merged(scope, &params).await?,
    );
    Ok(stats)
}

pub async fn most_reviewed_authors_stats(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<ReviewedAuthors> {
    Ok(ReviewedAuthors {
        reviewed: authors_top_reviewed(scope, params).await?,
        commented: authors_top_commented(scope, params).await?,
    })
}

/// One page of matching documents ordered on `sort_field`.
pub async fn last_documents<T: DeserializeOwned>(
    scope: Scope<'_>,
    params: &QueryParams,
    sort_field: &str,
    ascending: bool,
) -> StoreResult<Page<T>> {
    let order = if ascending { "asc" } else { "desc" };
    let body = json!({
        "sort": [{ sort_field: { "order": order } }],
        "size": params.size,
        "from": params.from,
        "query": scope.filter(params),
    });
    let data = scope.backend.search(scope.index, body).await?;
    let total = data.total();
    let items = decode_all(data.hits.hits.into_iter().map(|hit| hit.source))?;
    Ok(Page { items, total })
}

pub async fn last_merged_changes(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<Page<Change>> {
    let params = params
        .clone()
        .with_etype(&[DocType::Change])
        .with_state(ChangeState::Merged);
    last_documents(scope, &params, "closed_at", false).await
}

pub async fn last_opened_changes(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<Page<Change>> {
    let params = params
        .clone()
        .with_etype(&[DocType::Change])
        .with_state(ChangeState::Open);
    last_documents(scope, &params, "created_at", false).await
}

pub async fn last_review_events(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<Page<Event>> {
    let params = params.clone().with_etype(&[DocType::ChangeReviewedEvent]);
    last_documents(scope, &params, "created_at", false).await
}

pub async fn last_comment_events(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<Page<Event>> {
    let params = params.clone().with_etype(&[DocType::ChangeCommentedEvent]);
    last_documents(scope, &params, "created_at", false).await
}

pub async fn last_state_changed_changes(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<StateChangedChanges> {
    Ok(StateChangedChanges {
        merged_changes: last_merged_changes(scope, params).await?,
        opened_changes: last_opened_changes(scope, params).await?,
    })
}

pub async fn oldest_open_changes(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<Page<Change>> {
    let params = params
        .clone()
        .with_etype(&[DocType::Change])
        .with_state(ChangeState::Open);
    last_documents(scope, &params, "created_at", true).await
}

pub async fn changes_and_events(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<Page<Document>> {
    let mut etypes = vec![DocType::Change];
    etypes.extend(DocType::LIFECYCLE);
    etypes.extend([DocType::ChangeReviewedEvent, DocType::ChangeCommentedEvent]);
    let params = params.clone().with_etype(&etypes);
    last_documents(scope, &params, "created_at", true).await
}

pub async fn last_abandoned_changes(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<Page<Change>> {
    let params = params
        .clone()
        .with_etype(&[DocType::Change])
        .with_state(ChangeState::Closed);
    last_documents(scope, &params, "created_at", false).await
}

/// Authors active in the window who were never active before it.
pub async fn new_contributors(
    scope: Scope<'_>,
    params: &QueryParams,
) -> StoreResult<Items<TermBucket>> {
    let mut params = params.clone();
    params.size = NEW_CONTRIBUTORS_DEPTH;
    let recent = events_top_authors(scope, &params).await?.items;

    params.lte = params.gte.take();
    let before: HashSet<String> = events_top_authors(scope, &params)
        .await?
        .items
        .into_iter()
        .map(|bucket| bucket.key)
        .collect();

    Ok(Items {
        items: recent
            .into_iter()
            .filter(|bucket| !before.contains(&bucket.key))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SearchResponse;
    use crate::types::fixtures;
    use crate::types::EventKind;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers searches from a queue and records every request body.
    #[derive(Default)]
    struct ScriptedBackend {
        searches: Mutex<Vec<Value>>,
        counts: Mutex<Vec<u64>>,
        scans: Mutex<Vec<Vec<Value>>>,
        requests: Mutex<Vec<Value>>,
    }

    impl ScriptedBackend {
        fn with_searches(searches: Vec<Value>) -> Self {
            Self {
                searches: Mutex::new(searches),
                ..Default::default()
            }
        }

        fn requests(&self) -> Vec<Value> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SearchBackend for ScriptedBackend {
        async fn search(&self, _index: &str, body: Value) -> StoreResult<SearchResponse> {
            self.requests.lock().unwrap().push(body);
            let next = self.searches.lock().unwrap().remove(0);
            Ok(serde_json::from_value(next)?)
        }

        async fn count(&self, _index: &str, body: Value) -> StoreResult<u64> {
            self.requests.lock().unwrap().push(body);
            Ok(self.counts.lock().unwrap().remove(0))
        }

        async fn scan(&self, _index: &str, body: Value) -> StoreResult<Vec<Value>> {
            self.requests.lock().unwrap().push(body);
            Ok(self.scans.lock().unwrap().remove(0))
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
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "scripted"
        }
    }

    fn terms_response(buckets: &[(&str, u64)], total: u64) -> Value {
        let buckets: Vec<Value> = buckets
            .iter()
            .map(|(key, count)| json!({"key": key, "doc_count": count}))
            .collect();
        json!({"hits": {"total": {"value": total}, "hits": []},
               "aggregations": {"agg1": {"buckets": buckets}}})
    }

    fn repos() -> Vec<String> {
        vec!["unit/repo1".to_string()]
    }

    fn filter_types(request: &Value) -> Vec<String> {
        request["query"]["bool"]["filter"]
            .as_array()
            .unwrap()
            .iter()
            .find_map(|f| f["terms"].get("type"))
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t.as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_named_query_catalogue() {
        assert_eq!(NamedQuery::ALL.len(), 36);
        for query in NamedQuery::ALL {
            assert_eq!(query.as_str().parse::<NamedQuery>().unwrap(), *query);
        }
        assert!(matches!(
            "unknown".parse::<NamedQuery>(),
            Err(StoreError::UnknownQuery { name }) if name == "unknown"
        ));
    }

    #[test]
    fn test_statistics_helpers() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(median(&[]), 0.0);
        assert_eq!(mean(&[2, 1]), 1.5);
        assert_eq!(median(&[2, 1]), 1.5);
        assert_eq!(median(&[5, 1, 3]), 3.0);
        assert_eq!(round1(66.666), 66.7);
        assert_eq!(float_trunc(1.239), 1.23);
    }

    #[test]
    fn test_interval_mapping() {
        assert_eq!(interval_to_format("3h"), "yyyy-MM-dd HH:00");
        assert_eq!(interval_to_format("1d"), "yyyy-MM-dd");
        assert_eq!(interval_to_format("1M"), "yyyy-MM");
        assert_eq!(interval_to_format("30m"), "yyyy-MM-dd HH:mm");
        assert_eq!(interval_kind("3h"), "fixed_interval");
        assert_eq!(interval_kind("1w"), "calendar_interval");
        assert_eq!(interval_kind("1M"), "calendar_interval");
        assert_eq!(interval_kind("14d"), "fixed_interval");
    }

    #[tokio::test]
    async fn test_events_top_paginates_and_summarises() {
        let backend = ScriptedBackend::with_searches(vec![terms_response(
            &[("jane", 2), ("john", 1)],
            3,
        )]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let top = events_top_authors(scope, &QueryParams::default()).await.unwrap();
        assert_eq!(
            top,
            TopTerms {
                items: vec![
                    TermBucket { key: "jane".into(), doc_count: 2 },
                    TermBucket { key: "john".into(), doc_count: 1 },
                ],
                count_avg: 1.5,
                count_median: 1.5,
                total: 2,
                total_hits: 3,
            }
        );

        let backend = ScriptedBackend::with_searches(vec![terms_response(
            &[("a", 5), ("b", 3), ("c", 1)],
            9,
        )]);
        let scope = Scope::new(&backend, "monocle", &repositories);
        let params = QueryParams {
            from: 1,
            size: 1,
            ..Default::default()
        };
        let top = events_top_authors(scope, &params).await.unwrap();
        assert_eq!(top.items, vec![TermBucket { key: "b".into(), doc_count: 3 }]);
        assert_eq!(top.total, 3);
        assert_eq!(top.count_median, 3.0);
    }

    #[tokio::test]
    async fn test_repos_top_merged_switches_to_on_authors() {
        let backend = ScriptedBackend::with_searches(vec![terms_response(
            &[("unit/repo2", 2), ("unit/repo1", 1)],
            3,
        )]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);
        let params = QueryParams {
            authors: Some(vec!["jane".to_string()]),
            ..Default::default()
        };

        let top = repos_top_merged(scope, &params).await.unwrap();
        assert_eq!(top.items[0].key, "unit/repo2");

        let request = &backend.requests()[0];
        assert_eq!(request["aggs"]["agg1"]["terms"]["field"], "repository_fullname");
        assert_eq!(filter_types(request), vec!["ChangeMergedEvent"]);
        let filter = request["query"]["bool"]["filter"].as_array().unwrap();
        assert!(filter.contains(&json!({"terms": {"on_author": ["jane"]}})));
        assert!(!filter.iter().any(|f| f["terms"].get("author").is_some()));
    }

    #[tokio::test]
    async fn test_count_authors_and_histo() {
        let backend = ScriptedBackend::with_searches(vec![
            json!({"hits": {"total": 3, "hits": []},
                   "aggregations": {"agg1": {"value": 2}}}),
            json!({"hits": {"total": 3, "hits": []},
                   "aggregations": {
                       "agg1": {"buckets": [
                           {"key_as_string": "2020-01-01", "key": 1577836800000i64, "doc_count": 2},
                           {"key_as_string": "2020-01-02", "key": 1577923200000i64, "doc_count": 1}
                       ]},
                       "avg_count": {"value": null}
                   }}),
        ]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);
        let params = QueryParams {
            interval: "1d".to_string(),
            gte: Some(1_577_836_800_000),
            ..Default::default()
        };

        assert_eq!(count_authors(scope, &params).await.unwrap(), 2);
        let histo = events_histo(scope, &params).await.unwrap();
        assert_eq!(histo.0.len(), 2);
        assert_eq!(histo.1, 0.0);

        let request = &backend.requests()[1];
        let date_histogram = &request["aggs"]["agg1"]["date_histogram"];
        assert_eq!(date_histogram["fixed_interval"], "1d");
        assert_eq!(date_histogram["format"], "yyyy-MM-dd");
        assert_eq!(
            date_histogram["extended_bounds"],
            json!({"min": 1577836800000i64})
        );
    }

    #[tokio::test]
    async fn test_changes_closed_ratios() {
        let backend = ScriptedBackend {
            // created, merged, abandoned, pushed, force pushed
            counts: Mutex::new(vec![4, 3, 1, 6, 2]),
            ..Default::default()
        };
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let ratios = changes_closed_ratios(scope, &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(
            ratios,
            ClosedRatios {
                merged: 75.0,
                abandoned: 25.0,
                iterations: 3.0,
            }
        );
        assert_eq!(
            serde_json::to_value(&ratios).unwrap(),
            json!({"merged/created": 75.0, "abandoned/created": 25.0, "iterations/created": 3.0})
        );
    }

    #[tokio::test]
    async fn test_changes_closed_ratios_without_changes() {
        let backend = ScriptedBackend {
            counts: Mutex::new(vec![0, 0, 0, 0, 0]),
            ..Default::default()
        };
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let ratios = changes_closed_ratios(scope, &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(ratios.merged, 0.0);
        assert_eq!(ratios.abandoned, 0.0);
        assert_eq!(ratios.iterations, 1.0);
    }

    #[tokio::test]
    async fn test_peers_exchange_strength() {
        let backend = ScriptedBackend::with_searches(vec![
            terms_response(&[("jane", 3), ("john", 2)], 5),
            // who jane reviewed
            terms_response(&[("john", 2), ("jane", 1)], 3),
            // who john reviewed
            terms_response(&[("jane", 1), ("bob", 1)], 2),
        ]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let peers = peers_exchange_strength(scope, &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(
            peers,
            vec![
                (("jane".to_string(), "john".to_string()), 3),
                (("bob".to_string(), "john".to_string()), 1),
            ]
        );
        let requests = backend.requests();
        assert_eq!(
            requests[1]["query"]["bool"]["filter"]
                .as_array()
                .unwrap()
                .iter()
                .filter(|f| f["terms"].get("author").is_some())
                .count(),
            1
        );
    }

    fn comment(id: &str, change: u64, author: &str, day: u32, hour: u32) -> Value {
        let mut change = fixtures::change(change, "jane", ChangeState::Open);
        change.change_id = format!("unit@repo1@{}", change.number);
        serde_json::to_value(Event::on_change(
            EventKind::ChangeCommentedEvent,
            id,
            fixtures::ts(day, hour),
            Some(author.to_string()),
            &change,
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_event_on_changes() {
        let backend = ScriptedBackend {
            scans: Mutex::new(vec![vec![
                comment("e1", 1, "john", 1, 2),
                comment("e2", 1, "bob", 1, 1),
                comment("e3", 2, "john", 1, 4),
            ]]),
            ..Default::default()
        };
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let stats = first_comment_on_changes(scope, &QueryParams::default())
            .await
            .unwrap();
        // change 1 waited one hour for bob, change 2 four hours for john
        assert_eq!(stats.first_event_delay_avg, (3600 + 4 * 3600) / 2);
        assert_eq!(
            stats.top_authors,
            vec![("bob".to_string(), 1), ("john".to_string(), 1)]
        );
        assert_eq!(filter_types(&backend.requests()[0]), vec!["ChangeCommentedEvent"]);
    }

    #[tokio::test]
    async fn test_first_event_on_changes_without_events() {
        let backend = ScriptedBackend {
            scans: Mutex::new(vec![vec![]]),
            ..Default::default()
        };
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let stats = first_review_on_changes(scope, &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(stats.first_event_delay_avg, 0);
        assert!(stats.top_authors.is_empty());
    }

    #[tokio::test]
    async fn test_cold_changes() {
        let mut old = fixtures::change(1, "jane", ChangeState::Open);
        old.created_at = fixtures::ts(1, 0);
        let mut older = fixtures::change(2, "jane", ChangeState::Open);
        older.created_at = fixtures::ts(1, 0) - chrono::Duration::days(3);
        let mut commented = fixtures::change(3, "jane", ChangeState::Open);
        commented.change_id = "unit@repo1@3".to_string();

        let backend = ScriptedBackend {
            scans: Mutex::new(vec![
                vec![
                    serde_json::to_value(&old).unwrap(),
                    serde_json::to_value(&commented).unwrap(),
                    serde_json::to_value(&older).unwrap(),
                ],
                vec![comment("e1", 3, "john", 2, 0)],
            ]),
            ..Default::default()
        };
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let cold = cold_changes(scope, &QueryParams::default()).await.unwrap();
        let ids: Vec<&str> = cold.items.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c1"]);
    }

    #[tokio::test]
    async fn test_hot_changes() {
        let mut busy = fixtures::change(1, "jane", ChangeState::Open);
        busy.change_id = "unit@repo1@1".to_string();
        let mut busier = fixtures::change(2, "jane", ChangeState::Open);
        busier.change_id = "unit@repo1@2".to_string();

        let backend = ScriptedBackend {
            searches: Mutex::new(vec![terms_response(
                &[("unit@repo1@2", 9), ("unit@repo1@1", 5), ("unit@repo1@3", 1)],
                15,
            )]),
            scans: Mutex::new(vec![vec![
                serde_json::to_value(&busy).unwrap(),
                serde_json::to_value(&busier).unwrap(),
            ]]),
            ..Default::default()
        };
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let hot = hot_changes(scope, &QueryParams::default()).await.unwrap();
        let scores: Vec<(&str, u64)> = hot
            .items
            .iter()
            .map(|h| (h.change.id.as_str(), h.hot_score))
            .collect();
        assert_eq!(scores, vec![("c2", 9)]);

        let requests = backend.requests();
        assert_eq!(requests[0]["aggs"]["agg1"]["terms"]["field"], "change_id");
        let change_filter = requests[1]["query"]["bool"]["filter"].as_array().unwrap();
        assert!(change_filter.contains(&json!({"term": {"state": "OPEN"}})));
        assert_eq!(filter_types(&requests[1]), vec!["Change"]);
    }

    #[tokio::test]
    async fn test_hot_changes_without_activity() {
        let backend = ScriptedBackend::with_searches(vec![terms_response(&[], 0)]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let hot = hot_changes(scope, &QueryParams::default()).await.unwrap();
        assert!(hot.items.is_empty());
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_last_merged_changes() {
        let change = fixtures::change(1, "jane", ChangeState::Merged);
        let backend = ScriptedBackend::with_searches(vec![json!({
            "hits": {"total": {"value": 7}, "hits": [{"_source": change}]}
        })]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);
        let params = QueryParams {
            size: 1,
            from: 2,
            ..Default::default()
        };

        let page = last_merged_changes(scope, &params).await.unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.items, vec![change]);

        let request = &backend.requests()[0];
        assert_eq!(request["sort"], json!([{"closed_at": {"order": "desc"}}]));
        assert_eq!(request["size"], 1);
        assert_eq!(request["from"], 2);
    }

    #[tokio::test]
    async fn test_changes_and_events_mixes_documents() {
        let change = fixtures::change(1, "jane", ChangeState::Open);
        let event = Event::on_change(
            EventKind::ChangeCreatedEvent,
            "CCEc1",
            change.created_at,
            Some("jane".to_string()),
            &change,
        );
        let backend = ScriptedBackend::with_searches(vec![json!({
            "hits": {"total": 2, "hits": [{"_source": change}, {"_source": event}]}
        })]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let page = changes_and_events(scope, &QueryParams::default()).await.unwrap();
        let types: Vec<DocType> = page.items.iter().map(Document::doc_type).collect();
        assert_eq!(types, vec![DocType::Change, DocType::ChangeCreatedEvent]);
        assert_eq!(filter_types(&backend.requests()[0]).len(), 8);
    }

    #[tokio::test]
    async fn test_new_contributors() {
        let backend = ScriptedBackend::with_searches(vec![
            terms_response(&[("jane", 4), ("newbie", 1)], 5),
            terms_response(&[("jane", 10)], 10),
        ]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);
        let params = QueryParams {
            gte: Some(1_577_836_800_000),
            ..Default::default()
        };

        let new = new_contributors(scope, &params).await.unwrap();
        assert_eq!(
            new.items,
            vec![TermBucket { key: "newbie".into(), doc_count: 1 }]
        );

        let before = &backend.requests()[1];
        assert_eq!(
            before["query"]["bool"]["filter"][1],
            json!({"range": {"created_at": {"format": "epoch_millis", "lte": 1577836800000i64}}})
        );
    }

    #[tokio::test]
    async fn test_new_contributors_keeps_paging() {
        let backend = ScriptedBackend::with_searches(vec![
            terms_response(&[("jane", 4), ("newbie", 1), ("rookie", 1)], 6),
            terms_response(&[("jane", 10), ("rookie", 2)], 12),
        ]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);
        let params = QueryParams {
            gte: Some(1_577_836_800_000),
            from: 1,
            ..Default::default()
        };

        let new = new_contributors(scope, &params).await.unwrap();
        assert_eq!(
            new.items,
            vec![TermBucket { key: "newbie".into(), doc_count: 1 }]
        );
    }

    fn histo_response(counts: &[u64], avg: f64) -> Value {
        let buckets: Vec<Value> = counts
            .iter()
            .enumerate()
            .map(|(i, count)| {
                json!({"key_as_string": format!("2020-01-0{}", i + 1),
                       "key": 1_577_836_800_000i64 + i as i64 * 86_400_000,
                       "doc_count": count})
            })
            .collect();
        json!({"hits": {"total": counts.iter().sum::<u64>(), "hits": []},
               "aggregations": {"agg1": {"buckets": buckets}, "avg_count": {"value": avg}}})
    }

    fn cardinality_response(value: u64) -> Value {
        json!({"hits": {"total": 0, "hits": []}, "aggregations": {"agg1": {"value": value}}})
    }

    fn jane() -> QueryParams {
        QueryParams {
            authors: Some(vec!["jane".to_string()]),
            ..Default::default()
        }
    }

    fn filters(request: &Value) -> Vec<Value> {
        request["query"]["bool"]["filter"].as_array().unwrap().clone()
    }

    #[tokio::test]
    async fn test_change_merged_count_by_duration() {
        let backend = ScriptedBackend::with_searches(vec![json!({
            "hits": {"total": 3, "hits": []},
            "aggregations": {"agg1": {"buckets": {
                "*-86400.0": {"to": 86400.0, "doc_count": 2},
                "86401.0-604800.0": {"from": 86401.0, "to": 604800.0, "doc_count": 1},
                "604801.0-2678400.0": {"from": 604801.0, "to": 2678400.0, "doc_count": 0},
                "2678401.0-*": {"from": 2678401.0, "doc_count": 0}
            }}}
        })]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let ranges = change_merged_count_by_duration(scope, &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(ranges.len(), 4);
        assert_eq!(
            ranges["*-86400.0"],
            DurationBucket { from: None, to: Some(86400.0), doc_count: 2 }
        );
        assert_eq!(ranges["2678401.0-*"].from, Some(2678401.0));

        let request = &backend.requests()[0];
        let range = &request["aggs"]["agg1"]["range"];
        assert_eq!(range["field"], "duration");
        assert_eq!(range["keyed"], true);
        assert_eq!(
            range["ranges"],
            json!([
                {"to": 86400},
                {"from": 86401, "to": 604800},
                {"from": 604801, "to": 2678400},
                {"from": 2678401}
            ])
        );
        assert_eq!(request["size"], 0);
        assert_eq!(filter_types(request), vec!["Change"]);
        assert!(filters(request).contains(&json!({"term": {"state": "MERGED"}})));
    }

    #[tokio::test]
    async fn test_change_merged_avg_duration() {
        let backend = ScriptedBackend::with_searches(vec![
            json!({"hits": {"total": 2, "hits": []},
                   "aggregations": {"agg1": {"value": 7200.0}}}),
            json!({"hits": {"total": 0, "hits": []},
                   "aggregations": {"agg1": {"value": null}}}),
        ]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let avg = change_merged_avg_duration(scope, &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(avg, AvgValue { value: Some(7200.0) });
        let avg = change_merged_avg_duration(scope, &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(serde_json::to_value(&avg).unwrap(), json!({"value": null}));

        let request = &backend.requests()[0];
        assert_eq!(request["aggs"], json!({"agg1": {"avg": {"field": "duration"}}}));
        assert_eq!(filter_types(request), vec!["Change"]);
        assert!(filters(request).contains(&json!({"term": {"state": "MERGED"}})));
    }

    #[tokio::test]
    async fn test_changes_lifecycle_stats() {
        let backend = ScriptedBackend {
            // closed ratios, then the event count of each lifecycle type
            counts: Mutex::new(vec![4, 3, 1, 6, 2, 4, 3, 1, 6, 2]),
            searches: Mutex::new(vec![
                histo_response(&[3, 1], 1.239),
                histo_response(&[2, 1], 0.5),
                histo_response(&[1], 0.25),
                histo_response(&[6], 2.0),
                histo_response(&[2], 1.0),
                cardinality_response(2),
                cardinality_response(1),
                cardinality_response(1),
                cardinality_response(3),
                cardinality_response(1),
            ]),
            ..Default::default()
        };
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let stats = changes_lifecycle_stats(scope, &jane()).await.unwrap();
        assert_eq!(stats.ratios.merged, 75.0);
        assert_eq!(stats.avgs[&DocType::ChangeCreatedEvent], 1.23);
        assert_eq!(stats.avgs[&DocType::ChangeAbandonedEvent], 0.25);
        assert_eq!(stats.histos[&DocType::ChangeMergedEvent].0.len(), 2);
        assert_eq!(
            stats.counts[&DocType::ChangeMergedEvent],
            EventCounts { events_count: 3, authors_count: 1 }
        );

        let value = serde_json::to_value(&stats).unwrap();
        assert!(value.get("counts").is_none());
        assert_eq!(
            value["ChangeCreatedEvent"],
            json!({"events_count": 4, "authors_count": 2})
        );
        assert_eq!(
            value["ChangeCommitPushedEvent"],
            json!({"events_count": 6, "authors_count": 3})
        );
        assert_eq!(value["avgs"]["ChangeCreatedEvent"], 1.23);
        assert_eq!(value["ratios"]["iterations/created"], 3.0);
        assert_eq!(value["histos"]["ChangeMergedEvent"][1], 0.5);

        let requests = backend.requests();
        assert_eq!(requests.len(), 20);
        for request in &requests {
            let filter = filters(request);
            assert!(filter.contains(&json!({"terms": {"on_author": ["jane"]}})));
            assert!(!filter.iter().any(|f| f["terms"].get("author").is_some()));
        }
    }

    #[tokio::test]
    async fn test_changes_review_stats() {
        let backend = ScriptedBackend {
            scans: Mutex::new(vec![
                vec![comment("e1", 1, "john", 1, 2)],
                vec![comment("e2", 1, "bob", 1, 1)],
            ]),
            searches: Mutex::new(vec![
                histo_response(&[4, 1], 2.5),
                histo_response(&[2], 2.0),
                cardinality_response(3),
                cardinality_response(1),
            ]),
            counts: Mutex::new(vec![5, 2]),
            ..Default::default()
        };
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let stats = changes_review_stats(scope, &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(stats.first_event_delay.comment.first_event_delay_avg, 7200);
        assert_eq!(stats.first_event_delay.review.first_event_delay_avg, 3600);
        assert_eq!(
            stats.first_event_delay.review.top_authors,
            vec![("bob".to_string(), 1)]
        );
        assert_eq!(stats.histos[&DocType::ChangeCommentedEvent].1, 2.5);
        assert_eq!(
            stats.counts[&DocType::ChangeReviewedEvent],
            EventCounts { events_count: 2, authors_count: 1 }
        );

        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(
            value["ChangeCommentedEvent"],
            json!({"events_count": 5, "authors_count": 3})
        );
        assert_eq!(value["first_event_delay"]["comment"]["top_authors"], json!([["john", 1]]));
        assert_eq!(value["histos"].as_object().unwrap().len(), 2);

        let types: Vec<Vec<String>> = backend.requests().iter().map(filter_types).collect();
        assert_eq!(types[0], vec!["ChangeCommentedEvent"]);
        assert_eq!(types[1], vec!["ChangeReviewedEvent"]);
        assert_eq!(types[2], vec!["ChangeCommentedEvent"]);
        assert_eq!(types[3], vec!["ChangeReviewedEvent"]);
    }

    #[tokio::test]
    async fn test_most_active_authors_stats() {
        let backend = ScriptedBackend::with_searches(vec![
            terms_response(&[("jane", 3)], 3),
            terms_response(&[("john", 2)], 2),
            terms_response(&[("bob", 1)], 1),
            terms_response(&[("alice", 4)], 4),
        ]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let stats = most_active_authors_stats(scope, &jane()).await.unwrap();
        assert_eq!(stats.len(), 4);
        assert_eq!(stats[&DocType::ChangeCreatedEvent].items[0].key, "jane");
        assert_eq!(stats[&DocType::ChangeReviewedEvent].items[0].key, "john");
        assert_eq!(stats[&DocType::ChangeCommentedEvent].items[0].key, "bob");
        assert_eq!(stats[&DocType::ChangeMergedEvent].items[0].key, "alice");

        let requests = backend.requests();
        for request in &requests[..3] {
            assert_eq!(request["aggs"]["agg1"]["terms"]["field"], "author");
            assert!(filters(request).contains(&json!({"terms": {"author": ["jane"]}})));
        }
        let merged = &requests[3];
        assert_eq!(merged["aggs"]["agg1"]["terms"]["field"], "on_author");
        assert_eq!(filter_types(merged), vec!["ChangeMergedEvent"]);
        let filter = filters(merged);
        assert!(filter.contains(&json!({"terms": {"on_author": ["jane"]}})));
        assert!(!filter.iter().any(|f| f["terms"].get("author").is_some()));
    }

    #[tokio::test]
    async fn test_oldest_open_and_last_abandoned_changes() {
        let open = fixtures::change(1, "jane", ChangeState::Open);
        let closed = fixtures::change(2, "jane", ChangeState::Closed);
        let backend = ScriptedBackend::with_searches(vec![
            json!({"hits": {"total": 1, "hits": [{"_source": open}]}}),
            json!({"hits": {"total": 1, "hits": [{"_source": closed}]}}),
        ]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let page = oldest_open_changes(scope, &QueryParams::default()).await.unwrap();
        assert_eq!(page.items, vec![open]);
        let page = last_abandoned_changes(scope, &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(page.items, vec![closed]);

        let requests = backend.requests();
        assert_eq!(requests[0]["sort"], json!([{"created_at": {"order": "asc"}}]));
        assert!(filters(&requests[0]).contains(&json!({"term": {"state": "OPEN"}})));
        assert_eq!(requests[1]["sort"], json!([{"created_at": {"order": "desc"}}]));
        assert!(filters(&requests[1]).contains(&json!({"term": {"state": "CLOSED"}})));
        assert_eq!(filter_types(&requests[1]), vec!["Change"]);
    }

    #[tokio::test]
    async fn test_top_terms_queries() {
        let cases = [
            (NamedQuery::ChangesTopApproval, "approval", "ChangeReviewedEvent", false),
            (NamedQuery::ChangesTopCommented, "change_id", "ChangeCommentedEvent", false),
            (NamedQuery::ChangesTopReviewed, "change_id", "ChangeReviewedEvent", false),
            (NamedQuery::AuthorsTopReviewed, "on_author", "ChangeReviewedEvent", false),
            (NamedQuery::AuthorsTopCommented, "on_author", "ChangeCommentedEvent", false),
            (NamedQuery::AuthorsTopMerged, "on_author", "ChangeMergedEvent", true),
            (NamedQuery::AuthorsTopOpened, "author", "Change", false),
        ];
        let repositories = repos();
        for (query, field, etype, on_authors) in cases {
            let backend =
                ScriptedBackend::with_searches(vec![terms_response(&[("k1", 3), ("k2", 2)], 5)]);
            let scope = Scope::new(&backend, "monocle", &repositories);

            let value = run(query, scope, &jane()).await.unwrap();
            assert_eq!(value["items"][0], json!({"key": "k1", "doc_count": 3}), "{}", query);
            assert_eq!(value["total"], 2, "{}", query);
            assert_eq!(value["total_hits"], 5, "{}", query);

            let request = &backend.requests()[0];
            assert_eq!(request["aggs"]["agg1"]["terms"]["field"], field, "{}", query);
            assert_eq!(filter_types(request), vec![etype], "{}", query);
            let filter = filters(request);
            let author = json!({"terms": {"author": ["jane"]}});
            let on_author = json!({"terms": {"on_author": ["jane"]}});
            assert_eq!(filter.contains(&author), !on_authors, "{}", query);
            assert_eq!(filter.contains(&on_author), on_authors, "{}", query);
            if query == NamedQuery::AuthorsTopOpened {
                assert!(filter.contains(&json!({"term": {"state": "OPEN"}})));
            }
        }
    }

    #[tokio::test]
    async fn test_first_created_event() {
        let backend = ScriptedBackend::with_searches(vec![json!({
            "hits": {"total": 3, "hits": [{"_source": {"created_at": "2020-01-01T00:00:00Z"}}]}
        })]);
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let first = first_created_event(scope, &QueryParams::default()).await.unwrap();
        assert_eq!(first, Some(fixtures::ts(1, 0)));
    }

    #[tokio::test]
    async fn test_run_serialises_results() {
        let backend = ScriptedBackend {
            counts: Mutex::new(vec![3]),
            ..Default::default()
        };
        let repositories = repos();
        let scope = Scope::new(&backend, "monocle", &repositories);

        let value = run(NamedQuery::CountEvents, scope, &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(value, json!(3));
    }
}
