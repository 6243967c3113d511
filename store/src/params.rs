use crate::backend::{StoreError, StoreResult};
use crate::types::{ChangeState, DocType};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const DEFAULT_INTERVAL: &str = "3h";
pub const DEFAULT_SIZE: usize = 10;

/// Query arguments as they arrive from the command line or an HTTP query
/// string, before any parsing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryArgs {
    pub repositories: Option<String>,
    pub gte: Option<String>,
    pub lte: Option<String>,
    pub on_cc_gte: Option<String>,
    pub on_cc_lte: Option<String>,
    pub ec_same_date: Option<bool>,
    #[serde(rename = "type")]
    pub etype: Option<String>,
    pub change_ids: Option<String>,
    pub authors: Option<String>,
    pub exclude_authors: Option<String>,
    pub approval: Option<String>,
    pub interval: Option<String>,
    pub size: Option<usize>,
    pub from: Option<usize>,
}

/// Normalised query parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParams {
    pub gte: Option<i64>,
    pub lte: Option<i64>,
    pub on_cc_gte: Option<i64>,
    pub on_cc_lte: Option<i64>,
    pub ec_same_date: bool,
    pub etype: Vec<DocType>,
    pub authors: Option<Vec<String>>,
    pub on_authors: Option<Vec<String>>,
    pub exclude_authors: Option<Vec<String>>,
    pub change_ids: Option<Vec<String>>,
    pub approval: Option<String>,
    pub state: Option<ChangeState>,
    pub interval: String,
    pub size: usize,
    pub from: usize,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            gte: None,
            lte: None,
            on_cc_gte: None,
            on_cc_lte: None,
            ec_same_date: false,
            etype: DocType::EVENTS.to_vec(),
            authors: None,
            on_authors: None,
            exclude_authors: None,
            change_ids: None,
            approval: None,
            state: None,
            interval: DEFAULT_INTERVAL.to_string(),
            size: DEFAULT_SIZE,
            from: 0,
        }
    }
}

/// Convert a `YYYY-MM-DD` date to epoch milliseconds at UTC midnight.
pub fn date_to_epoch_ms(name: &str, date: &str) -> StoreResult<i64> {
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|e| {
        StoreError::InvalidParam {
            name: name.to_string(),
            message: format!("expected YYYY-MM-DD, got {:?}: {}", date, e),
        }
    })?;
    Ok(day
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default())
}

fn split_list(value: &Option<String>) -> Option<Vec<String>> {
    value.as_deref().and_then(|v| {
        let items: Vec<String> = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        (!items.is_empty()).then_some(items)
    })
}

fn parse_date(name: &str, value: &Option<String>) -> StoreResult<Option<i64>> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(|v| date_to_epoch_ms(name, v))
        .transpose()
}

/// Normalise a histogram interval. Fixed spans (`ms`, `s`, `m`, `h`, `d`)
/// take any positive count. Calendar units only exist as `1w`, `1M`, `1q`
/// and `1y`, so a multiple of weeks becomes a span of days and other
/// calendar multiples are refused.
pub fn parse_interval(value: &str) -> StoreResult<String> {
    let invalid = |message: String| StoreError::InvalidParam {
        name: "interval".to_string(),
        message,
    };
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid(format!("{:?} has no unit", value)))?;
    let (count, unit) = value.split_at(split);
    let count: u64 = count
        .parse()
        .ok()
        .filter(|count| *count > 0)
        .ok_or_else(|| invalid(format!("{:?} needs a positive count", value)))?;

    match unit {
        "ms" | "s" | "m" | "h" | "d" => Ok(value.to_string()),
        "w" if count > 1 => Ok(format!("{}d", count * 7)),
        "w" | "M" | "q" | "y" if count == 1 => Ok(value.to_string()),
        "M" | "q" | "y" => Err(invalid(format!(
            "{:?} is not supported, only 1{} is",
            value, unit
        ))),
        _ => Err(invalid(format!("{:?} has an unknown unit", value))),
    }
}

impl QueryArgs {
    /// Repository regexps the query is scoped to. Anchors are implicit in
    /// Elasticsearch regexps so a leading `^` is dropped.
    pub fn repositories(&self) -> Vec<String> {
        split_list(&self.repositories)
            .unwrap_or_else(|| vec![".*".to_string()])
            .into_iter()
            .map(|repo| repo.trim_start_matches('^').to_string())
            .collect()
    }
}

impl QueryParams {
    pub fn from_args(args: &QueryArgs) -> StoreResult<Self> {
        let etype = match split_list(&args.etype) {
            Some(types) => types
                .iter()
                .map(|t| {
                    t.parse::<DocType>().map_err(|message| StoreError::InvalidParam {
                        name: "type".to_string(),
                        message,
                    })
                })
                .collect::<StoreResult<Vec<_>>>()?,
            None => DocType::EVENTS.to_vec(),
        };

        Ok(Self {
            gte: parse_date("gte", &args.gte)?,
            lte: parse_date("lte", &args.lte)?,
            on_cc_gte: parse_date("on_cc_gte", &args.on_cc_gte)?,
            on_cc_lte: parse_date("on_cc_lte", &args.on_cc_lte)?,
            ec_same_date: args.ec_same_date.unwrap_or(false),
            etype,
            authors: split_list(&args.authors),
            on_authors: None,
            exclude_authors: split_list(&args.exclude_authors),
            change_ids: split_list(&args.change_ids),
            approval: args.approval.clone().filter(|a| !a.is_empty()),
            state: None,
            interval: match args.interval.as_deref().filter(|i| !i.is_empty()) {
                Some(interval) => parse_interval(interval)?,
                None => DEFAULT_INTERVAL.to_string(),
            },
            size: args.size.unwrap_or(DEFAULT_SIZE),
            from: args.from.unwrap_or(0),
        })
    }

    pub fn with_etype(mut self, etype: &[DocType]) -> Self {
        self.etype = etype.to_vec();
        self
    }

    pub fn with_state(mut self, state: ChangeState) -> Self {
        self.state = Some(state);
        self
    }

    /// Look at events happening on changes authored by the selected authors
    /// rather than events authored by them. Author exclusion no longer
    /// applies in that case.
    pub fn switch_to_on_authors(&mut self) {
        if let Some(authors) = self.authors.take() {
            self.on_authors = Some(authors);
            self.exclude_authors = None;
        }
    }

    pub fn targets_changes(&self) -> bool {
        self.etype.contains(&DocType::Change)
    }
}
