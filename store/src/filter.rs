use crate::params::QueryParams;
use serde_json::{json, Map, Value};
use tracing::debug;

fn epoch_range(field: &str, gte: Option<i64>, lte: Option<i64>) -> Value {
    let mut bounds = Map::new();
    bounds.insert("format".to_string(), json!("epoch_millis"));
    if let Some(gte) = gte {
        bounds.insert("gte".to_string(), json!(gte));
    }
    if let Some(lte) = lte {
        bounds.insert("lte".to_string(), json!(lte));
    }
    json!({ "range": { field: bounds } })
}

fn events_filter(params: &QueryParams, filter: &mut Vec<Value>) {
    let (on_cc_gte, on_cc_lte) = if params.ec_same_date {
        (params.gte, params.lte)
    } else {
        (params.on_cc_gte, params.on_cc_lte)
    };
    filter.push(epoch_range("on_created_at", on_cc_gte, on_cc_lte));
    if let Some(approval) = &params.approval {
        filter.push(json!({ "term": { "approval": approval } }));
    }
}

fn changes_filter(params: &QueryParams, filter: &mut Vec<Value>) {
    if let Some(state) = params.state {
        filter.push(json!({ "term": { "state": state.as_str() } }));
    }
}

/// Build the bool query shared by every named query.
pub fn generate_filter(repositories: &[String], params: &QueryParams) -> Value {
    let repositories: Vec<Value> = repositories
        .iter()
        .map(|repo| json!({ "regexp": { "repository_fullname": { "value": repo } } }))
        .collect();
    let etype: Vec<&str> = params.etype.iter().map(|t| t.as_str()).collect();

    let mut filter = vec![
        json!({ "bool": { "should": repositories } }),
        epoch_range("created_at", params.gte, params.lte),
        json!({ "terms": { "type": etype } }),
    ];
    if let Some(authors) = &params.authors {
        filter.push(json!({ "terms": { "author": authors } }));
    }
    if let Some(on_authors) = &params.on_authors {
        filter.push(json!({ "terms": { "on_author": on_authors } }));
    }
    if let Some(change_ids) = &params.change_ids {
        filter.push(json!({ "terms": { "change_id": change_ids } }));
    }
    if params.targets_changes() {
        changes_filter(params, &mut filter);
    } else {
        events_filter(params, &mut filter);
    }

    let mut must_not = vec![];
    if let Some(exclude) = &params.exclude_authors {
        must_not.push(json!({ "terms": { "author": exclude } }));
        must_not.push(json!({ "terms": { "on_author": exclude } }));
    }

    let query = json!({ "bool": { "filter": filter, "must_not": must_not } });
    debug!("query filter: {}", query);
    query
}
