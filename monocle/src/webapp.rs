use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::InvalidHeaderValue;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use store::{validate_index_name, MonocleDb, QueryArgs, QueryParams, SearchBackend, StoreError};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 9876;

#[derive(Clone)]
pub struct AppState {
    backend: Arc<dyn SearchBackend>,
}

impl AppState {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }
}

#[derive(Debug, Deserialize)]
struct IndexArg {
    #[serde(default)]
    index: Option<String>,
}

type ApiError = (StatusCode, String);

fn bad_query(err: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        format!("Unable to process query: {}", err),
    )
}

fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::UnknownQuery { .. } | StoreError::InvalidParam { .. } => bad_query(err),
        StoreError::IndexNotFound { index } => {
            (StatusCode::NOT_FOUND, format!("No such index: {}", index))
        }
        err => {
            error!("Query failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Unable to run query: {}", err),
            )
        }
    }
}

async fn query_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    index: Result<Query<IndexArg>, QueryRejection>,
    args: Result<Query<QueryArgs>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let index = index
        .ok()
        .and_then(|Query(arg)| arg.index)
        .filter(|index| !index.is_empty())
        .ok_or_else(|| (StatusCode::NOT_FOUND, "No index provided".to_string()))?;
    validate_index_name(&index).map_err(bad_query)?;
    let Query(args) = args.map_err(bad_query)?;
    let params = QueryParams::from_args(&args).map_err(bad_query)?;
    let repositories = args.repositories();
    debug!("query {} on {} for {:?}", name, index, repositories);

    let db = MonocleDb::new(state.backend.clone(), index);
    let result = db
        .run_named_query(&name, &repositories, &params)
        .await
        .map_err(store_error)?;
    Ok(Json(result))
}

fn cors_layer(allow_origin: &str) -> Result<CorsLayer, InvalidHeaderValue> {
    let origin = if allow_origin == "*" {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::exact(HeaderValue::from_str(allow_origin)?)
    };
    Ok(CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(origin))
}

/// The query API: `GET /api/0/query/:name?index=...`.
pub fn create_router(state: AppState, allow_origin: &str) -> Result<Router, InvalidHeaderValue> {
    let api = Router::new()
        .route("/api/0/query/:name", get(query_handler))
        .layer(cors_layer(allow_origin)?);
    Ok(api.layer(TraceLayer::new_for_http()).with_state(state))
}

pub async fn serve(
    host: &str,
    port: u16,
    state: AppState,
    allow_origin: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(state, allow_origin)?;
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("Serving the query API on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
