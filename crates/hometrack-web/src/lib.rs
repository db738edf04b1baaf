//! JSON query API over the property index and store.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use hometrack_core::{
    ConflictId, ConflictRecord, ConflictStatus, DerivedHistory, HistoryEvent, Property, PropertyId,
    SearchQuery,
};
use hometrack_storage::{PropertyRecord, PropertyStore, StoreError};
use hometrack_sync::{open_index, QueryIndex, SyncConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "hometrack-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PropertyStore>,
    pub index: Arc<QueryIndex>,
}

impl AppState {
    pub fn new(store: Arc<dyn PropertyStore>, index: Arc<QueryIndex>) -> Self {
        Self { store, index }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LookupQuery {
    address: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetailQuery {
    #[serde(default)]
    history: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ConflictsQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ResolveRequest {
    note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConflictView {
    #[serde(flatten)]
    pub record: ConflictRecord,
    pub effective_status: ConflictStatus,
}

#[derive(Debug, Serialize)]
pub struct PropertyDetail {
    pub property: Property,
    pub derived: DerivedHistory,
    pub history: Vec<HistoryEvent>,
    pub conflicts: Vec<ConflictView>,
    pub version: u64,
}

impl PropertyDetail {
    /// The stored record with its full history and every conflict's effective status.
    pub fn from_record(record: &PropertyRecord) -> Self {
        Self {
            property: record.property.clone(),
            derived: record.history.derived(),
            history: record.history.events().to_vec(),
            conflicts: record
                .conflicts_with_status(None)
                .into_iter()
                .map(|(record, effective_status)| ConflictView {
                    record,
                    effective_status,
                })
                .collect(),
            version: record.version,
        }
    }
}

/// Error body: `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound(_) | StoreError::ConflictNotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::CommitConflict { .. } => StatusCode::CONFLICT,
            _ => {
                error!(error = %err, "store request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/properties", get(search_handler))
        .route("/properties/lookup", get(lookup_handler))
        .route("/properties/{id}", get(property_handler))
        .route("/properties/{id}/conflicts", get(conflicts_handler))
        .route(
            "/properties/{id}/conflicts/{conflict_id}/resolve",
            post(resolve_handler),
        )
        .with_state(Arc::new(state))
}

/// Opens the configured store, rebuilds the index and serves until the listener fails.
pub async fn serve(config: &SyncConfig) -> anyhow::Result<()> {
    let (store, index) = open_index(config).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, properties = index.len().await, "serving property queries");
    axum::serve(listener, app(AppState::new(store, index))).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "properties": state.index.len().await,
    }))
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    let query = SearchQuery::from_pairs(pairs).map_err(|err| {
        warn!(error = %err, "rejected search");
        ApiError::bad_request(err.to_string())
    })?;
    Ok(Json(state.index.search_page(&query).await).into_response())
}

async fn lookup_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LookupQuery>,
) -> Result<Response, ApiError> {
    let address = query
        .address
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("address is required"))?;
    let entry = state
        .index
        .get_by_address(&address)
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("no property at {address:?}")))?;
    Ok(Json(entry.as_ref().clone()).into_response())
}

async fn property_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DetailQuery>,
) -> Result<Response, ApiError> {
    let id = parse_property_id(&id)?;
    if !query.history {
        let entry = state
            .index
            .get(&id)
            .await
            .ok_or_else(|| ApiError::not_found(format!("property {id} not found")))?;
        return Ok(Json(entry.property.clone()).into_response());
    }

    let record = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("property {id} not found")))?;
    Ok(Json(PropertyDetail::from_record(&record)).into_response())
}

async fn conflicts_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ConflictsQuery>,
) -> Result<Response, ApiError> {
    let id = parse_property_id(&id)?;
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::parse::<ConflictStatus>)
        .transpose()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let conflicts: Vec<ConflictView> = state
        .store
        .list_conflicts(&id, status)
        .await?
        .into_iter()
        .map(|(record, effective_status)| ConflictView {
            record,
            effective_status,
        })
        .collect();
    Ok(Json(conflicts).into_response())
}

async fn resolve_handler(
    State(state): State<Arc<AppState>>,
    Path((id, conflict_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let id = parse_property_id(&id)?;
    let conflict_id: ConflictId = conflict_id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("{conflict_id:?} is not a conflict id")))?;
    let request: ResolveRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ResolveRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| ApiError::bad_request(err.to_string()))?
    };

    let resolution = state
        .store
        .resolve_conflict(&id, conflict_id, request.note, Utc::now())
        .await?;
    info!(property_id = %id, %conflict_id, "conflict manually resolved");
    if let Some(record) = state.store.get(&id).await? {
        state.index.upsert(&record).await;
    }
    Ok((StatusCode::CREATED, Json(resolution)).into_response())
}

fn parse_property_id(raw: &str) -> Result<PropertyId, ApiError> {
    PropertyId::parse(raw).ok_or_else(|| ApiError::bad_request(format!("{raw:?} is not a property id")))
}
