//! REST API built with axum.
//!
//! Handlers decode query parameters, call the dispatcher or paginator, and
//! return plain JSON bodies. Failures become `ProxyError` responses.

use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::dispatcher::Dispatcher;
use crate::error::{ProxyError, Result};
use crate::models::*;
use crate::paginator::{BarInterval, Paginator};
use crate::session::{ConnectionState, SessionManager};

const DEFAULT_LIMIT: usize = 100;

// ============================================================================
// App State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub paginator: Arc<Paginator>,
    pub proxy_host: String,
    pub proxy_port: u16,
}

// ============================================================================
// Router
// ============================================================================

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/accounts", get(handle_accounts))
        .route("/positions/{account_id}", get(handle_positions))
        .route("/search", get(handle_search))
        .route("/loadData", get(handle_load_data))
        .route("/loadMoreData", get(handle_load_more_data))
        .route("/getSymbolInfo", get(handle_symbol_info))
        .route("/dynamic/{*method_path}", get(handle_dynamic))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Query parameter types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadDataQuery {
    pub con_id: i64,
    pub interval: String,
    pub limit: Option<usize>,
    pub duration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadMoreDataQuery {
    pub con_id: i64,
    pub interval: String,
    pub end_time: i64,
    pub limit: Option<usize>,
    pub duration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfoQuery {
    pub con_id: i64,
}

fn query<T>(q: std::result::Result<Query<T>, QueryRejection>) -> Result<T> {
    q.map(|Query(inner)| inner)
        .map_err(|rejection| ProxyError::InvalidArgument(rejection.body_text()))
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn handle_health(State(state): State<AppState>) -> Json<HealthReport> {
    let snap = state.session.snapshot();
    let connected = snap.state == ConnectionState::Connected;
    Json(HealthReport {
        proxy: "ok".into(),
        status: if connected { "healthy" } else { "degraded" }.into(),
        ib_connected: connected,
        state: snap.state.to_string(),
        ib_host: snap.endpoint.host,
        ib_port: snap.endpoint.port,
        proxy_host: state.proxy_host.clone(),
        proxy_port: state.proxy_port,
        client_id: snap.endpoint.client_id,
        reconnect_attempts: snap.reconnect_attempts,
        last_activity: snap.last_activity.map(|t| t.to_rfc3339()),
        server_version: snap.server_version,
    })
}

async fn handle_accounts(State(state): State<AppState>) -> Result<Json<AccountsResponse>> {
    let accounts = state.dispatcher.list_accounts().await?;
    Ok(Json(AccountsResponse::from_ids(&accounts)))
}

async fn handle_positions(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<Vec<PositionRecord>>> {
    Ok(Json(state.dispatcher.list_positions(&account_id).await?))
}

async fn handle_search(
    State(state): State<AppState>,
    q: std::result::Result<Query<SearchQuery>, QueryRejection>,
) -> Result<Json<Vec<ContractDescriptor>>> {
    let symbol = query(q)?
        .symbol
        .ok_or_else(|| ProxyError::InvalidArgument("Missing required parameter: symbol".into()))?;
    Ok(Json(state.dispatcher.search_contracts(&symbol).await?))
}

async fn handle_load_data(
    State(state): State<AppState>,
    q: std::result::Result<Query<LoadDataQuery>, QueryRejection>,
) -> Result<Json<Vec<HistoricalBar>>> {
    let q = query(q)?;
    let interval: BarInterval = q.interval.parse()?;
    let bars = state
        .paginator
        .load(
            q.con_id,
            interval,
            q.limit.unwrap_or(DEFAULT_LIMIT),
            q.duration.as_deref(),
        )
        .await?;
    Ok(Json(bars))
}

async fn handle_load_more_data(
    State(state): State<AppState>,
    q: std::result::Result<Query<LoadMoreDataQuery>, QueryRejection>,
) -> Result<Json<Vec<HistoricalBar>>> {
    let q = query(q)?;
    let interval: BarInterval = q.interval.parse()?;
    let bars = state
        .paginator
        .load_more(
            q.con_id,
            interval,
            q.end_time,
            q.limit.unwrap_or(DEFAULT_LIMIT),
            q.duration.as_deref(),
        )
        .await?;
    Ok(Json(bars))
}

async fn handle_symbol_info(
    State(state): State<AppState>,
    q: std::result::Result<Query<SymbolInfoQuery>, QueryRejection>,
) -> Result<Json<SymbolInfo>> {
    let q = query(q)?;
    Ok(Json(state.dispatcher.symbol_info(q.con_id).await?))
}

async fn handle_dynamic(
    State(state): State<AppState>,
    Path(method_path): Path<String>,
    q: std::result::Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<Json<serde_json::Value>> {
    let params = query(q)?;
    Ok(Json(state.dispatcher.invoke(&method_path, &params).await?))
}
