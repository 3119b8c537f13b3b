use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::consensus::SignedVote;
use crate::errors::{ChainError, ChainResult};
use crate::node::{NodeHandle, NodeStatus, TxStatus};
use crate::types::{Block, SignedTransaction};
use crate::wsv::{AccountRecord, AssetBalance};

#[derive(Clone)]
struct AppState {
    node: NodeHandle,
}

#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    error: String,
}

#[derive(Serialize)]
struct SubmitResponse {
    hash: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    public_key: String,
}

#[derive(Deserialize)]
struct RangeQuery {
    from: u64,
    to: u64,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

pub async fn serve(node: NodeHandle, addr: SocketAddr) -> ChainResult<()> {
    let state = AppState { node };
    let router = Router::new()
        .route("/health", get(health))
        .route("/status/node", get(node_status))
        .route("/transactions", post(submit_transaction))
        .route("/transactions/:hash/status", get(transaction_status))
        .route("/consensus/votes", post(submit_vote))
        .route("/blocks", get(blocks_range))
        .route("/blocks/latest", get(latest_block))
        .route("/blocks/:height", get(block_by_height))
        .route("/accounts/:id", get(account_info))
        .route("/accounts/:id/assets", get(account_assets))
        .route("/accounts/:id/signatories", get(account_signatories))
        .route("/accounts/:id/transactions", get(account_transactions))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "RPC server listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| ChainError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        public_key: state.node.public_key(),
    })
}

async fn node_status(
    State(state): State<AppState>,
) -> Result<Json<NodeStatus>, (StatusCode, Json<ErrorResponse>)> {
    state.node.node_status().map(Json).map_err(to_http_error)
}

async fn submit_transaction(
    State(state): State<AppState>,
    Json(tx): Json<SignedTransaction>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .node
        .submit_transaction(tx)
        .map(|hash| Json(SubmitResponse { hash }))
        .map_err(to_http_error)
}

async fn transaction_status(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<Option<TxStatus>>, (StatusCode, Json<ErrorResponse>)> {
    Ok(Json(state.node.transaction_status(&hash)))
}

async fn submit_vote(
    State(state): State<AppState>,
    Json(vote): Json<SignedVote>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .node
        .submit_vote(vote)
        .map(|hash| Json(SubmitResponse { hash }))
        .map_err(to_http_error)
}

async fn blocks_range(
    State(state): State<AppState>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<Block>>, (StatusCode, Json<ErrorResponse>)> {
    state
        .node
        .blocks_range(range.from, range.to)
        .map(Json)
        .map_err(to_http_error)
}

async fn latest_block(
    State(state): State<AppState>,
) -> Result<Json<Option<Block>>, (StatusCode, Json<ErrorResponse>)> {
    state.node.latest_block().map(Json).map_err(to_http_error)
}

async fn block_by_height(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> Result<Json<Option<Block>>, (StatusCode, Json<ErrorResponse>)> {
    state
        .node
        .get_block(height)
        .map(Json)
        .map_err(to_http_error)
}

async fn account_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Option<AccountRecord>>, (StatusCode, Json<ErrorResponse>)> {
    state.node.account(&id).map(Json).map_err(to_http_error)
}

async fn account_assets(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<AssetBalance>>, (StatusCode, Json<ErrorResponse>)> {
    state
        .node
        .account_assets(&id)
        .map(Json)
        .map_err(to_http_error)
}

async fn account_signatories(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>, (StatusCode, Json<ErrorResponse>)> {
    state
        .node
        .account_signatories(&id)
        .map(Json)
        .map_err(to_http_error)
}

async fn account_transactions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<SignedTransaction>>, (StatusCode, Json<ErrorResponse>)> {
    let limit = query.limit.unwrap_or(50).min(500);
    state
        .node
        .account_transactions(&id, limit)
        .map(Json)
        .map_err(to_http_error)
}

fn to_http_error(err: ChainError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match &err {
        ChainError::Transaction(_) => (StatusCode::BAD_REQUEST, "STATELESS_FAILED"),
        ChainError::Crypto(_) => (StatusCode::BAD_REQUEST, "STATELESS_FAILED"),
        ChainError::Config(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        ChainError::Backpressure => (StatusCode::TOO_MANY_REQUESTS, "BACKPRESSURE"),
        ChainError::StorageUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };
    (
        status,
        Json(ErrorResponse {
            status: code,
            error: err.to_string(),
        }),
    )
}
