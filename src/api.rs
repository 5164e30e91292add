//! REST reporting API for the trading ledger
//!
//! Read-only view over accounts and transaction records; all writes go
//! through the conversational agent.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::ledger::{LedgerError, LedgerStore};

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub ledger: Arc<LedgerStore>,
}

fn ledger_error_response(error: LedgerError) -> (StatusCode, Json<ApiResponse>) {
    match error {
        LedgerError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("User not found".into())),
        ),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(other.to_string())),
        ),
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Portfolio Endpoints
/// =============================

async fn portfolio(
    State(state): State<ApiState>,
    Path(userid): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    info!(%userid, "Portfolio lookup");

    match state.ledger.profile(&userid).await {
        Ok(account) => (StatusCode::OK, Json(ApiResponse::success(account))),
        Err(error) => ledger_error_response(error),
    }
}

async fn portfolios(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    match state.ledger.accounts().await {
        Ok(accounts) => (StatusCode::OK, Json(ApiResponse::success(accounts))),
        Err(error) => ledger_error_response(error),
    }
}

/// =============================
/// Transactions Endpoint
/// =============================

async fn transactions(
    State(state): State<ApiState>,
    Path(userid): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.ledger.transactions_for(&userid).await {
        Ok(records) => (StatusCode::OK, Json(ApiResponse::success(records))),
        Err(error) => ledger_error_response(error),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(ledger: Arc<LedgerStore>) -> Router {
    let state = ApiState { ledger };

    Router::new()
        .route("/health", get(health))
        .route("/api/portfolio/:userid", get(portfolio))
        .route("/api/portfolios", get(portfolios))
        .route("/api/transactions/:userid", get(transactions))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(ledger: Arc<LedgerStore>, port: u16) -> crate::Result<()> {
    let router = create_router(ledger);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("Reporting API listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
