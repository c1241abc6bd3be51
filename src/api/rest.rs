// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The webhook lives at `/webhook` and is authenticated by the shared secret
// carried inside its payload. Monitoring endpoints live under `/api/v1/`.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::verify_webhook_secret;
use crate::app_state::AppState;
use crate::execution::ExecutionOutcome;
use crate::positions::ExitReason;
use crate::types::{Side, Signal};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Signal ingestion ────────────────────────────────────────
        .route("/webhook", post(webhook))
        // ── Monitoring ──────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/positions", get(open_positions))
        .route("/api/v1/positions/closed", get(closed_positions))
        .route("/api/v1/positions/close", post(manual_close))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Webhook
// =============================================================================

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    secret: String,
    symbol: String,
    side: Side,
    confidence: f64,
    #[serde(default)]
    strategy: String,
    #[serde(default)]
    timeframe: String,
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<WebhookPayload>,
) -> impl IntoResponse {
    if !verify_webhook_secret(&payload.secret, &state.config.webhook_secret) {
        warn!(symbol = %payload.symbol, "webhook rejected: invalid secret");
        let body = serde_json::json!({ "error": "Invalid webhook secret" });
        return (StatusCode::FORBIDDEN, Json(body)).into_response();
    }

    let signal = Signal {
        symbol: payload.symbol,
        side: payload.side,
        confidence: payload.confidence,
        strategy: payload.strategy,
        timeframe: payload.timeframe,
    };

    let outcome = state.execution.execute_signal(&signal).await;
    let body = match &outcome {
        ExecutionOutcome::Executed {
            symbol,
            side,
            quantity,
            entry_price,
        } => serde_json::json!({
            "status": "executed",
            "symbol": symbol,
            "side": side,
            "quantity": quantity,
            "entry_price": entry_price,
        }),
        ExecutionOutcome::Rejected { reason } => serde_json::json!({
            "status": "rejected",
            "reason": reason,
        }),
        ExecutionOutcome::Failed { reason } => serde_json::json!({
            "status": "failed",
            "reason": reason,
        }),
    };

    // Rejections and collaborator failures are reported in-band; the webhook
    // itself succeeded.
    (StatusCode::OK, Json(body)).into_response()
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Status
// =============================================================================

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let risk = state.risk_engine.status();
    let all = state.position_manager.all_positions();
    let open = all.iter().filter(|p| p.is_open()).count();
    let body = serde_json::json!({
        "risk": risk,
        "open_positions": open,
        "closed_positions": all.len() - open,
        "uptime_secs": state.uptime_secs(),
        "testnet": state.config.use_testnet,
        "server_time": chrono::Utc::now().timestamp_millis(),
    });
    Json(body)
}

// =============================================================================
// Positions
// =============================================================================

async fn open_positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.position_manager.open_positions())
}

async fn closed_positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.position_manager.closed_positions(100))
}

// =============================================================================
// Manual close
// =============================================================================

#[derive(Debug, Deserialize)]
struct ManualClosePayload {
    symbol: String,
}

async fn manual_close(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ManualClosePayload>,
) -> impl IntoResponse {
    let Some(pos) = state
        .position_manager
        .open_positions()
        .into_iter()
        .find(|p| p.symbol == payload.symbol)
    else {
        let body = serde_json::json!({
            "error": format!("No open position for {}", payload.symbol)
        });
        return (StatusCode::NOT_FOUND, Json(body)).into_response();
    };

    let observed_price = match state.exchange.current_price(&pos.symbol).await {
        Ok(Some(p)) => p,
        Ok(None) | Err(_) => {
            let body = serde_json::json!({
                "error": format!("No price available for {}", pos.symbol)
            });
            return (StatusCode::BAD_GATEWAY, Json(body)).into_response();
        }
    };

    let fill = match state
        .exchange
        .place_market_order(&pos.symbol, pos.side.opposite(), pos.quantity)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            warn!(symbol = %pos.symbol, error = %e, "manual close order failed");
            let body = serde_json::json!({
                "error": format!("Closing order failed: {e}")
            });
            return (StatusCode::BAD_GATEWAY, Json(body)).into_response();
        }
    };

    let exit_price = if fill.avg_fill_price > 0.0 {
        fill.avg_fill_price
    } else {
        observed_price
    };

    match state
        .position_manager
        .close(&pos.symbol, exit_price, ExitReason::Manual)
    {
        Some(pnl) => {
            info!(symbol = %pos.symbol, exit_price, pnl, "position closed manually");
            let body = serde_json::json!({
                "status": "closed",
                "symbol": pos.symbol,
                "exit_price": exit_price,
                "pnl": pnl,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        None => {
            // The watcher may have closed it between the lookup and now.
            let body = serde_json::json!({
                "error": format!("Position for {} already closed", pos.symbol)
            });
            (StatusCode::CONFLICT, Json(body)).into_response()
        }
    }
}
