// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/`. The dashboard is read-mostly; the
// `/api/override/*` endpoints are the manual levers: blacklist management,
// pattern disabling, reflection trigger, adaptation rollback, and
// pause/resume. CORS is permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::analytics::Timeframe;
use crate::app_state::{run_reflection_round, AppState};
use crate::types::EngineMode;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Status & health ─────────────────────────────────────────
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        // ── Live engine state ───────────────────────────────────────
        .route("/api/conditions", get(conditions))
        .route("/api/positions", get(positions))
        .route("/api/prices", get(prices))
        // ── Knowledge ───────────────────────────────────────────────
        .route("/api/knowledge/coins", get(knowledge_coins))
        .route("/api/knowledge/patterns", get(knowledge_patterns))
        .route("/api/knowledge/rules", get(knowledge_rules))
        .route("/api/knowledge/insights", get(knowledge_insights))
        .route("/api/knowledge/params", get(knowledge_params))
        // ── Learning ────────────────────────────────────────────────
        .route("/api/adaptations", get(adaptations))
        // ── Profitability ───────────────────────────────────────────
        .route("/api/profitability/snapshot", get(profitability_snapshot))
        .route("/api/profitability/equity", get(profitability_equity))
        // ── Overrides ───────────────────────────────────────────────
        .route("/api/override/blacklist", post(override_blacklist))
        .route("/api/override/unblacklist", post(override_unblacklist))
        .route("/api/override/disable-pattern", post(override_disable_pattern))
        .route("/api/override/trigger-reflection", post(override_trigger_reflection))
        .route("/api/override/rollback", post(override_rollback))
        .route("/api/override/pause", post(override_pause))
        .route("/api/override/resume", post(override_resume))
        // ── SSE feed ────────────────────────────────────────────────
        .route("/api/feed", get(crate::api::sse::feed_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Status & health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.status_snapshot())
}

// =============================================================================
// Live engine state
// =============================================================================

async fn conditions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.sniper.active_conditions())
}

async fn positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.sniper.status().open_positions)
}

async fn prices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.book.all())
}

// =============================================================================
// Knowledge
// =============================================================================

async fn knowledge_coins(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.knowledge.all_scores())
}

async fn knowledge_patterns(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.knowledge.all_patterns())
}

async fn knowledge_rules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.knowledge.all_rules())
}

async fn knowledge_params(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.knowledge.param_deltas())
}

async fn knowledge_insights(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.recent_insights(50) {
        Ok(rows) => {
            let items: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|(reflection_id, ts, insight)| {
                    serde_json::json!({
                        "reflection_id": reflection_id,
                        "ts": ts,
                        "insight": insight,
                    })
                })
                .collect();
            Json(items).into_response()
        }
        Err(e) => store_error(e),
    }
}

// =============================================================================
// Learning
// =============================================================================

async fn adaptations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_adaptations(100) {
        Ok(list) => Json(list).into_response(),
        Err(e) => store_error(e),
    }
}

// =============================================================================
// Profitability
// =============================================================================

#[derive(Deserialize)]
struct SnapshotQuery {
    #[serde(default)]
    timeframe: Option<String>,
}

async fn profitability_snapshot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SnapshotQuery>,
) -> impl IntoResponse {
    let timeframe = query
        .timeframe
        .as_deref()
        .and_then(Timeframe::from_str_loose)
        .unwrap_or(Timeframe::AllTime);
    Json(state.profit_snapshot(timeframe))
}

async fn profitability_equity(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.recent_equity_points(500) {
        Ok(points) => {
            let series: Vec<serde_json::Value> = points
                .into_iter()
                .map(|(ts, balance, total_pnl)| {
                    serde_json::json!({ "ts": ts, "balance": balance, "total_pnl": total_pnl })
                })
                .collect();
            Json(series).into_response()
        }
        Err(e) => store_error(e),
    }
}

// =============================================================================
// Overrides
// =============================================================================

#[derive(Deserialize)]
struct CoinRequest {
    coin: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn override_blacklist(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CoinRequest>,
) -> impl IntoResponse {
    let coin = req.coin.to_uppercase();
    let reason = req.reason.unwrap_or_else(|| "manual override".to_string());
    state.knowledge.blacklist(&coin, &reason);
    state.increment_version();
    info!(coin = %coin, "coin blacklisted via API");
    Json(serde_json::json!({ "coin": coin, "status": "BLACKLISTED" }))
}

async fn override_unblacklist(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CoinRequest>,
) -> impl IntoResponse {
    let coin = req.coin.to_uppercase();
    state.knowledge.unblacklist(&coin);
    state.increment_version();
    info!(coin = %coin, "coin unblacklisted via API");
    Json(serde_json::json!({
        "coin": coin,
        "status": state.knowledge.coin_status(&coin).to_string(),
    }))
}

#[derive(Deserialize)]
struct PatternRequest {
    pattern_id: String,
}

async fn override_disable_pattern(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PatternRequest>,
) -> impl IntoResponse {
    if state
        .knowledge
        .deactivate_pattern(&req.pattern_id, "manual override")
    {
        state.increment_version();
        Json(serde_json::json!({ "pattern_id": req.pattern_id, "is_active": false }))
            .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown pattern '{}'", req.pattern_id) })),
        )
            .into_response()
    }
}

async fn override_trigger_reflection(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("reflection triggered via API");
    let task_state = state.clone();
    tokio::spawn(async move {
        run_reflection_round(&task_state, "manual").await;
    });
    Json(serde_json::json!({ "status": "reflection started" }))
}

#[derive(Deserialize)]
struct RollbackRequest {
    adaptation_id: String,
}

async fn override_rollback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RollbackRequest>,
) -> impl IntoResponse {
    let adaptation = match state.store.get_adaptation(&req.adaptation_id) {
        Ok(Some(a)) => a,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": format!("unknown adaptation '{}'", req.adaptation_id)
                })),
            )
                .into_response();
        }
        Err(e) => return store_error(e),
    };

    match state
        .adaptation
        .rollback(&adaptation, Utc::now().timestamp_millis())
    {
        Some(record) => {
            state.increment_version();
            info!(adaptation_id = %req.adaptation_id, "adaptation rolled back via API");
            Json(serde_json::json!({
                "rolled_back": req.adaptation_id,
                "rollback_id": record.adaptation_id,
            }))
            .into_response()
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "adaptation has no rollback recipe"
            })),
        )
            .into_response(),
    }
}

async fn override_pause(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.sniper.set_mode(EngineMode::Paused);
    state.increment_version();
    info!("engine PAUSED via API");
    Json(serde_json::json!({ "mode": "Paused" }))
}

async fn override_resume(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.sniper.set_mode(EngineMode::Running);
    state.increment_version();
    info!("engine RESUMED via API");
    Json(serde_json::json!({ "mode": "Running" }))
}

// =============================================================================
// Helpers
// =============================================================================

fn store_error(e: anyhow::Error) -> axum::response::Response {
    warn!(error = %e, "store read failed in API handler");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "store unavailable" })),
    )
        .into_response()
}
