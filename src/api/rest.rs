// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Every endpoint lives under `/api/v1/`. `health` is public; everything else
// requires a valid Bearer token via the `AuthBearer` extractor. This mirrors
// the minimal operator surface named in spec.md §6: status, trip/reset,
// pause/resume a task, trigger a rebalance now — nothing more. The live
// dashboard feed the teacher's crate exposed (full-state snapshots, a
// WebSocket push channel) has no counterpart here.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::risk::RiskState;
use crate::types::{EngineMode, TaskId};

/// Build the operator API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/risk/trip", post(trip))
        .route("/api/v1/risk/reset", post(reset))
        .route("/api/v1/tasks/:task_id/pause", post(pause_task))
        .route("/api/v1/tasks/:task_id/resume", post(resume_task))
        .route("/api/v1/allocator/rebalance", post(rebalance_now))
        .route("/api/v1/scheduler/mode", post(set_scheduler_mode))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Health (public)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    risk_state: RiskState,
    scheduler_mode: EngineMode,
    task_counts_by_state: std::collections::HashMap<String, usize>,
    paused_tasks: Vec<TaskId>,
    current_allocation: Option<std::collections::HashMap<String, f64>>,
    unreceived_event_count: u64,
}

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sched = state.scheduler.status();
    let allocation = state
        .allocator
        .current_target()
        .map(|t| t.weights.into_iter().map(|(p, w)| (p.0, w)).collect());

    Json(StatusResponse {
        risk_state: state.risk.state(),
        scheduler_mode: sched.mode,
        task_counts_by_state: sched.counts_by_state,
        paused_tasks: sched.paused_tasks,
        current_allocation: allocation,
        unreceived_event_count: state.events.unreceived_count(),
    })
}

// ---------------------------------------------------------------------------
// Risk circuit control
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TripRequest {
    reason: String,
}

async fn trip(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TripRequest>,
) -> impl IntoResponse {
    state.risk.trip(&req.reason);
    warn!(reason = %req.reason, "circuit breaker tripped via operator API");
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct ResetRequest {
    token: String,
}

async fn reset(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetRequest>,
) -> impl IntoResponse {
    let expected = std::env::var("CANOPY_OPERATOR_TOKEN").unwrap_or_default();
    match state.risk.reset(&req.token, &expected) {
        Ok(()) => {
            info!("circuit breaker reset via operator API");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(reason) => {
            warn!(%reason, "circuit reset rejected: bad operator token");
            (StatusCode::FORBIDDEN, Json(serde_json::json!({ "error": reason.to_string() })))
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Task pause/resume
// ---------------------------------------------------------------------------

async fn pause_task(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    state.scheduler.pause_task(&TaskId(task_id));
    StatusCode::NO_CONTENT
}

async fn resume_task(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    state.scheduler.resume_task(&TaskId(task_id));
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RebalanceRequest {
    #[serde(default)]
    algorithm: Option<String>,
}

#[derive(Serialize)]
struct RebalanceResponse {
    plan_size: usize,
}

async fn rebalance_now(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<RebalanceRequest>,
) -> impl IntoResponse {
    let algorithm = match req.algorithm.as_deref() {
        Some("risk_adjusted") => crate::allocator::Algorithm::RiskAdjusted,
        Some("momentum") => crate::allocator::Algorithm::Momentum,
        _ => crate::allocator::Algorithm::EqualWeight,
    };

    if let Err(e) = state.allocator.compute_targets(algorithm) {
        warn!(error = %e, "rebalance-now failed to compute targets");
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(serde_json::json!({ "error": e.to_string() })))
            .into_response();
    }

    let cfg = state.config.read();
    let plan = state.allocator.plan_rebalance(cfg.risk.tx_cap_pct, state.risk.state());
    drop(cfg);

    (StatusCode::OK, Json(RebalanceResponse { plan_size: plan.len() })).into_response()
}

// ---------------------------------------------------------------------------
// Scheduler mode
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SetModeRequest {
    running: bool,
}

async fn set_scheduler_mode(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetModeRequest>,
) -> impl IntoResponse {
    let mode = if req.running { EngineMode::Running } else { EngineMode::Paused };
    state.scheduler.set_mode(mode);
    StatusCode::NO_CONTENT
}
