//! Dashboard Surface (C11)
//!
//! A thin `axum` router translating the Loop Driver's snapshot/action API
//! into the dashboard's JSON contract (§6). The visual dashboard itself is
//! an external collaborator; this module only serves state and accepts
//! manual overrides.

use crate::loop_driver::{LoopDriver, ManualAction};
use crate::GatewayError;
use axum::extract::{Path as AxumPath, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
struct ApiState {
    driver: Arc<LoopDriver>,
}

/// Start the dashboard API server.
pub async fn start_server(driver: Arc<LoopDriver>) -> Result<(), GatewayError> {
    let state = ApiState { driver };
    let app = Router::new()
        .route("/health", get(health))
        .route("/devices", get(devices))
        .route("/alerts", get(alerts))
        .route("/honeypot", get(honeypot))
        .route("/actions/lockdown", post(lockdown))
        .route("/actions/:action/:ip", post(act_on_ip))
        .with_state(state);

    let addr = "0.0.0.0:8080";
    tracing::info!(%addr, "dashboard API listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Config(e.to_string()))?;

    axum::serve(listener, app).await.map_err(|e| GatewayError::Config(e.to_string()))
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let metrics = state.driver.metrics();
    Json(HealthResponse {
        state: "running".into(),
        uptime_secs: metrics.uptime_secs,
        cycles_completed: metrics.cycles_completed,
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

async fn devices(State(state): State<ApiState>) -> Json<Vec<crate::loop_driver::DeviceView>> {
    Json(state.driver.snapshot().devices.clone())
}

async fn alerts(State(state): State<ApiState>) -> Json<Vec<crate::loop_driver::Alert>> {
    Json(state.driver.snapshot().alerts.clone())
}

async fn honeypot(State(state): State<ApiState>) -> Json<Vec<crate::correlation::InteractionRecord>> {
    Json(state.driver.snapshot().honeypot.clone())
}

async fn lockdown(State(state): State<ApiState>) -> Json<ActionResponse> {
    match state.driver.manual_action("", ManualAction::Lockdown).await {
        Ok(()) => Json(ActionResponse { ok: true, reason: None }),
        Err(e) => Json(ActionResponse { ok: false, reason: Some(e.to_string()) }),
    }
}

async fn act_on_ip(
    State(state): State<ApiState>,
    AxumPath((action, ip)): AxumPath<(String, String)>,
) -> Json<ActionResponse> {
    let action = match action.as_str() {
        "isolate" => ManualAction::Isolate,
        "block" => ManualAction::Block,
        "kick" => ManualAction::Kick,
        "quarantine" => ManualAction::Quarantine,
        "redirect" => ManualAction::Redirect,
        "release" => ManualAction::Release,
        other => {
            return Json(ActionResponse { ok: false, reason: Some(format!("unknown action: {other}")) });
        }
    };

    match state.driver.manual_action(&ip, action).await {
        Ok(()) => Json(ActionResponse { ok: true, reason: None }),
        Err(e) => Json(ActionResponse { ok: false, reason: Some(e.to_string()) }),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    state: String,
    uptime_secs: i64,
    cycles_completed: u64,
    version: String,
}

#[derive(Serialize)]
struct ActionResponse {
    ok: bool,
    reason: Option<String>,
}
