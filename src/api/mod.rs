//! HTTP facade.
//!
//! Read-only JSON snapshots of the control loop plus the operator override
//! endpoint. Handlers only read in-memory state; they never touch upstream
//! services and never block the control path.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::clock::Clock;
use crate::control::Controller;
use crate::providers::battery::BatteryProvider;
use crate::providers::evcc::EvccProvider;
use crate::providers::price::PriceProvider;
use crate::providers::pv::PvProvider;
use crate::scheduler::OptimizationScheduler;

const API_VERSION: &str = "0.0.1";

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub scheduler: Arc<OptimizationScheduler>,
    pub price: Arc<PriceProvider>,
    pub pv: Arc<PvProvider>,
    pub battery: Arc<BatteryProvider>,
    pub evcc: Option<Arc<EvccProvider>>,
    pub clock: Clock,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/style.css", get(style))
        .route("/json/optimize_request.json", get(optimize_request))
        .route("/json/optimize_response.json", get(optimize_response))
        .route("/json/current_controls.json", get(current_controls))
        .route("/controls/mode_override", post(mode_override))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../../web/index.html"))
}

async fn style() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/css")], include_str!("../../web/style.css"))
}

fn json_body(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

async fn optimize_request(State(state): State<AppState>) -> Response {
    json_body(state.scheduler.last_request_json().await)
}

async fn optimize_response(State(state): State<AppState>) -> Response {
    json_body(state.scheduler.last_response_json().await)
}

async fn current_controls(State(state): State<AppState>) -> Response {
    let controls = state.controller.status();
    let scheduler = state.scheduler.state().await;
    let battery = state.battery.current().await;

    // The provider snapshot is fresher than the control copy, which only
    // moves on charging edges.
    let (ev_charging, ev_mode) = match &state.evcc {
        Some(evcc) => {
            let ev = evcc.current().await;
            (ev.charging, ev.mode.to_string())
        }
        None => (controls.ev_charging, controls.ev_mode.clone()),
    };
    let evcc_error = match &state.evcc {
        Some(evcc) => evcc.last_error().await,
        None => None,
    };

    let payload = serde_json::json!({
        "current_states": {
            "current_ac_charge_demand": controls.current_ac_charge_demand,
            "current_dc_charge_demand": controls.current_dc_charge_demand,
            "current_discharge_allowed": controls.current_discharge_allowed,
            "inverter_mode": controls.inverter_mode,
            "inverter_mode_num": controls.inverter_mode_num,
            "override_active": controls.override_active,
            "override_end_time": controls.override_end_time,
            "changed_recently": state.controller.was_changed_recently(180),
        },
        "evcc": {
            "charging_state": ev_charging,
            "charging_mode": ev_mode,
        },
        "battery": {
            "soc": battery.soc_percent,
            "usable_capacity": battery.usable_capacity_wh,
            "max_charge_power_dyn": battery.dynamic_max_charge_w,
        },
        "errors": {
            "price": state.price.last_error().await,
            "pv_forecast": state.pv.last_error().await,
            "battery": state.battery.last_error().await,
            "evcc": evcc_error,
        },
        "state": scheduler,
        "eos_connect_version": env!("CARGO_PKG_VERSION"),
        "timestamp": state.clock.now_iso(),
        "api_version": API_VERSION,
    });
    json_body(serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string()))
}

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    /// -1 clears, 0..=2 forces the corresponding base mode.
    mode: i8,
    /// Minutes, 0..=720.
    duration: u64,
    /// kW, only honored for forced grid charging.
    #[serde(default)]
    charge_rate: f64,
}

async fn mode_override(
    State(state): State<AppState>,
    Json(request): Json<OverrideRequest>,
) -> Response {
    info!(
        mode = request.mode,
        duration_min = request.duration,
        charge_rate_kw = request.charge_rate,
        "override requested"
    );
    match state
        .controller
        .set_override(request.mode, request.duration, request.charge_rate)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"status": "error", "message": e.to_string()})),
        )
            .into_response(),
    }
}
