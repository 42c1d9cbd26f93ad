use crate::aggregate::{FleetStats, LocationStat, TimeSeriesPoint};
use crate::alert::{NotificationEntry, Thresholds};
use crate::coordinator::{CoordinationLease, CoordinatorService};
use crate::runtime::{Role, SharedEngine};
use crate::telemetry::FleetSnapshot;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct HttpState {
    pub engine: SharedEngine,
    pub coordinator: Arc<CoordinatorService>,
    pub roles: watch::Receiver<Role>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    instance_id: String,
    role: Role,
    lease: Option<CoordinationLease>,
    thresholds: Thresholds,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_snapshot(State(state): State<HttpState>) -> Json<Option<FleetSnapshot>> {
    Json(state.engine.lock().await.aggregation.current_snapshot())
}

async fn get_fleet_series(State(state): State<HttpState>) -> Json<Vec<TimeSeriesPoint>> {
    Json(state.engine.lock().await.aggregation.fleet_series(Utc::now()))
}

async fn get_fleet_stats(State(state): State<HttpState>) -> Json<FleetStats> {
    Json(state.engine.lock().await.aggregation.fleet_stats())
}

async fn get_location_series(
    State(state): State<HttpState>,
) -> Json<BTreeMap<String, Vec<TimeSeriesPoint>>> {
    Json(state.engine.lock().await.aggregation.location_series(Utc::now()))
}

async fn get_location_stats(State(state): State<HttpState>) -> Json<Vec<LocationStat>> {
    Json(state.engine.lock().await.aggregation.location_stats(Utc::now()))
}

async fn get_notifications(State(state): State<HttpState>) -> Json<Vec<NotificationEntry>> {
    Json(state.engine.lock().await.alerts.notifications())
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    let thresholds = *state.engine.lock().await.alerts.thresholds();
    Json(StatusResponse {
        instance_id: state.coordinator.self_id().to_string(),
        role: *state.roles.borrow(),
        lease: state.coordinator.current_lease(),
        thresholds,
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/snapshot", get(get_snapshot))
        .route("/v1/fleet/series", get(get_fleet_series))
        .route("/v1/fleet/stats", get(get_fleet_stats))
        .route("/v1/locations/series", get(get_location_series))
        .route("/v1/locations/stats", get(get_location_stats))
        .route("/v1/notifications", get(get_notifications))
        .route("/v1/status", get(get_status))
        .with_state(state)
}
