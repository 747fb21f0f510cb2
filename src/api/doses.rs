//! Dashboard and dose tracking handlers.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{success, ApiJson, AppState, CurrentUser};
use crate::error::{ApiError, ApiResult};
use crate::meds::adherence::{self, Dashboard, DashboardData};
use crate::meds::doses::{self, TodayLog};
use crate::meds::types::{DoseLog, DoseStatus};

pub async fn dashboard(State(state): State<AppState>, current: CurrentUser) -> ApiResult<Json<Dashboard>> {
    let user_id = current.user.id;
    let now = state.now();
    let data = state
        .with_db(move |conn| Ok(adherence::dashboard(conn, user_id, now)?))
        .await?;
    Ok(Json(data))
}

pub async fn dashboard_data(
    State(state): State<AppState>,
    current: CurrentUser,
) -> ApiResult<Json<DashboardData>> {
    let user_id = current.user.id;
    let today = state.now().date();
    let data = state
        .with_db(move |conn| Ok(adherence::dashboard_data(conn, user_id, today)?))
        .await?;
    Ok(Json(data))
}

#[derive(Debug, Deserialize)]
pub struct LogDose {
    #[serde(alias = "med_id")]
    pub medication_id: i64,
    pub time: String,
    #[serde(default = "default_taken")]
    pub taken: bool,
}

fn default_taken() -> bool {
    true
}

pub async fn log(
    State(state): State<AppState>,
    current: CurrentUser,
    ApiJson(body): ApiJson<LogDose>,
) -> ApiResult<Json<Value>> {
    let user_id = current.user.id;
    let now = state.now();
    let dose = state
        .with_db(move |conn| {
            Ok(doses::log_dose(conn, user_id, body.medication_id, &body.time, body.taken, now)?)
        })
        .await?;
    Ok(success(json!({ "dose": dose })))
}

#[derive(Debug, Deserialize)]
pub struct ToggleDose {
    #[serde(alias = "dose_log_id")]
    pub dose_id: i64,
    pub status: String,
}

pub async fn toggle(
    State(state): State<AppState>,
    current: CurrentUser,
    ApiJson(body): ApiJson<ToggleDose>,
) -> ApiResult<Json<Value>> {
    let status: DoseStatus = body.status.parse().map_err(ApiError::BadRequest)?;
    let user_id = current.user.id;
    let now = state.now();
    let dose: DoseLog = state
        .with_db(move |conn| Ok(doses::set_dose_status(conn, user_id, body.dose_id, status, now)?))
        .await?;
    Ok(success(json!({ "dose": dose })))
}

#[derive(Debug, Deserialize)]
pub struct MarkTaken {
    #[serde(alias = "dose_log_id")]
    pub dose_id: i64,
}

pub async fn mark_taken(
    State(state): State<AppState>,
    current: CurrentUser,
    ApiJson(body): ApiJson<MarkTaken>,
) -> ApiResult<Json<Value>> {
    let user_id = current.user.id;
    let now = state.now();
    let (dose, name) = state
        .with_db(move |conn| Ok(doses::mark_dose_taken(conn, user_id, body.dose_id, now)?))
        .await?;
    Ok(success(json!({
        "message": format!("{name} marked as taken"),
        "dose": dose,
    })))
}

pub async fn today(State(state): State<AppState>, current: CurrentUser) -> ApiResult<Json<Vec<TodayLog>>> {
    let user_id = current.user.id;
    let today = state.now().date();
    let logs = state
        .with_db(move |conn| Ok(doses::day_logs(conn, user_id, today)?))
        .await?;
    Ok(Json(logs))
}
