use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use super::{success, ApiJson, ApiPath, AppState, CurrentUser};
use crate::error::ApiResult;
use crate::meds::medication::{self, MedicationInput};
use crate::meds::predictor::RiskPrediction;
use crate::meds::types::Medication;

pub async fn list(State(state): State<AppState>, current: CurrentUser) -> ApiResult<Json<Vec<Medication>>> {
    let user_id = current.user.id;
    let meds = state
        .with_db(move |conn| Ok(medication::list_medications(conn, user_id)?))
        .await?;
    Ok(Json(meds))
}

pub async fn create(
    State(state): State<AppState>,
    current: CurrentUser,
    ApiJson(input): ApiJson<MedicationInput>,
) -> ApiResult<impl IntoResponse> {
    let spec = input.validate()?;
    let user_id = current.user.id;
    let now = state.now();
    let med = state
        .with_db(move |conn| Ok(medication::create_medication(conn, user_id, &spec, now)?))
        .await?;
    Ok((
        StatusCode::CREATED,
        success(json!({ "message": "Medication added", "medication": med })),
    ))
}

/// Edit a medication. A schedule change on a calendar-linked medication
/// replaces its events; calendar trouble is reported in `notices`.
pub async fn update(
    State(state): State<AppState>,
    current: CurrentUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(input): ApiJson<MedicationInput>,
) -> ApiResult<impl IntoResponse> {
    let spec = input.validate()?;
    let user_id = current.user.id;
    let now = state.now();
    let outcome = state
        .with_db(move |conn| Ok(medication::update_medication(conn, user_id, id, &spec, now)?))
        .await?;

    let notices = state
        .calendar
        .resync(user_id, &outcome, now.date())
        .await;

    Ok(success(json!({
        "message": "Medication updated",
        "medication": outcome.medication,
        "schedule_changed": outcome.schedule_changed,
        "notices": notices,
    })))
}

pub async fn remove(
    State(state): State<AppState>,
    current: CurrentUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<impl IntoResponse> {
    let user_id = current.user.id;
    let med = state
        .with_db(move |conn| Ok(medication::get_medication(conn, user_id, id)?))
        .await?;

    let events_deleted = state.calendar.delete_ids(user_id, &med.calendar_event_ids).await;

    state
        .with_db(move |conn| Ok(medication::delete_medication(conn, user_id, id)?))
        .await?;

    Ok(success(json!({
        "message": "Medication deleted",
        "calendar_events_deleted": events_deleted,
    })))
}

pub async fn risk(
    State(state): State<AppState>,
    current: CurrentUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<RiskPrediction>> {
    let user_id = current.user.id;
    let now = state.now();
    let predictor = Arc::clone(&state.predictor);
    let prediction = state
        .with_db(move |conn| {
            let med = medication::get_medication(conn, user_id, id)?;
            Ok(predictor.predict(conn, user_id, &med, now)?)
        })
        .await?;
    Ok(Json(prediction))
}
