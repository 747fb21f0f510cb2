//! Google Calendar connect flow and per-medication event sync.

use axum::extract::State;
use axum::response::Redirect;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{success, ApiPath, ApiQuery, AppState, CurrentUser};
use crate::accounts;
use crate::calendar::google::store_credentials;
use crate::error::{ApiError, ApiResult};

pub async fn connect(State(state): State<AppState>, current: CurrentUser) -> ApiResult<Redirect> {
    if !state.oauth.is_configured() {
        return Err(ApiError::BadRequest("Google Calendar is not configured.".into()));
    }
    let oauth_state = accounts::random_hex(16);
    let token = current.token.clone();
    let stored = oauth_state.clone();
    state
        .with_db(move |conn| Ok(accounts::set_oauth_state(conn, &token, Some(&stored))?))
        .await?;
    Ok(Redirect::to(&state.oauth.authorization_url(&oauth_state)))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

pub async fn callback(
    State(state): State<AppState>,
    current: CurrentUser,
    ApiQuery(params): ApiQuery<CallbackParams>,
) -> ApiResult<Json<Value>> {
    if let Some(error) = params.error {
        return Err(ApiError::BadRequest(format!("Google authorization was denied: {error}")));
    }
    let code = params
        .code
        .ok_or_else(|| ApiError::BadRequest("Missing authorization code.".into()))?;

    let token = current.token.clone();
    let expected = state
        .with_db(move |conn| Ok(accounts::oauth_state(conn, &token)?))
        .await?;
    if expected.is_none() || expected != params.state {
        return Err(ApiError::BadRequest("Invalid OAuth state. Please try connecting again.".into()));
    }

    let tokens = state
        .oauth
        .exchange_code(&state.http, &code)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "google code exchange failed");
            ApiError::Upstream(format!("An API error occurred: {e}"))
        })?;

    let user_id = current.user.id;
    let token = current.token.clone();
    let now = state.now();
    state
        .with_db(move |conn| {
            store_credentials(conn, user_id, &tokens, now)?;
            accounts::set_oauth_state(conn, &token, None)?;
            Ok(())
        })
        .await?;

    tracing::info!(user_id, "google calendar connected");
    Ok(success(json!({ "message": "Google Calendar connected." })))
}

pub async fn add_events(
    State(state): State<AppState>,
    current: CurrentUser,
    ApiPath(med_id): ApiPath<i64>,
) -> ApiResult<Json<Value>> {
    let count = state
        .calendar
        .add_events(current.user.id, med_id, state.now().date())
        .await?;
    Ok(success(json!({
        "message": format!("Successfully created {count} recurring calendar event(s)."),
        "count": count,
    })))
}

pub async fn remove_events(
    State(state): State<AppState>,
    current: CurrentUser,
    ApiPath(med_id): ApiPath<i64>,
) -> ApiResult<Json<Value>> {
    let count = state.calendar.remove_events(current.user.id, med_id).await?;
    Ok(success(json!({
        "message": format!("Successfully deleted {count} linked Google Calendar recurring event(s)!"),
        "count": count,
    })))
}
