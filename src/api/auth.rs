//! Signup, login, logout, and the session extractor.

use axum::extract::{FromRequestParts, State};
use axum::http::header::{AUTHORIZATION, COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use super::{success, ApiJson, AppState};
use crate::accounts::{self, Session, User};
use crate::error::{ApiError, ApiResult};

/// The logged-in user behind a request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub token: String,
}

/// Session token from `Authorization: Bearer` or the session cookie.
pub fn session_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == cookie_name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers, &state.config.auth.session_cookie)
            .ok_or_else(ApiError::login_required)?;

        let lookup = token.clone();
        let user = state
            .with_db(move |conn| Ok(accounts::resolve_session(conn, &lookup)?))
            .await?
            .ok_or_else(ApiError::login_required)?;

        Ok(Self { user, token })
    }
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn session_cookie(name: &str, token: &str) -> String {
    format!("{name}={token}; Path=/; HttpOnly; SameSite=Lax")
}

fn session_response(state: &AppState, status: StatusCode, session: Session) -> impl IntoResponse {
    let cookie = session_cookie(&state.config.auth.session_cookie, &session.token);
    (
        status,
        [(SET_COOKIE, cookie)],
        success(json!({ "token": session.token, "user": session.user })),
    )
}

pub async fn signup(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<Credentials>,
) -> ApiResult<impl IntoResponse> {
    let iterations = state.config.auth.password_iterations;
    let session = state
        .with_db(move |conn| Ok(accounts::signup(conn, &body.username, &body.password, iterations)??))
        .await?;
    tracing::info!(user_id = session.user.id, "user signed up");
    Ok(session_response(&state, StatusCode::CREATED, session))
}

pub async fn login(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<Credentials>,
) -> ApiResult<impl IntoResponse> {
    let iterations = state.config.auth.password_iterations;
    let session = state
        .with_db(move |conn| Ok(accounts::login(conn, &body.username, &body.password, iterations)??))
        .await?;
    Ok(session_response(&state, StatusCode::OK, session))
}

pub async fn logout(State(state): State<AppState>, user: CurrentUser) -> ApiResult<impl IntoResponse> {
    let token = user.token.clone();
    state
        .with_db(move |conn| Ok(accounts::logout(conn, &token)?))
        .await?;
    let cleared = format!(
        "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
        state.config.auth.session_cookie
    );
    Ok(([(SET_COOKIE, cleared)], success(json!({ "message": "Logged out" }))))
}
