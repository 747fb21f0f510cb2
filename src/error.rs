//! HTTP-facing error type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::accounts::AuthError;
use crate::calendar::CalendarError;
use crate::meds::MedError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    /// An external service (push, calendar, model endpoint) failed.
    #[error("{0}")]
    Upstream(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn login_required() -> Self {
        Self::Unauthorized("Please log in to continue.".into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Internal(e) => {
                tracing::error!(error = %format!("{e:#}"), "request failed");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "status": "error", "message": message }))).into_response()
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl From<MedError> for ApiError {
    fn from(e: MedError) -> Self {
        match e {
            MedError::Invalid(msg) => Self::BadRequest(msg),
            MedError::NotFound(what) => Self::NotFound(format!("{} not found", capitalize(what))),
            MedError::Storage(e) => Self::Internal(e.into()),
            MedError::Other(e) => Self::Internal(e),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingCredentials => Self::BadRequest(e.to_string()),
            AuthError::UsernameTaken => Self::Conflict(e.to_string()),
            AuthError::InvalidCredentials => Self::Unauthorized(e.to_string()),
        }
    }
}

impl From<CalendarError> for ApiError {
    fn from(e: CalendarError) -> Self {
        match e {
            CalendarError::NotConnected => Self::Unauthorized(e.to_string()),
            CalendarError::AlreadyLinked | CalendarError::NoneLinked => Self::BadRequest(e.to_string()),
            CalendarError::Api(_) => Self::Upstream(e.to_string()),
            CalendarError::Med(inner) => inner.into(),
            CalendarError::Other(inner) => Self::Internal(inner),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(e.into())
    }
}
