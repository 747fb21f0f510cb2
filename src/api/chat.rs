use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::{ApiJson, AppState, CurrentUser};
use crate::assistant::ChatReply;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
}

/// Assistant failures come back as reply text, so only an empty message is
/// rejected here.
pub async fn chat(
    State(state): State<AppState>,
    current: CurrentUser,
    ApiJson(body): ApiJson<ChatRequest>,
) -> ApiResult<Json<ChatReply>> {
    let message = body.message.trim();
    if message.is_empty() {
        return Err(ApiError::BadRequest("Please enter a message.".into()));
    }
    let reply = state
        .assistant
        .reply(&state.db, current.user.id, message, state.now())
        .await;
    Ok(Json(reply))
}
