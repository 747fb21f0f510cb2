use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{success, ApiJson, AppState, CurrentUser};
use crate::error::{ApiError, ApiResult};
use crate::notify;

pub async fn vapid_public_key(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let key = state.config.push.vapid_public_key.clone();
    if key.is_empty() {
        return Err(ApiError::NotFound("Push notifications are not configured.".into()));
    }
    Ok(Json(json!({ "publicKey": key })))
}

/// Browser `PushSubscription.toJSON()` shape.
#[derive(Debug, Deserialize)]
pub struct SubscriptionBody {
    pub endpoint: String,
    #[serde(default)]
    pub keys: SubscriptionKeys,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubscriptionKeys {
    #[serde(default)]
    pub p256dh: String,
    #[serde(default)]
    pub auth: String,
}

pub async fn subscribe(
    State(state): State<AppState>,
    current: CurrentUser,
    ApiJson(body): ApiJson<SubscriptionBody>,
) -> ApiResult<Json<Value>> {
    if body.endpoint.trim().is_empty() {
        return Err(ApiError::BadRequest("Subscription endpoint is required.".into()));
    }
    let user_id = current.user.id;
    let now = state.now();
    state
        .with_db(move |conn| {
            Ok(notify::save_subscription(
                conn,
                user_id,
                &body.endpoint,
                &body.keys.p256dh,
                &body.keys.auth,
                now,
            )?)
        })
        .await?;
    tracing::info!(user_id, "push subscription saved");
    Ok(success(json!({ "message": "Subscribed to reminders" })))
}
