//! HTTP API.
//!
//! Handlers are grouped by resource. Every handler that touches SQLite goes
//! through [`AppState::with_db`], which runs the closure on the blocking pool
//! with the shared connection locked.

mod auth;
mod calendar;
mod chat;
mod doses;
mod extract;
mod medications;
mod push;

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use axum::extract::State;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::NaiveDateTime;
use rusqlite::Connection;
use serde_json::{json, Value};

use crate::assistant::Assistant;
use crate::calendar::google::GoogleOAuth;
use crate::calendar::CalendarSync;
use crate::config::MediConfig;
use crate::error::ApiResult;
use crate::meds::predictor::AdherencePredictor;

pub use auth::{session_token, CurrentUser};
pub use extract::{ApiJson, ApiPath, ApiQuery};

/// Wall-clock source. Tests pin it.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Local::now().naive_local())
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub config: Arc<MediConfig>,
    pub assistant: Arc<Assistant>,
    pub calendar: Arc<CalendarSync>,
    pub oauth: Arc<GoogleOAuth>,
    pub http: reqwest::Client,
    pub predictor: Arc<AdherencePredictor>,
    clock: Clock,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Mutex<Connection>>,
        config: Arc<MediConfig>,
        assistant: Arc<Assistant>,
        calendar: Arc<CalendarSync>,
        oauth: Arc<GoogleOAuth>,
        http: reqwest::Client,
        predictor: Arc<AdherencePredictor>,
        clock: Clock,
    ) -> Self {
        Self {
            db,
            config,
            assistant,
            calendar,
            oauth,
            http,
            predictor,
            clock,
        }
    }

    pub fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    /// Run blocking database work with the connection locked.
    pub async fn with_db<T, F>(&self, f: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> ApiResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))?;
            f(&conn)
        })
        .await?
    }
}

/// `{"status":"success", ...extra}`
pub(crate) fn success(extra: Value) -> Json<Value> {
    let mut body = json!({ "status": "success" });
    if let (Some(map), Value::Object(extra)) = (body.as_object_mut(), extra) {
        map.extend(extra);
    }
    Json(body)
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let summary = state.with_db(|conn| Ok(crate::db::summarize(conn)?)).await?;
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "database": summary,
    })))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/signup", post(auth::signup))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route(
            "/api/medications",
            get(medications::list).post(medications::create),
        )
        .route(
            "/api/medications/{id}",
            put(medications::update).delete(medications::remove),
        )
        .route("/api/medications/{id}/risk", get(medications::risk))
        .route("/api/dashboard", get(doses::dashboard))
        .route("/api/dashboard/data", get(doses::dashboard_data))
        .route("/api/doses/log", post(doses::log))
        .route("/api/doses/toggle", post(doses::toggle))
        .route("/api/doses/mark-taken", post(doses::mark_taken))
        .route("/api/doses/today", get(doses::today))
        .route("/api/push/vapid-public-key", get(push::vapid_public_key))
        .route("/api/push/subscribe", post(push::subscribe))
        .route("/google/calendar/connect", get(calendar::connect))
        .route("/google/calendar/callback", get(calendar::callback))
        .route(
            "/api/calendar/{med_id}/events",
            post(calendar::add_events).delete(calendar::remove_events),
        )
        .route("/api/chat", post(chat::chat))
        .with_state(state)
}

