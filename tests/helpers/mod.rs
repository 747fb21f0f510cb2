#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::Connection;

use medimimes::accounts::{self, User};
use medimimes::api::{AppState, Clock};
use medimimes::assistant::llm::CompletionModel;
use medimimes::assistant::Assistant;
use medimimes::calendar::google::GoogleOAuth;
use medimimes::calendar::{CalendarError, CalendarEvent, CalendarResult, CalendarService, CalendarSync};
use medimimes::config::MediConfig;
use medimimes::db;
use medimimes::embedding::hashed::HashedEmbeddingProvider;
use medimimes::meds::medication::{create_medication, MedicationSpec};
use medimimes::meds::predictor::AdherencePredictor;
use medimimes::meds::types::{Frequency, Medication};
use medimimes::notify::{PushSender, PushSubscription};

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    db::open_memory_database().unwrap()
}

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, min, 0)
        .unwrap()
}

pub fn create_user(conn: &Connection, username: &str) -> User {
    accounts::signup(conn, username, "password", 1)
        .unwrap()
        .unwrap()
        .user
}

pub fn add_med(
    conn: &Connection,
    user_id: i64,
    name: &str,
    frequency: Frequency,
    times: &[&str],
    created: NaiveDateTime,
) -> Medication {
    let spec = MedicationSpec {
        pill_name: name.to_string(),
        dosage: 500,
        frequency,
        times: times.iter().map(|t| t.to_string()).collect(),
    };
    create_medication(conn, user_id, &spec, created).unwrap()
}

pub fn fixed_clock(now: NaiveDateTime) -> Clock {
    Arc::new(move || now)
}

/// Completion model that records prompts and answers from a script.
#[derive(Default)]
pub struct FakeModel {
    pub prompts: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl CompletionModel for FakeModel {
    async fn complete(&self, _system: &str, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail.load(Ordering::SeqCst) {
            bail!("model endpoint unavailable");
        }
        Ok("Take it as soon as you remember.".to_string())
    }
}

/// Push sender that rejects a fixed set of endpoints.
#[derive(Default)]
pub struct FakeSender {
    pub failing: HashSet<String>,
    pub delivered: Mutex<Vec<(String, serde_json::Value)>>,
}

impl FakeSender {
    pub fn failing(endpoints: &[&str]) -> Self {
        Self {
            failing: endpoints.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PushSender for FakeSender {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<()> {
        if self.failing.contains(&subscription.endpoint) {
            bail!("410 Gone");
        }
        let json = serde_json::from_slice(payload)?;
        self.delivered
            .lock()
            .unwrap()
            .push((subscription.endpoint.clone(), json));
        Ok(())
    }
}

/// In-memory calendar. `fail_on_insert` makes the n-th insert (1-based) fail.
pub struct FakeCalendar {
    pub connected: AtomicBool,
    pub events: Mutex<Vec<(String, CalendarEvent)>>,
    pub deleted: Mutex<Vec<String>>,
    pub fail_on_insert: AtomicUsize,
    inserts: AtomicUsize,
}

impl Default for FakeCalendar {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(true),
            events: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            fail_on_insert: AtomicUsize::new(0),
            inserts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CalendarService for FakeCalendar {
    async fn insert_event(&self, _user_id: i64, event: &CalendarEvent) -> CalendarResult<String> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CalendarError::NotConnected);
        }
        let n = self.inserts.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on_insert.load(Ordering::SeqCst) {
            return Err(CalendarError::Api("quota exceeded".into()));
        }
        let id = format!("evt-{n}");
        self.events.lock().unwrap().push((id.clone(), event.clone()));
        Ok(id)
    }

    async fn delete_event(&self, _user_id: i64, event_id: &str) -> CalendarResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CalendarError::NotConnected);
        }
        self.events.lock().unwrap().retain(|(id, _)| id != event_id);
        self.deleted.lock().unwrap().push(event_id.to_string());
        Ok(())
    }
}

pub struct TestApp {
    pub state: AppState,
    pub model: Arc<FakeModel>,
    pub calendar: Arc<FakeCalendar>,
}

/// App state over `conn` with fakes for every external service.
pub fn test_app(conn: Connection, now: NaiveDateTime) -> TestApp {
    let mut config = MediConfig::default();
    config.auth.password_iterations = 1;
    config.push.vapid_public_key = "BPublicKeyForTests".into();
    config.calendar.client_id = "client-id".into();
    config.calendar.client_secret = "client-secret".into();
    let config = Arc::new(config);

    let db = Arc::new(Mutex::new(conn));
    let model = Arc::new(FakeModel::default());
    let calendar = Arc::new(FakeCalendar::default());
    let assistant = Arc::new(Assistant::new(
        Arc::new(HashedEmbeddingProvider::new()),
        model.clone(),
        &config.assistant,
    ));
    let sync = Arc::new(CalendarSync::new(
        Arc::clone(&db),
        calendar.clone(),
        config.calendar.clone(),
    ));

    let state = AppState::new(
        db,
        Arc::clone(&config),
        assistant,
        sync,
        Arc::new(GoogleOAuth::from_config(&config)),
        reqwest::Client::new(),
        Arc::new(AdherencePredictor::trained()),
        fixed_clock(now),
    );
    TestApp {
        state,
        model,
        calendar,
    }
}

/// Serve the router on an ephemeral port; returns the base URL.
pub async fn spawn_server(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, medimimes::api::router(state)).await.unwrap();
    });
    format!("http://{addr}")
}
