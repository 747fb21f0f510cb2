//! HTTP server and background scheduler startup.
//!
//! [`serve`] opens the database, builds the shared [`AppState`], spawns the
//! reminder loop, and runs axum until Ctrl-C.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::api::{self, AppState, Clock};
use crate::assistant::llm::ChatCompletionsClient;
use crate::assistant::Assistant;
use crate::calendar::google::{GoogleCalendar, GoogleOAuth};
use crate::calendar::CalendarSync;
use crate::config::MediConfig;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::meds::predictor::AdherencePredictor;
use crate::notify::{PushSender, WebPushSender};
use crate::scheduler::Scheduler;

/// Open the DB and create the embedding provider.
pub fn setup_shared_state(
    config: &MediConfig,
) -> Result<(Arc<Mutex<Connection>>, Arc<dyn EmbeddingProvider>)> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path)?;
    tracing::info!(db = %db_path.display(), "database ready");

    let provider: Arc<dyn EmbeddingProvider> = Arc::from(embedding::create_provider(&config.embedding)?);
    tracing::info!(model = provider.model_name(), "embedding provider ready");

    // Knowledge vectors from another model are not comparable.
    let chunks: i64 = conn.query_row("SELECT COUNT(*) FROM kb_chunks", [], |row| row.get(0))?;
    if let (true, Ok(Some(stored_model))) = (chunks > 0, db::migrations::get_embedding_model(&conn)) {
        if stored_model != provider.model_name() {
            tracing::warn!(
                stored = %stored_model,
                current = %provider.model_name(),
                "embedding model changed; run `medimimes kb ingest` again to rebuild the knowledge base"
            );
        }
    }

    Ok((Arc::new(Mutex::new(conn)), provider))
}

/// Wire the production services into an [`AppState`].
pub fn build_app_state(
    db: Arc<Mutex<Connection>>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: Arc<MediConfig>,
    clock: Clock,
) -> Result<AppState> {
    let model = Arc::new(ChatCompletionsClient::new(&config.assistant)?);
    if config.assistant.api_key.is_empty() {
        tracing::warn!("no assistant API key; knowledge questions will fail until GROQ_API_KEY is set");
    }
    let assistant = Arc::new(Assistant::new(embedder, model, &config.assistant));

    let oauth = GoogleOAuth::from_config(&config);
    if !oauth.is_configured() {
        tracing::info!("google calendar client not configured; calendar sync disabled");
    }
    let google = GoogleCalendar::new(oauth.clone(), Arc::clone(&db))?;
    let calendar = Arc::new(CalendarSync::new(
        Arc::clone(&db),
        Arc::new(google),
        config.calendar.clone(),
    ));

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(20))
        .build()
        .context("failed to create HTTP client")?;

    Ok(AppState::new(
        db,
        config,
        assistant,
        calendar,
        Arc::new(oauth),
        http,
        Arc::new(AdherencePredictor::trained()),
        clock,
    ))
}

/// Push sender if VAPID keys are configured.
pub fn push_sender(config: &MediConfig) -> Option<Arc<dyn PushSender>> {
    if config.push.vapid_private_key.is_empty() {
        tracing::info!("no VAPID private key; push reminders disabled");
        return None;
    }
    match WebPushSender::new(&config.push) {
        Ok(sender) => Some(Arc::new(sender)),
        Err(e) => {
            tracing::warn!(error = %e, "push reminders disabled");
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Run the HTTP server and the scheduler until Ctrl-C.
pub async fn serve(config: MediConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let (db, embedder) = setup_shared_state(&config)?;
    let config = Arc::new(config);
    let clock = api::system_clock();

    let state = build_app_state(Arc::clone(&db), embedder, Arc::clone(&config), Arc::clone(&clock))?;

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = if config.scheduler.enabled {
        let scheduler = Scheduler::new(
            Arc::clone(&db),
            push_sender(&config),
            config.scheduler.clone(),
            clock,
        );
        Some(tokio::spawn(scheduler.run(async move {
            let _ = stop_rx.changed().await;
        })))
    } else {
        tracing::info!("scheduler disabled");
        None
    };

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "MediMimes listening at http://{bind_addr}");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            tracing::info!("shutting down");
        })
        .await?;

    let _ = stop_tx.send(true);
    if let Some(task) = scheduler_task {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "scheduler task ended abnormally");
        }
    }
    Ok(())
}
