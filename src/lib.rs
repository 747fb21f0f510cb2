//! Medication adherence tracking: schedules, dose logs, reminders, and an
//! assistant that answers medication questions.
//!
//! MediMimes serves a JSON API over axum. Each user registers medications
//! with a daily list of dose times; the server expands those into per-day
//! dose records, sends Web Push reminders at each dose time, marks doses
//! missed once they are overdue, and reports adherence on a dashboard.
//!
//! # Architecture
//!
//! - **Storage**: a single SQLite connection shared behind a mutex; FTS5 and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) back the knowledge base
//! - **Scheduling**: one background task sends reminders and sweeps missed doses
//! - **Assistant**: canned small talk, a records tool over the user's own
//!   data, and retrieval-augmented answers from a hosted completion model
//! - **Embeddings**: local ONNX all-MiniLM-L6-v2 (384 dimensions) with a
//!   deterministic hashed fallback
//!
//! # Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`db`]: connection setup, schema, and migrations
//! - [`accounts`]: users, password hashing, and sessions
//! - [`meds`]: medications, dose tracking, adherence, and miss-risk prediction
//! - [`notify`]: push subscriptions and reminder delivery
//! - [`calendar`]: recurring calendar events for dose schedules
//! - [`assistant`]: chat routing, records answers, and the knowledge base
//! - [`embedding`]: text-to-vector providers
//! - [`api`]: HTTP handlers and routing
//! - [`scheduler`]: the reminder and missed-dose loop

pub mod accounts;
pub mod api;
pub mod assistant;
pub mod calendar;
pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod meds;
pub mod notify;
pub mod scheduler;
pub mod server;
