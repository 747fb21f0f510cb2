//! Calendar sync for medication schedules.
//!
//! Each daily dose time becomes one recurring event. The ids the provider
//! hands back are stored on the medication so the events can be removed when
//! the schedule changes or the medication is deleted.

pub mod google;

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::CalendarConfig;
use crate::meds::doses::next_scheduled_day;
use crate::meds::medication::{get_medication, set_calendar_event_ids, UpdateOutcome};
use crate::meds::types::{scheduled_at, Frequency, Medication};
use crate::meds::MedError;

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("Please connect your Google Calendar first.")]
    NotConnected,
    #[error("Events are already linked to this medication. Delete them first if you want to re-add.")]
    AlreadyLinked,
    #[error("No linked Google Calendar events found.")]
    NoneLinked,
    #[error("An API error occurred: {0}")]
    Api(String),
    #[error(transparent)]
    Med(#[from] MedError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CalendarResult<T> = std::result::Result<T, CalendarError>;

/// A recurring event to create.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalendarEvent {
    pub summary: String,
    pub description: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub time_zone: String,
    pub recurrence: Vec<String>,
}

#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Create `event` in the user's primary calendar, returning its id.
    async fn insert_event(&self, user_id: i64, event: &CalendarEvent) -> CalendarResult<String>;

    async fn delete_event(&self, user_id: i64, event_id: &str) -> CalendarResult<()>;
}

pub fn recurrence_rule(frequency: Frequency) -> &'static str {
    match frequency {
        Frequency::Daily => "RRULE:FREQ=DAILY",
        Frequency::Weekly => "RRULE:FREQ=WEEKLY",
        Frequency::Monthly => "RRULE:FREQ=MONTHLY",
    }
}

/// One recurring event per dose time, starting on the first day on or after
/// `from` that the medication is scheduled.
pub fn build_events(med: &Medication, from: NaiveDate, config: &CalendarConfig) -> Vec<CalendarEvent> {
    let first_day = next_scheduled_day(med, from);
    med.times
        .iter()
        .filter_map(|t| scheduled_at(first_day, t).ok())
        .map(|start| CalendarEvent {
            summary: format!("Medication: {} ({} mg)", med.pill_name, med.dosage),
            description: format!("Time to take your {} dose.", med.pill_name),
            start,
            end: start + Duration::minutes(config.event_minutes),
            time_zone: config.time_zone.clone(),
            recurrence: vec![recurrence_rule(med.frequency).to_string()],
        })
        .collect()
}

/// Calendar operations bound to the shared database and a provider.
pub struct CalendarSync {
    db: Arc<Mutex<Connection>>,
    service: Arc<dyn CalendarService>,
    config: CalendarConfig,
}

impl CalendarSync {
    pub fn new(db: Arc<Mutex<Connection>>, service: Arc<dyn CalendarService>, config: CalendarConfig) -> Self {
        Self { db, service, config }
    }

    async fn with_db<T, F>(&self, f: F) -> CalendarResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> CalendarResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))?;
            f(&conn)
        })
        .await
        .map_err(|e| CalendarError::Other(e.into()))?
    }

    async fn load(&self, user_id: i64, med_id: i64) -> CalendarResult<Medication> {
        self.with_db(move |conn| Ok(get_medication(conn, user_id, med_id)?)).await
    }

    async fn store_ids(&self, user_id: i64, med_id: i64, ids: Vec<String>) -> CalendarResult<()> {
        self.with_db(move |conn| Ok(set_calendar_event_ids(conn, user_id, med_id, &ids)?))
            .await
    }

    /// Create events for every dose time. On a partial failure the events
    /// already created are removed again.
    async fn create_for(&self, user_id: i64, med: &Medication, today: NaiveDate) -> CalendarResult<Vec<String>> {
        let mut created = Vec::new();
        for event in build_events(med, today, &self.config) {
            match self.service.insert_event(user_id, &event).await {
                Ok(id) => created.push(id),
                Err(e) => {
                    self.delete_ids(user_id, &created).await;
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    /// Best-effort delete; returns how many succeeded.
    pub async fn delete_ids(&self, user_id: i64, ids: &[String]) -> usize {
        let mut deleted = 0;
        for id in ids {
            match self.service.delete_event(user_id, id).await {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!(user_id, event_id = %id, error = %e, "calendar event delete failed"),
            }
        }
        deleted
    }

    /// Link new recurring events to a medication. Returns the event count.
    pub async fn add_events(&self, user_id: i64, med_id: i64, today: NaiveDate) -> CalendarResult<usize> {
        let med = self.load(user_id, med_id).await?;
        if !med.calendar_event_ids.is_empty() {
            return Err(CalendarError::AlreadyLinked);
        }
        let ids = self.create_for(user_id, &med, today).await?;
        let count = ids.len();
        self.store_ids(user_id, med_id, ids).await?;
        tracing::info!(user_id, medication_id = med_id, count, "calendar events linked");
        Ok(count)
    }

    /// Delete a medication's linked events and clear the link.
    pub async fn remove_events(&self, user_id: i64, med_id: i64) -> CalendarResult<usize> {
        let med = self.load(user_id, med_id).await?;
        if med.calendar_event_ids.is_empty() {
            return Err(CalendarError::NoneLinked);
        }
        let deleted = self.delete_ids(user_id, &med.calendar_event_ids).await;
        self.store_ids(user_id, med_id, Vec::new()).await?;
        tracing::info!(user_id, medication_id = med_id, deleted, "calendar events unlinked");
        Ok(deleted)
    }

    /// Follow up an edit: when the schedule changed and events were linked,
    /// replace them. Failures turn into notices.
    pub async fn resync(&self, user_id: i64, outcome: &UpdateOutcome, today: NaiveDate) -> Vec<String> {
        let mut notices = Vec::new();
        if !outcome.schedule_changed || outcome.previous_event_ids.is_empty() {
            return notices;
        }

        let removed = self.delete_ids(user_id, &outcome.previous_event_ids).await;
        if removed > 0 {
            notices.push(format!("Removed {removed} outdated Google Calendar event(s)."));
        }

        let med = &outcome.medication;
        match self.create_for(user_id, med, today).await {
            Ok(ids) => {
                let count = ids.len();
                match self.store_ids(user_id, med.id, ids).await {
                    Ok(()) => notices.push(format!("Re-created {count} Google Calendar event(s) for the new schedule.")),
                    Err(e) => notices.push(format!("Calendar events were created but could not be saved: {e}")),
                }
            }
            Err(CalendarError::NotConnected) => {
                notices.push("Connect Google Calendar to sync the new schedule.".to_string())
            }
            Err(e) => notices.push(format!("Could not update Google Calendar events: {e}")),
        }
        notices
    }
}
