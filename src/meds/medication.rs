//! Medication CRUD.
//!
//! All functions are scoped to a user: a medication that exists but belongs
//! to someone else is reported as [`MedError::NotFound`].

use chrono::NaiveDateTime;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::doses::prune_unscheduled_pending;
use super::types::{format_datetime, format_dose_time, parse_dose_time, Frequency, Medication};
use super::{datetime_column, string_list_column, MedError, MedResult};

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_DOSAGE_MG: u32 = 10_000;
pub const MAX_TIMES_PER_DAY: usize = 24;

/// A number that browsers may submit either as JSON number or form text.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum NumberOrText {
    Number(i64),
    Text(String),
}

/// Medication form payload as submitted by the front end.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MedicationInput {
    pub pill_name: Option<String>,
    pub dosage: Option<NumberOrText>,
    #[serde(alias = "frequency_type")]
    pub frequency: Option<String>,
    #[serde(default)]
    pub times: Vec<String>,
}

/// A validated, normalized medication schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct MedicationSpec {
    pub pill_name: String,
    pub dosage: u32,
    pub frequency: Frequency,
    pub times: Vec<String>,
}

/// Outcome of an edit, telling the caller whether linked calendar events are stale.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub medication: Medication,
    pub schedule_changed: bool,
    /// Event ids that were linked before the edit.
    pub previous_event_ids: Vec<String>,
}

impl MedicationInput {
    pub fn validate(&self) -> MedResult<MedicationSpec> {
        let pill_name = self.pill_name.as_deref().map(str::trim).unwrap_or_default();
        let dosage_raw = match &self.dosage {
            Some(NumberOrText::Number(n)) => Some(*n),
            Some(NumberOrText::Text(s)) if !s.trim().is_empty() => Some(
                s.trim()
                    .parse::<i64>()
                    .map_err(|_| MedError::Invalid("Dosage must be a whole number of mg.".into()))?,
            ),
            _ => None,
        };

        let times: Vec<&str> = self
            .times
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();

        let Some(dosage) = dosage_raw.filter(|_| !pill_name.is_empty() && !times.is_empty()) else {
            return Err(MedError::Invalid("Please fill all required fields.".into()));
        };

        if pill_name.chars().count() > MAX_NAME_LEN {
            return Err(MedError::Invalid(format!(
                "Medication name must be at most {MAX_NAME_LEN} characters."
            )));
        }
        if dosage < 1 || dosage > MAX_DOSAGE_MG as i64 {
            return Err(MedError::Invalid(format!(
                "Dosage must be between 1 and {MAX_DOSAGE_MG} mg."
            )));
        }

        let frequency = match self.frequency.as_deref() {
            None | Some("") => Frequency::Daily,
            Some(f) => f.parse().map_err(MedError::Invalid)?,
        };

        let times = normalize_times(&times)?;

        Ok(MedicationSpec {
            pill_name: pill_name.to_string(),
            dosage: dosage as u32,
            frequency,
            times,
        })
    }
}

/// Parse, dedupe and sort dose times.
pub fn normalize_times(raw: &[&str]) -> MedResult<Vec<String>> {
    let mut parsed = raw
        .iter()
        .map(|t| parse_dose_time(t).map_err(MedError::Invalid))
        .collect::<MedResult<Vec<_>>>()?;
    parsed.sort();
    parsed.dedup();

    if parsed.is_empty() {
        return Err(MedError::Invalid("At least one time is required.".into()));
    }
    if parsed.len() > MAX_TIMES_PER_DAY {
        return Err(MedError::Invalid(format!(
            "At most {MAX_TIMES_PER_DAY} times per day are allowed."
        )));
    }
    Ok(parsed.into_iter().map(format_dose_time).collect())
}

const SELECT_COLUMNS: &str = "id, user_id, pill_name, dosage, frequency, times_per_day, times, \
                              calendar_event_ids, created_at";

pub(crate) fn medication_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Medication> {
    let frequency: String = row.get(4)?;
    Ok(Medication {
        id: row.get(0)?,
        user_id: row.get(1)?,
        pill_name: row.get(2)?,
        dosage: row.get(3)?,
        frequency: frequency
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?,
        times_per_day: row.get(5)?,
        times: string_list_column(row, 6)?,
        calendar_event_ids: string_list_column(row, 7)?,
        created_at: datetime_column(row, 8)?,
    })
}

pub fn create_medication(
    conn: &Connection,
    user_id: i64,
    spec: &MedicationSpec,
    now: NaiveDateTime,
) -> MedResult<Medication> {
    let times_json = serde_json::to_string(&spec.times).map_err(anyhow::Error::from)?;
    conn.execute(
        "INSERT INTO medications (user_id, pill_name, dosage, frequency, times_per_day, times, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user_id,
            spec.pill_name,
            spec.dosage,
            spec.frequency.as_str(),
            spec.times.len() as u32,
            times_json,
            format_datetime(now),
        ],
    )?;
    let id = conn.last_insert_rowid();
    tracing::info!(user_id, medication_id = id, times = spec.times.len(), "medication created");
    get_medication(conn, user_id, id)
}

pub fn list_medications(conn: &Connection, user_id: i64) -> MedResult<Vec<Medication>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM medications WHERE user_id = ?1 ORDER BY id"
    ))?;
    let meds = stmt
        .query_map(params![user_id], medication_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(meds)
}

/// Every medication in the system, for the reminder loop.
pub fn list_all_medications(conn: &Connection) -> MedResult<Vec<Medication>> {
    let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM medications ORDER BY id"))?;
    let meds = stmt
        .query_map([], medication_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(meds)
}

pub fn get_medication(conn: &Connection, user_id: i64, id: i64) -> MedResult<Medication> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM medications WHERE id = ?1 AND user_id = ?2"),
        params![id, user_id],
        medication_from_row,
    )
    .optional()?
    .ok_or(MedError::NotFound("medication"))
}

/// Apply an edit. When the times or frequency change, the stored calendar
/// event ids are cleared so the caller can recreate them, and pending doses
/// from `now` on that the new schedule drops are deleted.
pub fn update_medication(
    conn: &Connection,
    user_id: i64,
    id: i64,
    spec: &MedicationSpec,
    now: NaiveDateTime,
) -> MedResult<UpdateOutcome> {
    let existing = get_medication(conn, user_id, id)?;
    let schedule_changed = existing.times != spec.times || existing.frequency != spec.frequency;
    let previous_event_ids = existing.calendar_event_ids.clone();

    let event_ids = if schedule_changed {
        Vec::new()
    } else {
        existing.calendar_event_ids
    };

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE medications SET pill_name = ?1, dosage = ?2, frequency = ?3, times_per_day = ?4, \
         times = ?5, calendar_event_ids = ?6 WHERE id = ?7 AND user_id = ?8",
        params![
            spec.pill_name,
            spec.dosage,
            spec.frequency.as_str(),
            spec.times.len() as u32,
            serde_json::to_string(&spec.times).map_err(anyhow::Error::from)?,
            serde_json::to_string(&event_ids).map_err(anyhow::Error::from)?,
            id,
            user_id,
        ],
    )?;

    let medication = get_medication(&tx, user_id, id)?;
    if schedule_changed {
        prune_unscheduled_pending(&tx, &medication, now)?;
    }
    tx.commit()?;

    tracing::info!(user_id, medication_id = id, schedule_changed, "medication updated");

    Ok(UpdateOutcome {
        medication,
        schedule_changed,
        previous_event_ids,
    })
}

/// Delete a medication; its dose and reminder history cascade.
pub fn delete_medication(conn: &Connection, user_id: i64, id: i64) -> MedResult<Medication> {
    let existing = get_medication(conn, user_id, id)?;
    conn.execute(
        "DELETE FROM medications WHERE id = ?1 AND user_id = ?2",
        params![id, user_id],
    )?;
    tracing::info!(user_id, medication_id = id, "medication deleted");
    Ok(existing)
}

pub fn set_calendar_event_ids(
    conn: &Connection,
    user_id: i64,
    id: i64,
    event_ids: &[String],
) -> MedResult<()> {
    let changed = conn.execute(
        "UPDATE medications SET calendar_event_ids = ?1 WHERE id = ?2 AND user_id = ?3",
        params![
            serde_json::to_string(event_ids).map_err(anyhow::Error::from)?,
            id,
            user_id
        ],
    )?;
    if changed == 0 {
        return Err(MedError::NotFound("medication"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 2).unwrap().and_hms_opt(7, 0, 0).unwrap()
    }

    fn setup() -> (Connection, i64) {
        let conn = db::open_memory_database().unwrap();
        let session = crate::accounts::signup(&conn, "ravi", "pw", 1).unwrap().unwrap();
        (conn, session.user.id)
    }

    fn input(name: &str, times: &[&str]) -> MedicationInput {
        MedicationInput {
            pill_name: Some(name.into()),
            dosage: Some(NumberOrText::Text("500".into())),
            frequency: Some("daily".into()),
            times: times.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn validate_normalizes_times() {
        let spec = input("Metformin", &["20:00", "8:00", "08:00", " "]).validate().unwrap();
        assert_eq!(spec.times, vec!["08:00", "20:00"]);
        assert_eq!(spec.dosage, 500);
        assert_eq!(spec.frequency, Frequency::Daily);
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let mut bad = input("Metformin", &[]);
        assert!(matches!(bad.validate(), Err(MedError::Invalid(m)) if m.contains("required")));
        bad = input("", &["08:00"]);
        assert!(bad.validate().is_err());
        bad = input("X", &["08:00"]);
        bad.dosage = Some(NumberOrText::Number(20_000));
        assert!(bad.validate().is_err());
        bad = input("X", &["8 o'clock"]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn create_and_list_are_user_scoped() {
        let (conn, user_id) = setup();
        let other = crate::accounts::signup(&conn, "mira", "pw", 1).unwrap().unwrap().user.id;

        let spec = input("Aspirin", &["09:00", "21:00"]).validate().unwrap();
        let med = create_medication(&conn, user_id, &spec, now()).unwrap();
        assert_eq!(med.times_per_day, 2);
        assert!(med.calendar_event_ids.is_empty());

        assert_eq!(list_medications(&conn, user_id).unwrap().len(), 1);
        assert!(list_medications(&conn, other).unwrap().is_empty());
        assert!(matches!(
            get_medication(&conn, other, med.id),
            Err(MedError::NotFound(_))
        ));
    }

    #[test]
    fn update_detects_schedule_change_and_clears_events() {
        let (conn, user_id) = setup();
        let spec = input("Aspirin", &["09:00"]).validate().unwrap();
        let med = create_medication(&conn, user_id, &spec, now()).unwrap();
        set_calendar_event_ids(&conn, user_id, med.id, &["evt1".into()]).unwrap();

        // rename only: events kept
        let renamed = input("Aspirin 81", &["09:00"]).validate().unwrap();
        let outcome = update_medication(&conn, user_id, med.id, &renamed, now()).unwrap();
        assert!(!outcome.schedule_changed);
        assert_eq!(outcome.medication.calendar_event_ids, vec!["evt1"]);

        let moved = input("Aspirin 81", &["10:00", "22:00"]).validate().unwrap();
        let outcome = update_medication(&conn, user_id, med.id, &moved, now()).unwrap();
        assert!(outcome.schedule_changed);
        assert_eq!(outcome.previous_event_ids, vec!["evt1"]);
        assert!(outcome.medication.calendar_event_ids.is_empty());
        assert_eq!(outcome.medication.times_per_day, 2);
    }

    #[test]
    fn schedule_change_drops_orphaned_pending_doses() {
        let (conn, user_id) = setup();
        let spec = input("Aspirin", &["08:00", "20:00"]).validate().unwrap();
        let med = create_medication(&conn, user_id, &spec, now()).unwrap();
        crate::meds::doses::materialize_day(&conn, user_id, now().date(), now()).unwrap();

        let morning_only = input("Aspirin", &["08:00"]).validate().unwrap();
        let edited_at = now() + chrono::Duration::minutes(30);
        update_medication(&conn, user_id, med.id, &morning_only, edited_at).unwrap();

        let times: Vec<String> = crate::meds::doses::day_logs(&conn, user_id, now().date())
            .unwrap()
            .into_iter()
            .map(|l| l.scheduled_time)
            .collect();
        assert_eq!(times, vec!["08:00"]);

        // Nothing left for the sweep to turn into a false miss.
        let late = now().date().and_hms_opt(20, 10, 0).unwrap();
        crate::meds::doses::log_dose(&conn, user_id, med.id, "08:00", true, late).unwrap();
        let swept = crate::meds::doses::sweep_missed(&conn, late, chrono::Duration::minutes(5)).unwrap();
        assert!(swept.is_empty());
    }

    #[test]
    fn delete_cascades_dose_logs() {
        let (conn, user_id) = setup();
        let spec = input("Aspirin", &["09:00"]).validate().unwrap();
        let med = create_medication(&conn, user_id, &spec, now()).unwrap();
        crate::meds::doses::materialize_day(&conn, user_id, now().date(), now()).unwrap();

        delete_medication(&conn, user_id, med.id).unwrap();
        let logs: i64 = conn
            .query_row("SELECT COUNT(*) FROM dose_logs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(logs, 0);
        assert!(matches!(
            delete_medication(&conn, user_id, med.id),
            Err(MedError::NotFound(_))
        ));
    }
}
