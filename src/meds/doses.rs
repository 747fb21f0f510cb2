//! Dose materialization, logging, and the missed-dose sweep.
//!
//! A medication's daily time list expands into one `dose_logs` row per
//! scheduled time per day. Rows start `pending`; the owner marks them
//! `taken` or `missed`, and any pending dose whose time has passed is moved
//! to `missed` automatically.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::medication::{get_medication, list_medications};
use super::types::{
    format_datetime, scheduled_at, DoseLog, DoseStatus, Frequency, Medication, TIME_FORMAT,
};
use super::{datetime_column, MedError, MedResult};

/// One row of a day's dose list, as shown on the dashboard.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DoseEntry {
    pub med_id: i64,
    pub pill_name: String,
    pub dosage: u32,
    pub time: String,
    pub status: DoseStatus,
    /// `None` only for read-only views of doses that were never materialized.
    pub dose_log_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TodayLog {
    pub id: i64,
    pub medication_name: String,
    pub scheduled_time: String,
    pub status: DoseStatus,
    pub taken_time: Option<String>,
}

/// A dose the sweep moved to `missed`.
#[derive(Debug, Clone, Serialize)]
pub struct SweptDose {
    pub dose_log_id: i64,
    pub user_id: i64,
    pub pill_name: String,
    pub scheduled_time: NaiveDateTime,
}

/// Whether `med` has doses on `day`.
///
/// Daily schedules recur every day, weekly ones on the weekday the medication
/// was added, monthly ones on the same day of month (clamped to short months).
pub fn is_scheduled_on(med: &Medication, day: NaiveDate) -> bool {
    let start = med.created_at.date();
    if day < start {
        return false;
    }
    match med.frequency {
        Frequency::Daily => true,
        Frequency::Weekly => day.weekday() == start.weekday(),
        Frequency::Monthly => day.day() == start.day().min(last_day_of_month(day)),
    }
}

/// First day on or after `from` that `med` has doses on.
pub fn next_scheduled_day(med: &Medication, from: NaiveDate) -> NaiveDate {
    let from = from.max(med.created_at.date());
    from.iter_days()
        .take(62)
        .find(|day| is_scheduled_on(med, *day))
        .unwrap_or(from)
}

fn last_day_of_month(day: NaiveDate) -> u32 {
    let (y, m) = if day.month() == 12 {
        (day.year() + 1, 1)
    } else {
        (day.year(), day.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1)
        .and_then(|first| first.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn dose_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DoseLog> {
    let status: String = row.get(4)?;
    Ok(DoseLog {
        id: row.get(0)?,
        user_id: row.get(1)?,
        medication_id: row.get(2)?,
        scheduled_time: datetime_column(row, 3)?,
        status: status
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?,
        timestamp: datetime_column(row, 5)?,
    })
}

const DOSE_COLUMNS: &str = "id, user_id, medication_id, scheduled_time, status, timestamp";

pub fn get_dose(conn: &Connection, user_id: i64, dose_id: i64) -> MedResult<DoseLog> {
    conn.query_row(
        &format!("SELECT {DOSE_COLUMNS} FROM dose_logs WHERE id = ?1 AND user_id = ?2"),
        params![dose_id, user_id],
        dose_from_row,
    )
    .optional()?
    .ok_or(MedError::NotFound("dose"))
}

fn find_dose(
    conn: &Connection,
    user_id: i64,
    medication_id: i64,
    scheduled: NaiveDateTime,
) -> MedResult<Option<DoseLog>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {DOSE_COLUMNS} FROM dose_logs \
                 WHERE user_id = ?1 AND medication_id = ?2 AND scheduled_time = ?3"
            ),
            params![user_id, medication_id, format_datetime(scheduled)],
            dose_from_row,
        )
        .optional()?)
}

/// Ensure a dose row exists for every scheduled time on `day`, auto-marking
/// overdue pending doses as missed. Entries come back sorted by time.
pub fn materialize_day(
    conn: &Connection,
    user_id: i64,
    day: NaiveDate,
    now: NaiveDateTime,
) -> MedResult<Vec<DoseEntry>> {
    let meds = list_medications(conn, user_id)?;
    let tx = conn.unchecked_transaction()?;
    let mut entries = Vec::new();

    for med in meds.iter().filter(|m| is_scheduled_on(m, day)) {
        for time in &med.times {
            let scheduled = scheduled_at(day, time).map_err(MedError::Invalid)?;
            tx.execute(
                "INSERT OR IGNORE INTO dose_logs (user_id, medication_id, scheduled_time, status, timestamp) \
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![user_id, med.id, format_datetime(scheduled), format_datetime(now)],
            )?;
            let mut dose = find_dose(&tx, user_id, med.id, scheduled)?
                .ok_or(MedError::NotFound("dose"))?;

            if dose.status == DoseStatus::Pending && scheduled < now {
                tx.execute(
                    "UPDATE dose_logs SET status = 'missed', timestamp = ?1 WHERE id = ?2",
                    params![format_datetime(now), dose.id],
                )?;
                tracing::debug!(dose_id = dose.id, medication_id = med.id, "auto-marked missed");
                dose.status = DoseStatus::Missed;
            }

            entries.push(DoseEntry {
                med_id: med.id,
                pill_name: med.pill_name.clone(),
                dosage: med.dosage,
                time: time.clone(),
                status: dose.status,
                dose_log_id: Some(dose.id),
            });
        }
    }

    tx.commit()?;
    sort_entries(&mut entries);
    Ok(entries)
}

/// Read-only view of `day`: doses never materialized read as pending.
pub fn peek_day(conn: &Connection, user_id: i64, day: NaiveDate) -> MedResult<Vec<DoseEntry>> {
    let meds = list_medications(conn, user_id)?;
    scheduled_entries(conn, user_id, &meds, day)
}

/// One entry per (medication, time) that `meds` schedule on `day`, with the
/// stored status when a row exists. Rows off the schedule are not included.
pub fn scheduled_entries(
    conn: &Connection,
    user_id: i64,
    meds: &[Medication],
    day: NaiveDate,
) -> MedResult<Vec<DoseEntry>> {
    let mut entries = Vec::new();

    for med in meds.iter().filter(|m| is_scheduled_on(m, day)) {
        for time in &med.times {
            let scheduled = scheduled_at(day, time).map_err(MedError::Invalid)?;
            let dose = find_dose(conn, user_id, med.id, scheduled)?;
            entries.push(DoseEntry {
                med_id: med.id,
                pill_name: med.pill_name.clone(),
                dosage: med.dosage,
                time: time.clone(),
                status: dose.as_ref().map_or(DoseStatus::Pending, |d| d.status),
                dose_log_id: dose.map(|d| d.id),
            });
        }
    }

    sort_entries(&mut entries);
    Ok(entries)
}

fn sort_entries(entries: &mut [DoseEntry]) {
    entries.sort_by(|a, b| a.time.cmp(&b.time).then(a.med_id.cmp(&b.med_id)));
}

/// Record today's dose of `medication_id` at `time` as taken or missed.
pub fn log_dose(
    conn: &Connection,
    user_id: i64,
    medication_id: i64,
    time: &str,
    taken: bool,
    now: NaiveDateTime,
) -> MedResult<DoseLog> {
    let med = get_medication(conn, user_id, medication_id)?;
    let scheduled = scheduled_at(now.date(), time).map_err(MedError::Invalid)?;
    let status = if taken { DoseStatus::Taken } else { DoseStatus::Missed };

    conn.execute(
        "INSERT INTO dose_logs (user_id, medication_id, scheduled_time, status, timestamp) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(user_id, medication_id, scheduled_time) \
         DO UPDATE SET status = excluded.status, timestamp = excluded.timestamp",
        params![
            user_id,
            med.id,
            format_datetime(scheduled),
            status.as_str(),
            format_datetime(now)
        ],
    )?;

    tracing::info!(user_id, medication_id, %status, "dose logged");
    find_dose(conn, user_id, med.id, scheduled)?.ok_or(MedError::NotFound("dose"))
}

/// Set a dose to `taken` or `missed`. Only `taken` refreshes the timestamp.
pub fn set_dose_status(
    conn: &Connection,
    user_id: i64,
    dose_id: i64,
    status: DoseStatus,
    now: NaiveDateTime,
) -> MedResult<DoseLog> {
    if status == DoseStatus::Pending {
        return Err(MedError::Invalid("status must be 'taken' or 'missed'".into()));
    }
    let dose = get_dose(conn, user_id, dose_id)?;

    if status == DoseStatus::Taken {
        conn.execute(
            "UPDATE dose_logs SET status = ?1, timestamp = ?2 WHERE id = ?3",
            params![status.as_str(), format_datetime(now), dose.id],
        )?;
    } else {
        conn.execute(
            "UPDATE dose_logs SET status = ?1 WHERE id = ?2",
            params![status.as_str(), dose.id],
        )?;
    }

    get_dose(conn, user_id, dose_id)
}

/// Mark a dose taken (notification action). Returns the dose and its medication name.
pub fn mark_dose_taken(
    conn: &Connection,
    user_id: i64,
    dose_id: i64,
    now: NaiveDateTime,
) -> MedResult<(DoseLog, String)> {
    let dose = set_dose_status(conn, user_id, dose_id, DoseStatus::Taken, now)?;
    let med = get_medication(conn, user_id, dose.medication_id)?;
    Ok((dose, med.pill_name))
}

/// All dose rows scheduled on `day`, in schedule order.
pub fn day_logs(conn: &Connection, user_id: i64, day: NaiveDate) -> MedResult<Vec<TodayLog>> {
    let (start, end) = day_bounds(day);
    let mut stmt = conn.prepare(
        "SELECT d.id, m.pill_name, d.scheduled_time, d.status, d.timestamp \
         FROM dose_logs d JOIN medications m ON m.id = d.medication_id \
         WHERE d.user_id = ?1 AND d.scheduled_time >= ?2 AND d.scheduled_time < ?3 \
         ORDER BY d.scheduled_time, d.id",
    )?;
    let logs = stmt
        .query_map(params![user_id, start, end], |row| {
            let scheduled = datetime_column(row, 2)?;
            let status: String = row.get(3)?;
            let status: DoseStatus = status
                .parse()
                .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?;
            let stamped = datetime_column(row, 4)?;
            Ok(TodayLog {
                id: row.get(0)?,
                medication_name: row.get(1)?,
                scheduled_time: scheduled.format(TIME_FORMAT).to_string(),
                status,
                taken_time: (status == DoseStatus::Taken)
                    .then(|| stamped.format(TIME_FORMAT).to_string()),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(logs)
}

/// `[start, end)` of `day` in storage format.
pub(crate) fn day_bounds(day: NaiveDate) -> (String, String) {
    let start = day.and_hms_opt(0, 0, 0).unwrap_or_default();
    let end = start + Duration::days(1);
    (format_datetime(start), format_datetime(end))
}

/// Delete `med`'s pending doses at or after `from` that its current schedule
/// no longer contains. Returns how many were removed.
pub fn prune_unscheduled_pending(conn: &Connection, med: &Medication, from: NaiveDateTime) -> MedResult<usize> {
    let pending = {
        let mut stmt = conn.prepare(
            "SELECT id, scheduled_time FROM dose_logs \
             WHERE user_id = ?1 AND medication_id = ?2 AND status = 'pending' AND scheduled_time >= ?3",
        )?;
        let rows = stmt
            .query_map(params![med.user_id, med.id, format_datetime(from)], |row| {
                Ok((row.get::<_, i64>(0)?, datetime_column(row, 1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut removed = 0;
    for (id, scheduled) in pending {
        let time = scheduled.format(TIME_FORMAT).to_string();
        if is_scheduled_on(med, scheduled.date()) && med.times.contains(&time) {
            continue;
        }
        removed += conn.execute("DELETE FROM dose_logs WHERE id = ?1", params![id])?;
    }
    if removed > 0 {
        tracing::info!(medication_id = med.id, removed, "pending doses dropped after schedule change");
    }
    Ok(removed)
}

/// Move every pending dose scheduled at or before `now - grace` to missed.
pub fn sweep_missed(conn: &Connection, now: NaiveDateTime, grace: Duration) -> MedResult<Vec<SweptDose>> {
    let cutoff = format_datetime(now - grace);
    let tx = conn.unchecked_transaction()?;

    let swept = {
        let mut stmt = tx.prepare(
            "SELECT d.id, d.user_id, m.pill_name, d.scheduled_time \
             FROM dose_logs d JOIN medications m ON m.id = d.medication_id \
             WHERE d.status = 'pending' AND d.scheduled_time <= ?1 ORDER BY d.scheduled_time",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| {
                Ok(SweptDose {
                    dose_log_id: row.get(0)?,
                    user_id: row.get(1)?,
                    pill_name: row.get(2)?,
                    scheduled_time: datetime_column(row, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    tx.execute(
        "UPDATE dose_logs SET status = 'missed', timestamp = ?1 \
         WHERE status = 'pending' AND scheduled_time <= ?2",
        params![format_datetime(now), cutoff],
    )?;
    tx.commit()?;

    for dose in &swept {
        tracing::info!(
            dose_id = dose.dose_log_id,
            pill = %dose.pill_name,
            scheduled = %dose.scheduled_time.format(TIME_FORMAT),
            "auto-marked as missed"
        );
    }
    Ok(swept)
}
