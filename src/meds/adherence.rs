use chrono::{Duration, NaiveDate, NaiveDateTime};
use rusqlite::Connection;
use serde::Serialize;

use super::doses::{materialize_day, peek_day, scheduled_entries, DoseEntry};
use super::medication::list_medications;
use super::types::{DoseStatus, Medication, TIME_FORMAT};
use super::MedResult;

/// How far back the streak looks.
pub const STREAK_LOOKBACK_DAYS: i64 = 30;

/// Shown when nothing else is due today.
pub const NO_NEXT_DOSE: &str = "--:--";

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub dose_data: Vec<DoseEntry>,
    pub total_doses: u32,
    pub taken_doses: u32,
    pub missed_doses: u32,
    pub pending_doses: u32,
    /// Percentage of today's doses taken, one decimal.
    pub adherence: f64,
    pub streak: u32,
    pub next_dose: String,
    pub weekly_adherence: Vec<f64>,
    pub week_days: Vec<String>,
}

/// Read-only counts for today (the dashboard poll).
#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    pub dose_data: Vec<DoseEntry>,
    pub taken_count: u32,
    pub missed_count: u32,
    pub pending_count: u32,
    pub total_doses: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DayAdherence {
    pub date: NaiveDate,
    pub label: String,
    pub expected: u32,
    pub taken: u32,
    pub percent: f64,
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// `taken / total` as a percentage with one decimal; 0 when nothing is due.
pub fn percent(taken: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        round1((taken as f64 / total as f64) * 100.0)
    }
}

fn count_status(entries: &[DoseEntry], status: DoseStatus) -> u32 {
    entries.iter().filter(|e| e.status == status).count() as u32
}

/// Build the dashboard for `now`, materializing today's doses first.
pub fn dashboard(conn: &Connection, user_id: i64, now: NaiveDateTime) -> MedResult<Dashboard> {
    let today = now.date();
    let dose_data = materialize_day(conn, user_id, today, now)?;
    let meds = list_medications(conn, user_id)?;

    let total = dose_data.len() as u32;
    let taken = count_status(&dose_data, DoseStatus::Taken);
    let missed = count_status(&dose_data, DoseStatus::Missed);
    let pending = count_status(&dose_data, DoseStatus::Pending);

    let now_hm = now.format(TIME_FORMAT).to_string();
    let next_dose = dose_data
        .iter()
        .find(|d| d.status == DoseStatus::Pending && d.time > now_hm)
        .map(|d| d.time.clone())
        .unwrap_or_else(|| NO_NEXT_DOSE.to_string());

    let week = weekly_adherence(conn, user_id, &meds, today)?;

    Ok(Dashboard {
        total_doses: total,
        taken_doses: taken,
        missed_doses: missed,
        pending_doses: pending,
        adherence: percent(taken, total),
        streak: streak(conn, user_id, &meds, today)?,
        next_dose,
        weekly_adherence: week.iter().map(|d| d.percent).collect(),
        week_days: week.into_iter().map(|d| d.label).collect(),
        dose_data,
    })
}

pub fn dashboard_data(conn: &Connection, user_id: i64, today: NaiveDate) -> MedResult<DashboardData> {
    let dose_data = peek_day(conn, user_id, today)?;
    Ok(DashboardData {
        taken_count: count_status(&dose_data, DoseStatus::Taken),
        missed_count: count_status(&dose_data, DoseStatus::Missed),
        pending_count: count_status(&dose_data, DoseStatus::Pending),
        total_doses: dose_data.len() as u32,
        dose_data,
    })
}

/// Adherence for the seven days ending `today`, oldest first.
///
/// Only doses on the current schedule count; stray rows left by an older
/// schedule or logged at an unscheduled time are ignored.
pub fn weekly_adherence(
    conn: &Connection,
    user_id: i64,
    meds: &[Medication],
    today: NaiveDate,
) -> MedResult<Vec<DayAdherence>> {
    (0..7)
        .rev()
        .map(|offset| -> MedResult<DayAdherence> {
            let date = today - Duration::days(offset);
            let entries = scheduled_entries(conn, user_id, meds, date)?;
            let expected = entries.len() as u32;
            let taken = count_status(&entries, DoseStatus::Taken);
            Ok(DayAdherence {
                date,
                label: date.format("%a").to_string(),
                expected,
                taken,
                percent: percent(taken, expected),
            })
        })
        .collect()
}

/// Consecutive fully-taken days ending today (or yesterday, while today is
/// still in progress).
///
/// A day counts only when every scheduled dose on it was taken. Days with
/// nothing scheduled neither extend nor break the streak. A missed dose
/// today resets it to zero.
pub fn streak(
    conn: &Connection,
    user_id: i64,
    meds: &[Medication],
    today: NaiveDate,
) -> MedResult<u32> {
    let Some(first_day) = meds.iter().map(|m| m.created_at.date()).min() else {
        return Ok(0);
    };

    let mut streak = 0;
    for offset in 0..STREAK_LOOKBACK_DAYS {
        let day = today - Duration::days(offset);
        if day < first_day {
            break;
        }
        let entries = scheduled_entries(conn, user_id, meds, day)?;
        if entries.is_empty() {
            continue;
        }
        if entries.iter().all(|e| e.status == DoseStatus::Taken) {
            streak += 1;
            continue;
        }
        if offset == 0 && !entries.iter().any(|e| e.status == DoseStatus::Missed) {
            // today is still open
            continue;
        }
        break;
    }
    Ok(streak)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_rounds_and_handles_zero() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(1, 3), 33.3);
        assert_eq!(percent(2, 3), 66.7);
        assert_eq!(percent(4, 4), 100.0);
    }
}
