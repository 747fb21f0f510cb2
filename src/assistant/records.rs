//! Plain-language answers about the requesting user's own records.
//!
//! Every query binds the caller's user id; nothing here accepts a user id
//! from the message text.

use chrono::{Duration, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};

use crate::meds::doses::is_scheduled_on;
use crate::meds::medication::list_medications;
use crate::meds::types::{format_datetime, scheduled_at, DoseStatus};
use crate::meds::{datetime_column, MedResult};

const UPCOMING_LIMIT: usize = 5;
const HISTORY_LIMIT: usize = 8;
const UPCOMING_HORIZON_DAYS: i64 = 31;
const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M";

pub const HELP_TEXT: &str = "I can help you with:\n\
• 'My medications' - see what you're taking\n\
• 'My last dose' - when you last took medication\n\
• 'Missed doses' - check any missed medications\n\
• 'My schedule' - upcoming dose times\n\
• 'Dose history' - your medication history\n\
What would you like to know about your medications?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordQuery {
    LastDose,
    Medications,
    Missed,
    Upcoming,
    History,
    Help,
}

/// Map a question to the record lookup it asks for. Checked in order, so
/// "when was my last dose" is a last-dose question even though it says "my".
pub fn classify(question: &str) -> RecordQuery {
    let q = question.to_lowercase();
    let has = |phrases: &[&str]| phrases.iter().any(|p| q.contains(p));

    if has(&["last dose", "when was", "last taken", "last time i took"]) {
        RecordQuery::LastDose
    } else if has(&["my medication", "my medicine", "my meds", "my prescription", "am i taking", "my pills"]) {
        RecordQuery::Medications
    } else if has(&["missed", "forgot", "forget", "skipped"]) {
        RecordQuery::Missed
    } else if has(&["schedule", "next dose", "upcoming"]) {
        RecordQuery::Upcoming
    } else if has(&["history", "log"]) {
        RecordQuery::History
    } else {
        RecordQuery::Help
    }
}

fn display(dt: NaiveDateTime) -> String {
    dt.format(DISPLAY_FORMAT).to_string()
}

/// Answer `question` from `user_id`'s data as of `now`.
pub fn answer(conn: &Connection, user_id: i64, question: &str, now: NaiveDateTime) -> MedResult<String> {
    match classify(question) {
        RecordQuery::LastDose => last_dose(conn, user_id),
        RecordQuery::Medications => medications(conn, user_id),
        RecordQuery::Missed => missed(conn, user_id),
        RecordQuery::Upcoming => upcoming(conn, user_id, now),
        RecordQuery::History => history(conn, user_id),
        RecordQuery::Help => Ok(HELP_TEXT.to_string()),
    }
}

fn last_dose(conn: &Connection, user_id: i64) -> MedResult<String> {
    let row = conn
        .query_row(
            "SELECT m.pill_name, m.dosage, d.scheduled_time, d.timestamp, d.status \
             FROM dose_logs d JOIN medications m ON m.id = d.medication_id \
             WHERE d.user_id = ?1 AND d.status = 'taken' \
             ORDER BY d.timestamp DESC LIMIT 1",
            params![user_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    datetime_column(row, 2)?,
                    datetime_column(row, 3)?,
                ))
            },
        )
        .optional()?;

    Ok(match row {
        Some((name, dosage, scheduled, taken_at)) => format!(
            "Your last dose: {name} ({dosage} mg), taken at {} (scheduled {}).",
            display(taken_at),
            display(scheduled)
        ),
        None => "You haven't logged any doses as taken yet.".to_string(),
    })
}

fn medications(conn: &Connection, user_id: i64) -> MedResult<String> {
    let meds = list_medications(conn, user_id)?;
    if meds.is_empty() {
        return Ok("You don't have any medications yet.".to_string());
    }
    let lines: Vec<String> = meds
        .iter()
        .map(|m| {
            format!(
                "• {} - {} mg, {}, {}x/day at {}",
                m.pill_name,
                m.dosage,
                m.frequency,
                m.times_per_day,
                m.times.join(", ")
            )
        })
        .collect();
    Ok(format!("Your current medications:\n{}", lines.join("\n")))
}

fn missed(conn: &Connection, user_id: i64) -> MedResult<String> {
    let mut stmt = conn.prepare(
        "SELECT m.pill_name, COUNT(*) FROM dose_logs d \
         JOIN medications m ON m.id = d.medication_id \
         WHERE d.user_id = ?1 AND d.status = 'missed' \
         GROUP BY m.id, m.pill_name ORDER BY COUNT(*) DESC, m.pill_name",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    if rows.is_empty() {
        return Ok("Great news: you have no missed doses on record.".to_string());
    }
    let total: i64 = rows.iter().map(|(_, n)| n).sum();
    let lines: Vec<String> = rows
        .iter()
        .map(|(name, n)| format!("• {name}: {n} missed"))
        .collect();
    Ok(format!("Your missed doses ({total} total):\n{}", lines.join("\n")))
}

fn upcoming(conn: &Connection, user_id: i64, now: NaiveDateTime) -> MedResult<String> {
    let meds = list_medications(conn, user_id)?;
    let mut upcoming: Vec<(NaiveDateTime, i64, &str, u32)> = Vec::new();

    for offset in 0..UPCOMING_HORIZON_DAYS {
        let day = now.date() + Duration::days(offset);
        for med in meds.iter().filter(|m| is_scheduled_on(m, day)) {
            for time in &med.times {
                let Ok(at) = scheduled_at(day, time) else { continue };
                if at > now {
                    upcoming.push((at, med.id, med.pill_name.as_str(), med.dosage));
                }
            }
        }
        if upcoming.len() >= UPCOMING_LIMIT {
            break;
        }
    }
    upcoming.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.2.cmp(b.2)));
    upcoming.truncate(UPCOMING_LIMIT);

    if upcoming.is_empty() {
        return Ok("You have no upcoming doses scheduled.".to_string());
    }

    // a dose already handled ahead of time shows its status
    let mut lines = Vec::with_capacity(upcoming.len());
    for (at, med_id, name, dosage) in upcoming {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM dose_logs \
                 WHERE user_id = ?1 AND medication_id = ?2 AND scheduled_time = ?3",
                params![user_id, med_id, format_datetime(at)],
                |row| row.get(0),
            )
            .optional()?;
        let suffix = match status.as_deref() {
            Some(s) if s != DoseStatus::Pending.as_str() => format!(" [{s}]"),
            _ => String::new(),
        };
        lines.push(format!("• {} - {name} ({dosage} mg){suffix}", display(at)));
    }
    Ok(format!("Your upcoming doses:\n{}", lines.join("\n")))
}

fn history(conn: &Connection, user_id: i64) -> MedResult<String> {
    let mut stmt = conn.prepare(
        "SELECT m.pill_name, d.scheduled_time, d.status FROM dose_logs d \
         JOIN medications m ON m.id = d.medication_id \
         WHERE d.user_id = ?1 AND d.status != 'pending' \
         ORDER BY d.scheduled_time DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![user_id, HISTORY_LIMIT as i64], |row| {
            Ok((row.get::<_, String>(0)?, datetime_column(row, 1)?, row.get::<_, String>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if rows.is_empty() {
        return Ok("No dose history yet.".to_string());
    }
    let lines: Vec<String> = rows
        .iter()
        .map(|(name, at, status)| format!("• {} - {name}: {status}", display(*at)))
        .collect();
    Ok(format!("Your dose history:\n{}", lines.join("\n")))
}
