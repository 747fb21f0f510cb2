//! Browser push reminders.
//!
//! Once a minute the scheduler asks for [`due_reminders`]: medications with a
//! dose time equal to the current `HH:MM`, scheduled today, and not yet
//! reminded for that (medication, date, time). Each reminder goes to the
//! owner's subscriptions in turn until one delivery succeeds. Only a
//! delivered reminder is written to `notification_logs`, which makes the
//! send at-most-once per (medication, date, time).

pub mod sender;

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::meds::doses::is_scheduled_on;
use crate::meds::medication::list_all_medications;
use crate::meds::types::{format_datetime, TIME_FORMAT};
pub use sender::{PushSender, WebPushSender};

pub const REMINDER_TITLE: &str = "Medicine Reminder";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushSubscription {
    pub id: i64,
    pub user_id: i64,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

impl PushSubscription {
    /// Encryption needs both client keys.
    pub fn has_keys(&self) -> bool {
        !self.p256dh.is_empty() && !self.auth.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DueReminder {
    pub medication_id: i64,
    pub user_id: i64,
    pub pill_name: String,
    pub dosage: u32,
    pub date: NaiveDate,
    pub time: String,
}

impl DueReminder {
    pub fn body(&self) -> String {
        format!("Time to take {} ({} mg)", self.pill_name, self.dosage)
    }

    pub fn payload(&self) -> ReminderPayload {
        ReminderPayload {
            title: REMINDER_TITLE.to_string(),
            body: self.body(),
            medication_id: self.medication_id,
            time: self.time.clone(),
        }
    }
}

/// JSON delivered to the service worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReminderPayload {
    pub title: String,
    pub body: String,
    pub medication_id: i64,
    pub time: String,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct ReminderReport {
    pub due: usize,
    pub sent: usize,
    /// Reminders where no subscription accepted the message.
    pub undelivered: usize,
}

/// Insert or refresh a subscription. The same endpoint for the same user
/// updates its keys in place.
pub fn save_subscription(
    conn: &Connection,
    user_id: i64,
    endpoint: &str,
    p256dh: &str,
    auth: &str,
    now: NaiveDateTime,
) -> Result<()> {
    anyhow::ensure!(!endpoint.trim().is_empty(), "subscription endpoint is required");
    conn.execute(
        "INSERT INTO push_subscriptions (user_id, endpoint, p256dh, auth, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(user_id, endpoint) DO UPDATE SET p256dh = excluded.p256dh, auth = excluded.auth",
        params![user_id, endpoint.trim(), p256dh, auth, format_datetime(now)],
    )
    .context("failed to save push subscription")?;
    Ok(())
}

pub fn subscriptions_for(conn: &Connection, user_id: i64) -> Result<Vec<PushSubscription>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, endpoint, p256dh, auth FROM push_subscriptions \
         WHERE user_id = ?1 ORDER BY id",
    )?;
    let subs = stmt
        .query_map(params![user_id], |row| {
            Ok(PushSubscription {
                id: row.get(0)?,
                user_id: row.get(1)?,
                endpoint: row.get(2)?,
                p256dh: row.get(3)?,
                auth: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(subs)
}

fn already_notified(conn: &Connection, medication_id: i64, date: NaiveDate, time: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM notification_logs \
         WHERE medication_id = ?1 AND sent_date = ?2 AND sent_time = ?3",
        params![medication_id, date.to_string(), time],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Reminders that should go out at `now`'s minute.
pub fn due_reminders(conn: &Connection, now: NaiveDateTime) -> Result<Vec<DueReminder>> {
    let today = now.date();
    let minute = now.format(TIME_FORMAT).to_string();
    let mut due = Vec::new();

    for med in list_all_medications(conn)? {
        if !is_scheduled_on(&med, today) || !med.times.contains(&minute) {
            continue;
        }
        if already_notified(conn, med.id, today, &minute)? {
            continue;
        }
        due.push(DueReminder {
            medication_id: med.id,
            user_id: med.user_id,
            pill_name: med.pill_name,
            dosage: med.dosage,
            date: today,
            time: minute.clone(),
        });
    }
    Ok(due)
}

/// Record a delivered reminder. Returns `false` if it was already recorded.
pub fn record_notification(conn: &Connection, reminder: &DueReminder, now: NaiveDateTime) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO notification_logs (medication_id, sent_date, sent_time, sent_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![
            reminder.medication_id,
            reminder.date.to_string(),
            reminder.time,
            format_datetime(now)
        ],
    )?;
    Ok(inserted > 0)
}

/// Send every due reminder through `sender`.
pub async fn send_due_reminders(
    db: &Arc<Mutex<Connection>>,
    sender: &dyn PushSender,
    now: NaiveDateTime,
) -> Result<ReminderReport> {
    let pending = {
        let db = Arc::clone(db);
        tokio::task::spawn_blocking(move || -> Result<Vec<(DueReminder, Vec<PushSubscription>)>> {
            let conn = db.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))?;
            due_reminders(&conn, now)?
                .into_iter()
                .map(|r| -> Result<(DueReminder, Vec<PushSubscription>)> {
                    let subs = subscriptions_for(&conn, r.user_id)?;
                    Ok((r, subs))
                })
                .collect()
        })
        .await??
    };

    let mut report = ReminderReport {
        due: pending.len(),
        ..Default::default()
    };

    for (reminder, subs) in pending {
        let payload = serde_json::to_vec(&reminder.payload())?;
        let mut delivered = false;
        for sub in subs.iter().filter(|s| s.has_keys()) {
            match sender.send(sub, &payload).await {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, subscription = sub.id, medication = reminder.medication_id, "push attempt failed");
                }
            }
        }

        if !delivered {
            tracing::warn!(medication = reminder.medication_id, user = reminder.user_id, "reminder not delivered");
            report.undelivered += 1;
            continue;
        }

        {
            let db = Arc::clone(db);
            let sent = reminder.clone();
            tokio::task::spawn_blocking(move || -> Result<bool> {
                let conn = db.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))?;
                record_notification(&conn, &sent, now)
            })
            .await??;
        }
        tracing::info!(medication = reminder.medication_id, user = reminder.user_id, time = %reminder.time, "reminder sent");
        report.sent += 1;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reminder_text_matches_dose() {
        let r = DueReminder {
            medication_id: 1,
            user_id: 1,
            pill_name: "Metformin".into(),
            dosage: 500,
            date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            time: "08:00".into(),
        };
        assert_eq!(r.body(), "Time to take Metformin (500 mg)");
        let json = serde_json::to_value(r.payload()).unwrap();
        assert_eq!(json["title"], "Medicine Reminder");
    }

    #[test]
    fn subscription_without_keys_is_skipped() {
        let sub = PushSubscription {
            id: 1,
            user_id: 1,
            endpoint: "https://push.example/1".into(),
            p256dh: String::new(),
            auth: "a".into(),
        };
        assert!(!sub.has_keys());
    }
}
