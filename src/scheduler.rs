//! Background reminder and missed-dose loop.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use chrono::Duration;
use rusqlite::Connection;
use serde::Serialize;

use crate::api::Clock;
use crate::config::SchedulerConfig;
use crate::meds::doses::sweep_missed;
use crate::notify::{send_due_reminders, PushSender, ReminderReport};

#[derive(Debug, Default, Clone, Serialize)]
pub struct TickReport {
    /// `None` when push delivery is not configured.
    pub reminders: Option<ReminderReport>,
    pub swept: usize,
}

pub struct Scheduler {
    db: Arc<Mutex<Connection>>,
    sender: Option<Arc<dyn PushSender>>,
    config: SchedulerConfig,
    clock: Clock,
}

impl Scheduler {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        sender: Option<Arc<dyn PushSender>>,
        config: SchedulerConfig,
        clock: Clock,
    ) -> Self {
        Self {
            db,
            sender,
            config,
            clock,
        }
    }

    /// Send due reminders, then mark overdue pending doses missed.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = (self.clock)();
        let mut report = TickReport::default();

        if let Some(sender) = &self.sender {
            match send_due_reminders(&self.db, sender.as_ref(), now).await {
                Ok(r) => report.reminders = Some(r),
                Err(e) => tracing::warn!(error = %e, "reminder pass failed"),
            }
        }

        let grace = Duration::minutes(self.config.missed_grace_minutes);
        let db = Arc::clone(&self.db);
        let swept = tokio::task::spawn_blocking(move || -> Result<usize> {
            let conn = db.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))?;
            Ok(sweep_missed(&conn, now, grace)?.len())
        })
        .await??;
        report.swept = swept;

        if swept > 0 {
            tracing::info!(swept, "pending doses marked missed");
        }
        Ok(report)
    }

    /// Tick every `interval_secs` until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(StdDuration::from_secs(self.config.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(interval_secs = self.config.interval_secs, push = self.sender.is_some(), "scheduler started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
        tracing::info!("scheduler stopped");
    }
}
