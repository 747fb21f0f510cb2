mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use medimimes::meds::types::Frequency;
use medimimes::notify::{
    due_reminders, save_subscription, send_due_reminders, subscriptions_for, PushSender, PushSubscription,
};

use helpers::*;

#[test]
fn due_reminders_match_the_current_minute() {
    let conn = test_db();
    let user = create_user(&conn, "asha");
    add_med(&conn, user.id, "Metformin", Frequency::Daily, &["08:00", "20:00"], at(2025, 3, 1, 7, 0));
    // Weekly on Saturdays; 2025-03-03 is a Monday.
    add_med(&conn, user.id, "Vitamin D", Frequency::Weekly, &["08:00"], at(2025, 3, 1, 7, 0));

    let due = due_reminders(&conn, at(2025, 3, 3, 8, 0)).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].pill_name, "Metformin");
    assert_eq!(due[0].time, "08:00");
    assert_eq!(due[0].body(), "Time to take Metformin (500 mg)");

    assert!(due_reminders(&conn, at(2025, 3, 3, 8, 1)).unwrap().is_empty());
}

#[test]
fn resubscribing_updates_keys() {
    let conn = test_db();
    let user = create_user(&conn, "asha");
    let now = at(2025, 3, 3, 8, 0);
    save_subscription(&conn, user.id, "https://push.example/a", "k1", "a1", now).unwrap();
    save_subscription(&conn, user.id, "https://push.example/a", "k2", "a2", now).unwrap();

    let subs = subscriptions_for(&conn, user.id).unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].p256dh, "k2");
    assert_eq!(subs[0].auth, "a2");
}

#[tokio::test]
async fn reminder_is_sent_once_via_first_working_subscription() {
    let conn = test_db();
    let user = create_user(&conn, "asha");
    add_med(&conn, user.id, "Metformin", Frequency::Daily, &["08:00"], at(2025, 3, 1, 7, 0));
    let now = at(2025, 3, 3, 8, 0);
    save_subscription(&conn, user.id, "https://push.example/dead", "k", "a", now).unwrap();
    save_subscription(&conn, user.id, "https://push.example/nokeys", "", "", now).unwrap();
    save_subscription(&conn, user.id, "https://push.example/live", "k", "a", now).unwrap();
    save_subscription(&conn, user.id, "https://push.example/spare", "k", "a", now).unwrap();

    let db = Arc::new(Mutex::new(conn));
    let sender = FakeSender::failing(&["https://push.example/dead"]);

    let report = send_due_reminders(&db, &sender, now).await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(report.undelivered, 0);
    {
        let delivered = sender.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "https://push.example/live");
        assert_eq!(delivered[0].1["title"], "Medicine Reminder");
        assert_eq!(delivered[0].1["body"], "Time to take Metformin (500 mg)");
    }

    // Same minute again: already logged.
    let again = send_due_reminders(&db, &sender, now).await.unwrap();
    assert_eq!(again.due, 0);
    assert_eq!(sender.delivered.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn undelivered_reminder_is_retried_next_tick() {
    let conn = test_db();
    let user = create_user(&conn, "asha");
    add_med(&conn, user.id, "Metformin", Frequency::Daily, &["08:00"], at(2025, 3, 1, 7, 0));
    let now = at(2025, 3, 3, 8, 0);
    save_subscription(&conn, user.id, "https://push.example/dead", "k", "a", now).unwrap();
    let db = Arc::new(Mutex::new(conn));

    let broken = FakeSender::failing(&["https://push.example/dead"]);
    let report = send_due_reminders(&db, &broken, now).await.unwrap();
    assert_eq!(report.undelivered, 1);
    assert_eq!(report.sent, 0);

    let working = FakeSender::default();
    let report = send_due_reminders(&db, &working, now).await.unwrap();
    assert_eq!(report.sent, 1);
}

/// Delivers, then keeps the database locked on another thread for `hold`.
struct LockingSender {
    db: Arc<Mutex<rusqlite::Connection>>,
    hold: Duration,
}

#[async_trait]
impl PushSender for LockingSender {
    async fn send(&self, _subscription: &PushSubscription, _payload: &[u8]) -> anyhow::Result<()> {
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let db = Arc::clone(&self.db);
        let hold = self.hold;
        std::thread::spawn(move || {
            let _guard = db.lock().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(hold);
        });
        locked_rx.recv()?;
        Ok(())
    }
}

#[tokio::test(flavor = "current_thread")]
async fn recording_a_sent_reminder_waits_off_the_runtime() {
    let conn = test_db();
    let user = create_user(&conn, "asha");
    add_med(&conn, user.id, "Metformin", Frequency::Daily, &["08:00"], at(2025, 3, 1, 7, 0));
    let now = at(2025, 3, 3, 8, 0);
    save_subscription(&conn, user.id, "https://push.example/live", "k", "a", now).unwrap();
    let db = Arc::new(Mutex::new(conn));

    let ticks = Arc::new(AtomicUsize::new(0));
    let heartbeat = {
        let ticks = Arc::clone(&ticks);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    let sender = LockingSender {
        db: Arc::clone(&db),
        hold: Duration::from_millis(300),
    };
    let report = send_due_reminders(&db, &sender, now).await.unwrap();
    heartbeat.abort();

    assert_eq!(report.sent, 1);
    // The single runtime thread kept running other tasks while the lock was held.
    assert!(ticks.load(Ordering::SeqCst) >= 5, "ticks = {}", ticks.load(Ordering::SeqCst));
}
