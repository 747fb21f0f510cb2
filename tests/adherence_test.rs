mod helpers;

use medimimes::meds::adherence::{dashboard, dashboard_data, streak, weekly_adherence, NO_NEXT_DOSE};
use medimimes::meds::doses::{log_dose, materialize_day};
use medimimes::meds::medication::list_medications;
use medimimes::meds::types::{DoseStatus, Frequency};

use helpers::*;

#[test]
fn empty_dashboard() {
    let conn = test_db();
    let user = create_user(&conn, "asha");
    let dash = dashboard(&conn, user.id, at(2025, 3, 3, 9, 0)).unwrap();
    assert_eq!(dash.total_doses, 0);
    assert_eq!(dash.adherence, 0.0);
    assert_eq!(dash.streak, 0);
    assert_eq!(dash.next_dose, NO_NEXT_DOSE);
    assert_eq!(dash.weekly_adherence, vec![0.0; 7]);
    assert_eq!(dash.week_days.len(), 7);
}

#[test]
fn dashboard_counts_and_next_dose() {
    let conn = test_db();
    let user = create_user(&conn, "asha");
    let med = add_med(
        &conn,
        user.id,
        "Metformin",
        Frequency::Daily,
        &["08:00", "13:00", "21:00"],
        at(2025, 3, 1, 7, 0),
    );
    let now = at(2025, 3, 3, 12, 0);
    log_dose(&conn, user.id, med.id, "08:00", true, now).unwrap();

    let dash = dashboard(&conn, user.id, now).unwrap();
    assert_eq!(dash.total_doses, 3);
    assert_eq!(dash.taken_doses, 1);
    assert_eq!(dash.missed_doses, 0);
    assert_eq!(dash.pending_doses, 2);
    assert_eq!(dash.adherence, 33.3);
    assert_eq!(dash.next_dose, "13:00");
    // 2025-03-03 is a Monday; the chart ends today.
    assert_eq!(dash.week_days.last().map(String::as_str), Some("Mon"));
    assert_eq!(dash.week_days.first().map(String::as_str), Some("Tue"));
    assert_eq!(dash.weekly_adherence[6], 33.3);

    let data = dashboard_data(&conn, user.id, now.date()).unwrap();
    assert_eq!(data.total_doses, 3);
    assert_eq!(data.taken_count, 1);
    assert_eq!(data.pending_count, 2);
}

#[test]
fn weekly_chart_ignores_days_before_creation() {
    let conn = test_db();
    let user = create_user(&conn, "asha");
    let med = add_med(&conn, user.id, "Aspirin", Frequency::Daily, &["08:00"], at(2025, 3, 2, 7, 0));
    log_dose(&conn, user.id, med.id, "08:00", true, at(2025, 3, 2, 8, 0)).unwrap();

    let meds = list_medications(&conn, user.id).unwrap();
    let week = weekly_adherence(&conn, user.id, &meds, at(2025, 3, 3, 0, 0).date()).unwrap();
    assert_eq!(week.len(), 7);
    assert!(week[..5].iter().all(|d| d.expected == 0 && d.percent == 0.0));
    assert_eq!(week[5].percent, 100.0);
    assert_eq!(week[6].expected, 1);
    assert_eq!(week[6].taken, 0);
}

#[test]
fn streak_counts_complete_days_and_skips_open_today() {
    let conn = test_db();
    let user = create_user(&conn, "asha");
    let med = add_med(&conn, user.id, "Aspirin", Frequency::Daily, &["08:00"], at(2025, 3, 1, 7, 0));
    for day in 1..=3 {
        log_dose(&conn, user.id, med.id, "08:00", true, at(2025, 3, day, 8, 0)).unwrap();
    }
    let meds = list_medications(&conn, user.id).unwrap();

    // Today (the 4th) has nothing logged yet: the streak still stands.
    let today = at(2025, 3, 4, 0, 0).date();
    assert_eq!(streak(&conn, user.id, &meds, today).unwrap(), 3);

    // Taking today's dose extends it.
    log_dose(&conn, user.id, med.id, "08:00", true, at(2025, 3, 4, 8, 1)).unwrap();
    assert_eq!(streak(&conn, user.id, &meds, today).unwrap(), 4);
}

#[test]
fn missed_dose_breaks_streak() {
    let conn = test_db();
    let user = create_user(&conn, "asha");
    let med = add_med(&conn, user.id, "Aspirin", Frequency::Daily, &["08:00"], at(2025, 3, 1, 7, 0));
    log_dose(&conn, user.id, med.id, "08:00", true, at(2025, 3, 1, 8, 0)).unwrap();
    log_dose(&conn, user.id, med.id, "08:00", false, at(2025, 3, 2, 8, 0)).unwrap();
    log_dose(&conn, user.id, med.id, "08:00", true, at(2025, 3, 3, 8, 0)).unwrap();
    let meds = list_medications(&conn, user.id).unwrap();
    assert_eq!(streak(&conn, user.id, &meds, at(2025, 3, 3, 0, 0).date()).unwrap(), 1);

    // A missed dose today resets the streak to zero.
    let now = at(2025, 3, 4, 9, 0);
    let entries = materialize_day(&conn, user.id, now.date(), now).unwrap();
    assert_eq!(entries[0].status, DoseStatus::Missed);
    assert_eq!(streak(&conn, user.id, &meds, now.date()).unwrap(), 0);
}

#[test]
fn off_schedule_logs_do_not_complete_a_day() {
    let conn = test_db();
    let user = create_user(&conn, "asha");
    let a = add_med(&conn, user.id, "Aspirin", Frequency::Daily, &["08:00"], at(2025, 3, 1, 7, 0));
    add_med(&conn, user.id, "Metformin", Frequency::Daily, &["08:00"], at(2025, 3, 1, 7, 0));

    // Aspirin twice (once off schedule), Metformin never.
    log_dose(&conn, user.id, a.id, "08:00", true, at(2025, 3, 2, 8, 0)).unwrap();
    log_dose(&conn, user.id, a.id, "09:00", true, at(2025, 3, 2, 9, 0)).unwrap();

    let meds = list_medications(&conn, user.id).unwrap();
    assert_eq!(streak(&conn, user.id, &meds, at(2025, 3, 2, 0, 0).date()).unwrap(), 0);
    assert_eq!(streak(&conn, user.id, &meds, at(2025, 3, 3, 0, 0).date()).unwrap(), 0);

    let week = weekly_adherence(&conn, user.id, &meds, at(2025, 3, 2, 0, 0).date()).unwrap();
    assert_eq!(week[6].expected, 2);
    assert_eq!(week[6].taken, 1);
    assert_eq!(week[6].percent, 50.0);
}

#[test]
fn weekly_medication_streak_skips_unscheduled_days() {
    let conn = test_db();
    let user = create_user(&conn, "asha");
    // 2025-03-03 is a Monday.
    let med = add_med(&conn, user.id, "Vitamin D", Frequency::Weekly, &["09:00"], at(2025, 3, 3, 7, 0));
    for day in [3, 10, 17] {
        log_dose(&conn, user.id, med.id, "09:00", true, at(2025, 3, day, 9, 0)).unwrap();
    }
    let meds = list_medications(&conn, user.id).unwrap();

    // Thursday after the third Monday: the empty days in between are neutral.
    assert_eq!(streak(&conn, user.id, &meds, at(2025, 3, 20, 0, 0).date()).unwrap(), 3);

    let week = weekly_adherence(&conn, user.id, &meds, at(2025, 3, 20, 0, 0).date()).unwrap();
    let scheduled: Vec<_> = week.iter().filter(|d| d.expected > 0).collect();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].label, "Mon");
    assert_eq!(scheduled[0].percent, 100.0);
}

#[test]
fn streak_is_capped_by_the_lookback_window() {
    let conn = test_db();
    let user = create_user(&conn, "asha");
    let start = at(2025, 1, 1, 7, 0);
    let med = add_med(&conn, user.id, "Aspirin", Frequency::Daily, &["08:00"], start);
    for offset in 0..40 {
        let day = start.date() + chrono::Duration::days(offset);
        let taken_at = day.and_hms_opt(8, 0, 0).unwrap();
        log_dose(&conn, user.id, med.id, "08:00", true, taken_at).unwrap();
    }
    let meds = list_medications(&conn, user.id).unwrap();
    let today = start.date() + chrono::Duration::days(39);
    assert_eq!(
        streak(&conn, user.id, &meds, today).unwrap(),
        medimimes::meds::adherence::STREAK_LOOKBACK_DAYS as u32
    );
}
