//! CLI `report` and `check-missed` commands.

use anyhow::{bail, Result};
use chrono::Duration;

use crate::accounts;
use crate::config::MediConfig;
use crate::db;
use crate::meds::adherence;
use crate::meds::doses::sweep_missed;
use crate::meds::types::TIME_FORMAT;

/// Mark overdue pending doses missed, once.
pub fn check_missed(config: &MediConfig) -> Result<()> {
    let conn = db::open_database(config.resolved_db_path())?;
    let now = chrono::Local::now().naive_local();
    let grace = Duration::minutes(config.scheduler.missed_grace_minutes);

    let swept = sweep_missed(&conn, now, grace)?;
    if swept.is_empty() {
        println!("No overdue doses.");
        return Ok(());
    }
    for dose in &swept {
        println!(
            "  missed: {} at {} (user {})",
            dose.pill_name,
            dose.scheduled_time.format(TIME_FORMAT),
            dose.user_id
        );
    }
    println!("Marked {} dose(s) as missed.", swept.len());
    Ok(())
}

/// Print database totals, or one user's dashboard when `username` is given.
pub fn report(config: &MediConfig, username: Option<&str>) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path)?;

    let Some(username) = username else {
        let summary = db::summarize(&conn)?;
        println!("MediMimes Database");
        println!("{}", "=".repeat(40));
        println!("  Path:              {}", db_path.display());
        println!("  Schema version:    {}", summary.schema_version);
        println!("  Users:             {}", summary.users);
        println!("  Medications:       {}", summary.medications);
        println!("  Dose logs:         {}", summary.dose_logs);
        println!("  Knowledge chunks:  {}", summary.knowledge_chunks);
        if let Some(model) = db::migrations::get_embedding_model(&conn)? {
            println!("  Embedding model:   {model}");
        }
        return Ok(());
    };

    let Some(user) = accounts::find_user(&conn, username)? else {
        bail!("no user named '{username}'");
    };
    let now = chrono::Local::now().naive_local();
    let dash = adherence::dashboard(&conn, user.id, now)?;

    println!("Adherence for {} on {}", user.username, now.date());
    println!("{}", "=".repeat(40));
    println!("  Doses today:   {}", dash.total_doses);
    println!("  Taken:         {}", dash.taken_doses);
    println!("  Missed:        {}", dash.missed_doses);
    println!("  Pending:       {}", dash.pending_doses);
    println!("  Adherence:     {:.1}%", dash.adherence);
    println!("  Streak:        {} day(s)", dash.streak);
    println!("  Next dose:     {}", dash.next_dose);
    println!();
    println!("Last 7 days:");
    for (label, pct) in dash.week_days.iter().zip(&dash.weekly_adherence) {
        println!("  {label:<4} {pct:>5.1}%");
    }
    println!();
    for entry in &dash.dose_data {
        println!("  {}  {:<20} {:>6} mg  {}", entry.time, entry.pill_name, entry.dosage, entry.status);
    }
    Ok(())
}
