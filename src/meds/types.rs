//! Core medication type definitions.
//!
//! Defines [`Frequency`] (how often a schedule recurs), [`DoseStatus`] (the
//! pending → taken/missed lifecycle), [`Medication`] and [`DoseLog`] records,
//! and the `HH:MM` time helpers shared by the schedule code.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Storage format for scheduled dose instants (lexically sortable).
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
/// Format of a daily dose time.
pub const TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Frequency {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "MONTHLY" => Ok(Self::Monthly),
            _ => Err(format!("unknown frequency: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoseStatus {
    Pending,
    Taken,
    Missed,
}

impl DoseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Taken => "taken",
            Self::Missed => "missed",
        }
    }
}

impl std::fmt::Display for DoseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DoseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "taken" => Ok(Self::Taken),
            "missed" => Ok(Self::Missed),
            _ => Err(format!("unknown dose status: {s}")),
        }
    }
}

/// A medication record, matching the `medications` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Medication {
    pub id: i64,
    pub user_id: i64,
    pub pill_name: String,
    /// Milligrams per dose.
    pub dosage: u32,
    pub frequency: Frequency,
    pub times_per_day: u32,
    /// Sorted, distinct `HH:MM` strings.
    pub times: Vec<String>,
    /// Recurring calendar events created for this schedule.
    pub calendar_event_ids: Vec<String>,
    pub created_at: NaiveDateTime,
}

/// One scheduled administration, matching the `dose_logs` table.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DoseLog {
    pub id: i64,
    pub user_id: i64,
    pub medication_id: i64,
    pub scheduled_time: NaiveDateTime,
    pub status: DoseStatus,
    /// Last time the row changed state.
    pub timestamp: NaiveDateTime,
}

/// Parse a `HH:MM` dose time. Accepts a single-digit hour ("8:05").
pub fn parse_dose_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s.trim(), TIME_FORMAT)
        .map_err(|_| format!("invalid time '{s}', expected HH:MM"))
}

pub fn format_dose_time(t: NaiveTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Combine a day and a `HH:MM` time into the scheduled instant.
pub fn scheduled_at(day: NaiveDate, time: &str) -> Result<NaiveDateTime, String> {
    Ok(day.and_time(parse_dose_time(time)?))
}

pub fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

pub fn parse_datetime(s: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
}
