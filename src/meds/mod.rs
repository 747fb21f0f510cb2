//! Medication schedules, dose tracking, and adherence.
//!
//! - [`types`]: records and enums shared across the module
//! - [`medication`]: create / list / update / delete medications
//! - [`doses`]: materializing a day's doses, logging, and the missed sweep
//! - [`adherence`]: dashboard statistics (adherence, streak, weekly chart)
//! - [`predictor`]: miss-risk estimate from past behavior

pub mod adherence;
pub mod doses;
pub mod medication;
pub mod predictor;
pub mod types;

use chrono::NaiveDateTime;
use rusqlite::types::Type;

#[derive(Debug, thiserror::Error)]
pub enum MedError {
    /// Input the caller can correct.
    #[error("{0}")]
    Invalid(String),
    /// The row does not exist or belongs to someone else.
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type MedResult<T> = std::result::Result<T, MedError>;

/// Read a TEXT column stored in [`types::DATETIME_FORMAT`].
pub(crate) fn datetime_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(idx)?;
    types::parse_datetime(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a TEXT column holding a JSON string array.
pub(crate) fn string_list_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
