//! Miss-risk estimate for a medication.
//!
//! A small logistic regression over behavioral features. The model is fit at
//! startup on a fixed seed dataset with batch gradient descent and L2
//! regularization; prediction is a dot product and a sigmoid.

use chrono::{Duration, NaiveDateTime, Timelike};
use ndarray::{Array1, Array2};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::types::{format_datetime, parse_dose_time, Medication};
use super::{datetime_column, MedResult};

/// Hour fallback when no upcoming dose can be determined.
const DEFAULT_HOUR: u32 = 8;
/// Window for the "regular routine" feature.
const ROUTINE_WINDOW_DAYS: i64 = 4;
const ROUTINE_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => Self::Morning,
            12..=16 => Self::Afternoon,
            17..=20 => Self::Evening,
            _ => Self::Night,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AdherenceFeatures {
    pub dose_complexity: u32,
    pub past_adherence_rate: f64,
    /// 1 when at least 80% of the last four days' doses were taken.
    pub lifestyle_routine: u8,
    pub time_of_day: TimeOfDay,
}

impl AdherenceFeatures {
    /// Column order: complexity, adherence, routine, then the time-of-day
    /// one-hot in alphabetical order (Afternoon, Evening, Morning, Night).
    fn to_row(&self) -> [f64; 7] {
        let tod = self.time_of_day;
        [
            self.dose_complexity as f64,
            self.past_adherence_rate,
            self.lifestyle_routine as f64,
            (tod == TimeOfDay::Afternoon) as u8 as f64,
            (tod == TimeOfDay::Evening) as u8 as f64,
            (tod == TimeOfDay::Morning) as u8 as f64,
            (tod == TimeOfDay::Night) as u8 as f64,
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskPrediction {
    pub medication_id: i64,
    pub miss_probability: f64,
    pub likely_to_miss: bool,
    pub features: AdherenceFeatures,
}

/// Seed observations: (time of day, complexity, past adherence, routine, missed).
const SEED_DATA: [(TimeOfDay, u32, f64, u8, u8); 20] = [
    (TimeOfDay::Morning, 1, 0.90, 1, 0),
    (TimeOfDay::Evening, 2, 0.70, 0, 1),
    (TimeOfDay::Afternoon, 1, 0.85, 1, 0),
    (TimeOfDay::Night, 3, 0.40, 0, 1),
    (TimeOfDay::Morning, 1, 0.60, 1, 0),
    (TimeOfDay::Evening, 2, 0.55, 0, 1),
    (TimeOfDay::Afternoon, 1, 0.95, 1, 0),
    (TimeOfDay::Night, 3, 0.50, 0, 1),
    (TimeOfDay::Morning, 2, 0.65, 0, 1),
    (TimeOfDay::Evening, 1, 0.80, 1, 0),
    (TimeOfDay::Morning, 2, 0.75, 1, 0),
    (TimeOfDay::Afternoon, 1, 0.90, 1, 0),
    (TimeOfDay::Night, 3, 0.35, 0, 1),
    (TimeOfDay::Evening, 2, 0.60, 0, 1),
    (TimeOfDay::Morning, 1, 0.70, 1, 0),
    (TimeOfDay::Afternoon, 2, 0.55, 0, 1),
    (TimeOfDay::Evening, 1, 0.85, 1, 0),
    (TimeOfDay::Night, 3, 0.45, 0, 1),
    (TimeOfDay::Morning, 1, 0.95, 1, 0),
    (TimeOfDay::Evening, 2, 0.60, 0, 1),
];

pub struct AdherencePredictor {
    weights: Array1<f64>,
    bias: f64,
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl AdherencePredictor {
    /// Fit on the built-in seed dataset.
    pub fn trained() -> Self {
        let rows: Vec<(AdherenceFeatures, f64)> = SEED_DATA
            .iter()
            .map(|&(time_of_day, dose_complexity, past_adherence_rate, lifestyle_routine, missed)| {
                (
                    AdherenceFeatures {
                        dose_complexity,
                        past_adherence_rate,
                        lifestyle_routine,
                        time_of_day,
                    },
                    missed as f64,
                )
            })
            .collect();
        Self::fit(&rows, 0.1, 5_000, 1.0)
    }

    /// Batch gradient descent on log loss with an L2 penalty of strength `1/c`.
    pub fn fit(rows: &[(AdherenceFeatures, f64)], learning_rate: f64, epochs: usize, c: f64) -> Self {
        let n = rows.len().max(1);
        let flat: Vec<f64> = rows.iter().flat_map(|(f, _)| f.to_row()).collect();
        let x = Array2::from_shape_vec((rows.len(), 7), flat)
            .unwrap_or_else(|_| Array2::zeros((0, 7)));
        let y = Array1::from_iter(rows.iter().map(|(_, label)| *label));

        let mut weights = Array1::<f64>::zeros(7);
        let mut bias = 0.0;

        for _ in 0..epochs {
            let predictions = (x.dot(&weights) + bias).mapv(sigmoid);
            let error = &predictions - &y;
            let grad_w = (x.t().dot(&error) + &weights / c) / n as f64;
            let grad_b = error.sum() / n as f64;
            weights = weights - grad_w * learning_rate;
            bias -= grad_b * learning_rate;
        }

        tracing::debug!(?weights, bias, "adherence model fitted");
        Self { weights, bias }
    }

    pub fn miss_probability(&self, features: &AdherenceFeatures) -> f64 {
        let x = Array1::from_vec(features.to_row().to_vec());
        sigmoid(x.dot(&self.weights) + self.bias)
    }

    pub fn predict(
        &self,
        conn: &Connection,
        user_id: i64,
        med: &Medication,
        now: NaiveDateTime,
    ) -> MedResult<RiskPrediction> {
        let features = extract_features(conn, user_id, med, now)?;
        let p = self.miss_probability(&features);
        Ok(RiskPrediction {
            medication_id: med.id,
            miss_probability: (p * 1000.0).round() / 1000.0,
            likely_to_miss: p >= 0.5,
            features,
        })
    }
}

/// Derive the model features for `med` from its dose history.
pub fn extract_features(
    conn: &Connection,
    user_id: i64,
    med: &Medication,
    now: NaiveDateTime,
) -> MedResult<AdherenceFeatures> {
    let (total, taken): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(status = 'taken'), 0) FROM dose_logs \
         WHERE user_id = ?1 AND medication_id = ?2",
        params![user_id, med.id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let past_adherence_rate = if total > 0 { taken as f64 / total as f64 } else { 1.0 };

    let since = format_datetime(now - Duration::days(ROUTINE_WINDOW_DAYS));
    let (recent_total, recent_taken): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(status = 'taken'), 0) FROM dose_logs \
         WHERE user_id = ?1 AND medication_id = ?2 AND scheduled_time >= ?3",
        params![user_id, med.id, since],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let lifestyle_routine =
        (recent_total > 0 && recent_taken as f64 >= ROUTINE_THRESHOLD * recent_total as f64) as u8;

    let next_logged = conn
        .query_row(
            "SELECT scheduled_time FROM dose_logs \
             WHERE user_id = ?1 AND medication_id = ?2 AND scheduled_time >= ?3 \
             ORDER BY scheduled_time LIMIT 1",
            params![user_id, med.id, format_datetime(now)],
            |row| datetime_column(row, 0),
        )
        .optional()?;

    let hour = match next_logged {
        Some(dt) => dt.hour(),
        None => next_scheduled_hour(med, now).unwrap_or(DEFAULT_HOUR),
    };

    Ok(AdherenceFeatures {
        dose_complexity: med.times_per_day,
        past_adherence_rate,
        lifestyle_routine,
        time_of_day: TimeOfDay::from_hour(hour),
    })
}

/// Hour of the next listed time after `now`, wrapping to tomorrow's first.
fn next_scheduled_hour(med: &Medication, now: NaiveDateTime) -> Option<u32> {
    let times: Vec<_> = med.times.iter().filter_map(|t| parse_dose_time(t).ok()).collect();
    times
        .iter()
        .find(|t| **t > now.time())
        .or_else(|| times.first())
        .map(|t| t.hour())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(c: u32, rate: f64, routine: u8, tod: TimeOfDay) -> AdherenceFeatures {
        AdherenceFeatures {
            dose_complexity: c,
            past_adherence_rate: rate,
            lifestyle_routine: routine,
            time_of_day: tod,
        }
    }

    #[test]
    fn time_of_day_buckets() {
        assert_eq!(TimeOfDay::from_hour(5), TimeOfDay::Morning);
        assert_eq!(TimeOfDay::from_hour(12), TimeOfDay::Afternoon);
        assert_eq!(TimeOfDay::from_hour(20), TimeOfDay::Evening);
        assert_eq!(TimeOfDay::from_hour(21), TimeOfDay::Night);
        assert_eq!(TimeOfDay::from_hour(3), TimeOfDay::Night);
    }

    #[test]
    fn trained_model_separates_seed_extremes() {
        let model = AdherencePredictor::trained();
        let steady = model.miss_probability(&features(1, 0.95, 1, TimeOfDay::Morning));
        let shaky = model.miss_probability(&features(3, 0.40, 0, TimeOfDay::Night));
        assert!(steady < 0.5, "steady patient predicted {steady}");
        assert!(shaky > 0.5, "shaky patient predicted {shaky}");
    }

    #[test]
    fn training_fits_most_seed_rows() {
        let model = AdherencePredictor::trained();
        let correct = SEED_DATA
            .iter()
            .filter(|&&(tod, c, rate, routine, missed)| {
                let p = model.miss_probability(&features(c, rate, routine, tod));
                (p >= 0.5) == (missed == 1)
            })
            .count();
        assert!(correct >= 18, "only {correct}/20 seed rows fit");
    }
}
