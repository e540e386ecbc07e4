//! Feature extraction and the local sleep quality model
//!
//! The feature vector mirrors what the cloud-side model was trained on:
//! last night's session metrics plus one-night lags. When a field is
//! missing from the provider payload we substitute the training-set
//! defaults rather than dropping the sample.

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::Serialize;

use crate::alarm::SleepQuality;
use crate::ports::{HeartRateSummary, Prediction, QualityPredictor, SleepSession};

/// Fraction of total sleep assumed to be deep sleep for classic-format
/// sessions that carry no stage breakdown
const CLASSIC_DEEP_SLEEP_RATIO: f64 = 0.20;

// Lag defaults used until a first real night has been observed
const DEFAULT_SCORE_LAG: f64 = 75.0;
const DEFAULT_DEEP_SLEEP_LAG: f64 = 90.0;
const DEFAULT_RHR_LAG: f64 = 65.0;

#[derive(Debug, Clone, Serialize)]
pub struct FeatureVector {
    pub revitalization_score: f64,
    pub deep_sleep_minutes: f64,
    pub resting_heart_rate: f64,
    pub restlessness: f64,
    pub day_of_week: f64,
    pub is_weekend: f64,
    pub wakeup_hour: f64,
    pub score_lag1: f64,
    pub deep_sleep_lag1: f64,
    pub rhr_lag1: f64,
}

/// Builds feature vectors from raw sessions, carrying one night of lag
/// state between calls.
pub struct FeatureExtractor {
    score_lag: f64,
    deep_sleep_lag: f64,
    rhr_lag: f64,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self {
            score_lag: DEFAULT_SCORE_LAG,
            deep_sleep_lag: DEFAULT_DEEP_SLEEP_LAG,
            rhr_lag: DEFAULT_RHR_LAG,
        }
    }

    pub fn extract(
        &mut self,
        session: &SleepSession,
        heart_rate: Option<&HeartRateSummary>,
        now: NaiveDateTime,
    ) -> FeatureVector {
        let revitalization = session.efficiency as f64;

        let deep_sleep = match session.deep_sleep_minutes {
            Some(m) if session.is_stages => m,
            _ => session.minutes_asleep as f64 * CLASSIC_DEEP_SLEEP_RATIO,
        };

        let rhr = heart_rate
            .and_then(|hr| hr.resting_heart_rate)
            .unwrap_or(0.0);

        let total = (session.minutes_asleep + session.minutes_awake) as f64;
        let restlessness = if total > 0.0 {
            session.minutes_awake as f64 / total
        } else {
            0.0
        };

        let wakeup = session.end_time.unwrap_or(now);
        let day_of_week = wakeup.weekday().num_days_from_monday() as f64;
        let is_weekend = matches!(wakeup.weekday(), Weekday::Sat | Weekday::Sun);

        let features = FeatureVector {
            revitalization_score: revitalization,
            deep_sleep_minutes: deep_sleep,
            resting_heart_rate: rhr,
            restlessness,
            day_of_week,
            is_weekend: if is_weekend { 1.0 } else { 0.0 },
            wakeup_hour: wakeup.hour() as f64,
            score_lag1: self.score_lag,
            deep_sleep_lag1: self.deep_sleep_lag,
            rhr_lag1: self.rhr_lag,
        };

        // Tonight becomes tomorrow's lag
        self.score_lag = revitalization;
        self.deep_sleep_lag = deep_sleep;
        if rhr > 0.0 {
            self.rhr_lag = rhr;
        }

        features
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic fallback scorer, used when no trained model artifact is
/// deployed on the device. Weighs revitalization heaviest, then deep sleep
/// and resting heart rate, with a restlessness penalty.
pub struct LocalQualityModel;

impl LocalQualityModel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalQualityModel {
    fn default() -> Self {
        Self::new()
    }
}

impl QualityPredictor for LocalQualityModel {
    fn predict(&self, features: &FeatureVector) -> Prediction {
        let deep_component = (features.deep_sleep_minutes / 90.0).min(1.0) * 100.0;

        let hr_component = if features.resting_heart_rate > 0.0 {
            100.0 - ((features.resting_heart_rate - 60.0).max(0.0) * 2.0).min(40.0)
        } else {
            70.0
        };

        let raw = 0.5 * features.revitalization_score
            + 0.3 * deep_component
            + 0.2 * hr_component
            - features.restlessness * 30.0;

        let score = (raw.clamp(0.0, 100.0) * 10.0).round() / 10.0;

        Prediction {
            quality: SleepQuality::from_score(score),
            score,
        }
    }
}
