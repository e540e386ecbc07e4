//! Smart alarm state machine
//!
//! Pure decision logic over the alarm configuration and incoming quality
//! samples: `Disabled → Armed → InWindow → Triggered`, with snooze collapsing
//! back into the armed states by rescheduling the wake time.
//!
//! Wake times are user-facing wall-clock values ("HH:MM", naive local time);
//! the engine caches the concrete next wake instant so that a wake time which
//! has already been crossed this cycle still fires, while a freshly set or
//! dismissed alarm rolls to the next calendar day.

use chrono::{Duration, Local, NaiveDateTime, NaiveTime, Timelike};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Consecutive snoozes allowed per alarm cycle
const MAX_SNOOZES: u32 = 3;

const WAKE_TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SleepQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

impl SleepQuality {
    /// Light-sleep heuristic: fair/poor samples count as light sleep
    pub fn is_light(&self) -> bool {
        matches!(self, SleepQuality::Fair | SleepQuality::Poor)
    }

    /// Quality band for a 0-100 score
    pub fn from_score(score: f64) -> Self {
        if score >= 85.0 {
            SleepQuality::Excellent
        } else if score >= 70.0 {
            SleepQuality::Good
        } else if score >= 55.0 {
            SleepQuality::Fair
        } else {
            SleepQuality::Poor
        }
    }
}

/// One quality observation, produced per monitor-loop iteration
#[derive(Debug, Clone, Serialize)]
pub struct QualitySample {
    pub quality: SleepQuality,
    pub score: Option<f64>,
    pub is_light_sleep: bool,
}

impl QualitySample {
    pub fn new(quality: SleepQuality, score: Option<f64>) -> Self {
        Self {
            quality,
            score,
            is_light_sleep: quality.is_light(),
        }
    }

    /// Sample with an explicit light-sleep override (manual check endpoint)
    pub fn with_light_sleep(quality: SleepQuality, score: Option<f64>, is_light: bool) -> Self {
        Self {
            quality,
            score,
            is_light_sleep: is_light || quality.is_light(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    WakeTimeReached,
    LightSleepDetected,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::WakeTimeReached => "wake_time_reached",
            TriggerReason::LightSleepDetected => "light_sleep_detected",
        }
    }
}

/// Non-null result of a trigger check
#[derive(Debug, Clone, Serialize)]
pub struct TriggerResult {
    pub reason: TriggerReason,
    pub time: NaiveDateTime,
    pub quality: Option<SleepQuality>,
    pub score: Option<f64>,
}

/// Singleton alarm configuration, created on the first `set_alarm` and only
/// ever reset to disabled afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct AlarmConfig {
    pub enabled: bool,
    pub wake_time: Option<String>,
    pub window_minutes: i64,
    pub triggered: bool,
    pub trigger_reason: Option<TriggerReason>,
    pub last_check: Option<NaiveDateTime>,
    /// Concrete instant of the next wake-up this cycle, derived from
    /// `wake_time` when the alarm is (re)armed.
    #[serde(skip)]
    next_wake: Option<NaiveDateTime>,
    #[serde(skip)]
    snooze_count: u32,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wake_time: None,
            window_minutes: 30,
            triggered: false,
            trigger_reason: None,
            last_check: None,
            next_wake: None,
            snooze_count: 0,
        }
    }
}

/// Derived view of the alarm for status queries
#[derive(Debug, Clone, Serialize)]
pub struct AlarmStatus {
    pub enabled: bool,
    pub wake_time: Option<String>,
    pub window_minutes: i64,
    pub triggered: bool,
    pub trigger_reason: Option<TriggerReason>,
    pub last_check: Option<NaiveDateTime>,
    pub current_time: String,
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub in_window: bool,
    pub minutes_until_wake: Option<i64>,
}

/// Alarm trigger engine. All state lives behind one mutex; the monitor loop,
/// the twin worker and the HTTP handlers each hold an `Arc` to the same
/// instance.
pub struct AlarmEngine {
    config: Mutex<AlarmConfig>,
}

impl AlarmEngine {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(AlarmConfig::default()),
        }
    }

    pub fn snapshot(&self) -> AlarmConfig {
        self.config.lock().clone()
    }

    /// Arms the alarm. Returns false on a malformed wake time and leaves the
    /// configuration untouched in that case.
    pub fn set_alarm(&self, wake_time: &str, window_minutes: i64) -> bool {
        self.set_alarm_at(Local::now().naive_local(), wake_time, window_minutes)
    }

    fn set_alarm_at(&self, now: NaiveDateTime, wake_time: &str, window_minutes: i64) -> bool {
        let Ok(parsed) = NaiveTime::parse_from_str(wake_time, WAKE_TIME_FORMAT) else {
            warn!("rejected alarm time {:?}: expected HH:MM", wake_time);
            return false;
        };

        let next_wake = next_occurrence(now, parsed);
        let mut cfg = self.config.lock();
        cfg.enabled = true;
        cfg.wake_time = Some(wake_time.to_string());
        cfg.window_minutes = window_minutes;
        cfg.triggered = false;
        cfg.trigger_reason = None;
        cfg.snooze_count = 0;
        cfg.next_wake = Some(next_wake);
        info!("alarm set for {wake_time} (window {window_minutes} min, next wake {next_wake})");
        true
    }

    /// Updates the wake window without touching the armed state. Takes
    /// effect on the next trigger check.
    pub fn set_window(&self, window_minutes: i64) {
        let mut cfg = self.config.lock();
        cfg.window_minutes = window_minutes;
    }

    pub fn disable_alarm(&self) {
        let mut cfg = self.config.lock();
        cfg.enabled = false;
        cfg.triggered = false;
        cfg.trigger_reason = None;
        cfg.next_wake = None;
        cfg.snooze_count = 0;
        info!("alarm disabled");
    }

    /// Clears a trigger without disabling; the alarm re-arms for the next
    /// occurrence of its wake time.
    pub fn dismiss_alarm(&self) {
        self.dismiss_alarm_at(Local::now().naive_local())
    }

    fn dismiss_alarm_at(&self, now: NaiveDateTime) {
        let mut cfg = self.config.lock();
        cfg.triggered = false;
        cfg.trigger_reason = None;
        cfg.snooze_count = 0;
        cfg.next_wake = cfg
            .wake_time
            .as_deref()
            .and_then(|t| NaiveTime::parse_from_str(t, WAKE_TIME_FORMAT).ok())
            .map(|t| next_occurrence(now, t));
    }

    /// Pushes the wake time `minutes` into the future and clears the trigger.
    /// Returns the new "HH:MM" wake time, or None when nothing is triggered
    /// or the snooze budget for this cycle is spent.
    pub fn snooze_alarm(&self, minutes: i64) -> Option<String> {
        self.snooze_alarm_at(Local::now().naive_local(), minutes)
    }

    fn snooze_alarm_at(&self, now: NaiveDateTime, minutes: i64) -> Option<String> {
        let mut cfg = self.config.lock();
        if !cfg.triggered {
            return None;
        }
        if cfg.snooze_count >= MAX_SNOOZES {
            warn!("snooze limit reached ({MAX_SNOOZES}), dismiss or disable instead");
            return None;
        }

        let target = truncate_to_minute(now + Duration::minutes(minutes));
        let new_wake = target.format(WAKE_TIME_FORMAT).to_string();
        cfg.triggered = false;
        cfg.trigger_reason = None;
        cfg.snooze_count += 1;
        cfg.wake_time = Some(new_wake.clone());
        cfg.next_wake = Some(target);
        info!(
            "alarm snoozed for {} min, new wake time {} ({}/{})",
            minutes, new_wake, cfg.snooze_count, MAX_SNOOZES
        );
        Some(new_wake)
    }

    /// One trigger evaluation. Returns None while disabled, already
    /// triggered, unscheduled or simply not due yet.
    pub fn check_alarm_trigger(&self, sample: Option<&QualitySample>) -> Option<TriggerResult> {
        self.check_alarm_trigger_at(Local::now().naive_local(), sample)
    }

    fn check_alarm_trigger_at(
        &self,
        now: NaiveDateTime,
        sample: Option<&QualitySample>,
    ) -> Option<TriggerResult> {
        let mut cfg = self.config.lock();
        if !cfg.enabled || cfg.triggered {
            return None;
        }
        let wake_str = cfg.wake_time.clone()?;
        cfg.last_check = Some(now);

        let wake_dt = match cfg.next_wake {
            Some(dt) => dt,
            None => {
                // Re-derive after deserialization or twin edits
                let parsed = NaiveTime::parse_from_str(&wake_str, WAKE_TIME_FORMAT).ok()?;
                let dt = next_occurrence(now, parsed);
                cfg.next_wake = Some(dt);
                dt
            }
        };

        if now >= wake_dt {
            cfg.triggered = true;
            cfg.trigger_reason = Some(TriggerReason::WakeTimeReached);
            info!("alarm triggered: wake time {} reached", wake_str);
            return Some(TriggerResult {
                reason: TriggerReason::WakeTimeReached,
                time: now,
                quality: sample.map(|s| s.quality),
                score: sample.and_then(|s| s.score),
            });
        }

        let window_start = wake_dt - Duration::minutes(cfg.window_minutes);
        if window_start <= now {
            if let Some(sample) = sample {
                if sample.is_light_sleep || sample.quality.is_light() {
                    cfg.triggered = true;
                    cfg.trigger_reason = Some(TriggerReason::LightSleepDetected);
                    info!(
                        "alarm triggered: light sleep ({:?}) inside wake window",
                        sample.quality
                    );
                    return Some(TriggerResult {
                        reason: TriggerReason::LightSleepDetected,
                        time: now,
                        quality: Some(sample.quality),
                        score: sample.score,
                    });
                }
            }
        }

        None
    }

    /// Pure status derivation; never mutates the configuration.
    pub fn get_alarm_status(&self) -> AlarmStatus {
        self.get_alarm_status_at(Local::now().naive_local())
    }

    fn get_alarm_status_at(&self, now: NaiveDateTime) -> AlarmStatus {
        let cfg = self.config.lock();

        let mut status = AlarmStatus {
            enabled: cfg.enabled,
            wake_time: cfg.wake_time.clone(),
            window_minutes: cfg.window_minutes,
            triggered: cfg.triggered,
            trigger_reason: cfg.trigger_reason,
            last_check: cfg.last_check,
            current_time: now.format("%H:%M:%S").to_string(),
            window_start: None,
            window_end: None,
            in_window: false,
            minutes_until_wake: None,
        };

        if cfg.enabled {
            let wake_dt = cfg.next_wake.or_else(|| {
                cfg.wake_time
                    .as_deref()
                    .and_then(|t| NaiveTime::parse_from_str(t, WAKE_TIME_FORMAT).ok())
                    .map(|t| next_occurrence(now, t))
            });
            if let Some(wake_dt) = wake_dt {
                let window_start = wake_dt - Duration::minutes(cfg.window_minutes);
                status.window_start = Some(window_start.format(WAKE_TIME_FORMAT).to_string());
                status.window_end = Some(wake_dt.format(WAKE_TIME_FORMAT).to_string());
                status.in_window = window_start <= now && now < wake_dt;
                if now < wake_dt {
                    status.minutes_until_wake = Some((wake_dt - now).num_minutes());
                }
            }
        }

        status
    }
}

impl Default for AlarmEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Next instant of `time`, rolling to tomorrow when today's instance has
/// already passed.
fn next_occurrence(now: NaiveDateTime, time: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(time);
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

fn truncate_to_minute(dt: NaiveDateTime) -> NaiveDateTime {
    dt.with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn set_alarm_validates_time_format() {
        let engine = AlarmEngine::new();
        assert!(!engine.set_alarm("25:00", 30));
        assert!(!engine.set_alarm("7am", 30));
        assert!(!engine.set_alarm("", 30));
        // Rejected input leaves the config untouched
        let cfg = engine.snapshot();
        assert!(!cfg.enabled);
        assert!(cfg.wake_time.is_none());

        assert!(engine.set_alarm("07:00", 30));
        let cfg = engine.snapshot();
        assert!(cfg.enabled);
        assert_eq!(cfg.wake_time.as_deref(), Some("07:00"));
        assert!(!cfg.triggered);
    }

    #[test]
    fn status_window_end_matches_wake_time() {
        let engine = AlarmEngine::new();
        let now = at("2026-08-27 06:00:00");
        assert!(engine.set_alarm_at(now, "07:30", 20));
        let status = engine.get_alarm_status_at(now);
        assert_eq!(status.window_end.as_deref(), Some("07:30"));
        assert_eq!(status.window_start.as_deref(), Some("07:10"));
        assert!(!status.in_window);
        assert_eq!(status.minutes_until_wake, Some(90));
    }

    #[test]
    fn elapsed_wake_time_rolls_to_tomorrow() {
        let engine = AlarmEngine::new();
        let now = at("2026-08-27 08:00:00");
        assert!(engine.set_alarm_at(now, "07:00", 30));

        // Derived window is entirely in the future
        let status = engine.get_alarm_status_at(now);
        assert!(status.minutes_until_wake.unwrap() > 0);
        assert_eq!(status.minutes_until_wake, Some(23 * 60));

        // And no trigger fires now
        assert!(engine
            .check_alarm_trigger_at(now, Some(&QualitySample::new(SleepQuality::Poor, None)))
            .is_none());
    }

    #[test]
    fn wake_time_reached_fires_regardless_of_quality() {
        let engine = AlarmEngine::new();
        assert!(engine.set_alarm_at(at("2026-08-27 06:00:00"), "07:00", 30));

        let sample = QualitySample::new(SleepQuality::Excellent, Some(92.0));
        let result = engine
            .check_alarm_trigger_at(at("2026-08-27 07:00:30"), Some(&sample))
            .expect("trigger expected at wake time");
        assert_eq!(result.reason, TriggerReason::WakeTimeReached);
        assert!(engine.snapshot().triggered);
    }

    #[test]
    fn light_sleep_inside_window_triggers() {
        let engine = AlarmEngine::new();
        let now = at("2026-08-27 06:50:00");
        assert!(engine.set_alarm_at(now, "07:00", 30));

        let sample = QualitySample::new(SleepQuality::Poor, Some(41.5));
        let result = engine
            .check_alarm_trigger_at(now, Some(&sample))
            .expect("light sleep trigger expected");
        assert_eq!(result.reason, TriggerReason::LightSleepDetected);
        assert_eq!(result.quality, Some(SleepQuality::Poor));
    }

    #[test]
    fn deep_sleep_inside_window_does_not_trigger() {
        let engine = AlarmEngine::new();
        let now = at("2026-08-27 06:50:00");
        assert!(engine.set_alarm_at(now, "07:00", 30));

        let sample = QualitySample::new(SleepQuality::Excellent, Some(90.0));
        assert!(engine.check_alarm_trigger_at(now, Some(&sample)).is_none());
        assert!(!engine.snapshot().triggered);
    }

    #[test]
    fn light_sleep_outside_window_does_not_trigger() {
        let engine = AlarmEngine::new();
        let now = at("2026-08-27 05:00:00");
        assert!(engine.set_alarm_at(now, "07:00", 30));

        let sample = QualitySample::new(SleepQuality::Poor, Some(40.0));
        assert!(engine.check_alarm_trigger_at(now, Some(&sample)).is_none());
    }

    #[test]
    fn triggered_is_monotonic_until_cleared() {
        let engine = AlarmEngine::new();
        assert!(engine.set_alarm_at(at("2026-08-27 06:00:00"), "07:00", 30));
        assert!(engine
            .check_alarm_trigger_at(at("2026-08-27 07:01:00"), None)
            .is_some());

        // Repeated checks stay silent while triggered
        for offset in 1..5 {
            let later = at("2026-08-27 07:01:00") + Duration::minutes(offset);
            let sample = QualitySample::new(SleepQuality::Poor, None);
            assert!(engine.check_alarm_trigger_at(later, Some(&sample)).is_none());
        }

        // Dismiss re-arms for tomorrow, so no immediate re-trigger either
        engine.dismiss_alarm_at(at("2026-08-27 07:05:00"));
        assert!(!engine.snapshot().triggered);
        assert!(engine
            .check_alarm_trigger_at(at("2026-08-27 07:06:00"), None)
            .is_none());
        // ...but the next day's instance fires again
        assert!(engine
            .check_alarm_trigger_at(at("2026-08-28 07:00:00"), None)
            .is_some());
    }

    #[test]
    fn snooze_sets_wake_time_to_now_plus_minutes() {
        let engine = AlarmEngine::new();
        assert!(engine.set_alarm_at(at("2026-08-27 06:00:00"), "07:00", 30));
        assert!(engine
            .check_alarm_trigger_at(at("2026-08-27 07:00:10"), None)
            .is_some());

        let new_time = engine
            .snooze_alarm_at(at("2026-08-27 07:00:42"), 9)
            .expect("snooze expected while triggered");
        assert_eq!(new_time, "07:09");
        let cfg = engine.snapshot();
        assert!(!cfg.triggered);
        assert_eq!(cfg.wake_time.as_deref(), Some("07:09"));

        // Snoozed alarm fires again at the rescheduled time
        assert!(engine
            .check_alarm_trigger_at(at("2026-08-27 07:09:00"), None)
            .is_some());
    }

    #[test]
    fn snooze_requires_triggered_state() {
        let engine = AlarmEngine::new();
        assert!(engine.set_alarm_at(at("2026-08-27 06:00:00"), "07:00", 30));
        assert!(engine.snooze_alarm_at(at("2026-08-27 06:30:00"), 9).is_none());
    }

    #[test]
    fn snooze_budget_is_bounded() {
        let engine = AlarmEngine::new();
        let mut now = at("2026-08-27 06:00:00");
        assert!(engine.set_alarm_at(now, "07:00", 30));

        now = at("2026-08-27 07:00:10");
        for _ in 0..MAX_SNOOZES {
            assert!(engine.check_alarm_trigger_at(now, None).is_some());
            now += Duration::minutes(1);
            assert!(engine.snooze_alarm_at(now, 5).is_some());
            now += Duration::minutes(6);
        }
        assert!(engine.check_alarm_trigger_at(now, None).is_some());
        assert!(engine.snooze_alarm_at(now, 5).is_none());
    }

    #[test]
    fn disable_clears_trigger_state() {
        let engine = AlarmEngine::new();
        assert!(engine.set_alarm_at(at("2026-08-27 06:00:00"), "07:00", 30));
        assert!(engine
            .check_alarm_trigger_at(at("2026-08-27 07:01:00"), None)
            .is_some());

        engine.disable_alarm();
        let cfg = engine.snapshot();
        assert!(!cfg.enabled);
        assert!(!cfg.triggered);
        assert!(cfg.trigger_reason.is_none());
        assert!(engine
            .check_alarm_trigger_at(at("2026-08-28 07:00:00"), None)
            .is_none());
    }

    #[test]
    fn quality_bands_from_score() {
        assert_eq!(SleepQuality::from_score(91.0), SleepQuality::Excellent);
        assert_eq!(SleepQuality::from_score(85.0), SleepQuality::Excellent);
        assert_eq!(SleepQuality::from_score(70.0), SleepQuality::Good);
        assert_eq!(SleepQuality::from_score(55.0), SleepQuality::Fair);
        assert_eq!(SleepQuality::from_score(54.9), SleepQuality::Poor);
    }
}
