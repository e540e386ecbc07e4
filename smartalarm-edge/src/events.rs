//! Alarm event history
//!
//! Every lifecycle transition (set, disabled, snoozed, dismissed, triggered)
//! is appended to a JSON file on disk so the history survives restarts. The
//! store keeps an in-memory cache behind a mutex and rewrites the whole file
//! on each append, same approach as the rest of our small on-device stores.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::alarm::{SleepQuality, TriggerReason};
use crate::ports::AlarmEventSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmEventType {
    Set,
    Disabled,
    Snoozed,
    Dismissed,
    Triggered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub event_type: AlarmEventType,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_reason: Option<TriggerReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_quality: Option<SleepQuality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_minutes: Option<i64>,
}

impl AlarmEvent {
    pub fn new(event_type: AlarmEventType) -> Self {
        Self {
            event_type,
            timestamp: Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S").to_string(),
            trigger_reason: None,
            scheduled_time: None,
            actual_time: None,
            sleep_quality: None,
            sleep_score: None,
            window_minutes: None,
        }
    }
}

/// File-backed event log
pub struct JsonEventStore {
    path: PathBuf,
    cache: Mutex<Vec<AlarmEvent>>,
}

impl JsonEventStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let cache = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading event log {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing event log {}", path.display()))?
        } else {
            Vec::new()
        };
        info!(
            "event log at {} ({} events loaded)",
            path.display(),
            cache.len()
        );
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    fn save_to_disk(&self, events: &[AlarmEvent]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(events)?;
        fs::write(&self.path, json)
            .with_context(|| format!("writing event log {}", self.path.display()))?;
        Ok(())
    }
}

impl AlarmEventSink for JsonEventStore {
    fn record(&self, event: &AlarmEvent) {
        let mut cache = self.cache.lock();
        cache.push(event.clone());
        if let Err(e) = self.save_to_disk(&cache) {
            error!("failed to persist alarm event: {e:#}");
        }
    }

    fn recent(&self, limit: usize) -> Vec<AlarmEvent> {
        let cache = self.cache.lock();
        cache.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_recall_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonEventStore::new(dir.path().join("alarm_events.json")).unwrap();

        let mut set = AlarmEvent::new(AlarmEventType::Set);
        set.scheduled_time = Some("07:00".into());
        set.window_minutes = Some(30);
        store.record(&set);

        let mut triggered = AlarmEvent::new(AlarmEventType::Triggered);
        triggered.trigger_reason = Some(TriggerReason::WakeTimeReached);
        store.record(&triggered);

        let recent = store.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, AlarmEventType::Triggered);
        assert_eq!(recent[1].event_type, AlarmEventType::Set);
        assert_eq!(recent[1].scheduled_time.as_deref(), Some("07:00"));
    }

    #[test]
    fn recent_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonEventStore::new(dir.path().join("alarm_events.json")).unwrap();
        for _ in 0..5 {
            store.record(&AlarmEvent::new(AlarmEventType::Snoozed));
        }
        assert_eq!(store.recent(3).len(), 3);
    }

    #[test]
    fn history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarm_events.json");
        {
            let store = JsonEventStore::new(path.clone()).unwrap();
            store.record(&AlarmEvent::new(AlarmEventType::Dismissed));
        }
        let reopened = JsonEventStore::new(path).unwrap();
        let recent = reopened.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_type, AlarmEventType::Dismissed);
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonEventStore::new(dir.path().join("nope.json")).unwrap();
        assert!(store.recent(10).is_empty());
    }
}
