//! Mock ports for development and tests without external services

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use log::info;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use smartalarm_edge::events::AlarmEvent;
use smartalarm_edge::ports::{
    AlarmEventSink, AlertPublisher, HeartRateSummary, PortError, Prediction, QualityPredictor,
    SleepSession, TwinTransport, WearableDataProvider,
};

/// Twin transport that records every reported patch and method response.
/// Failure injection lets tests exercise the retry path.
#[derive(Default)]
pub struct MockTwinTransport {
    connected: AtomicBool,
    fail_next: AtomicBool,
    reported: Mutex<Vec<Map<String, Value>>>,
    responses: Mutex<Vec<(String, u16, Value)>>,
}

impl MockTwinTransport {
    pub fn new() -> Self {
        let transport = Self::default();
        transport.connected.store(true, Ordering::SeqCst);
        transport
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Next `patch_reported` call fails with a transport error
    pub fn fail_next_send(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn reported_patches(&self) -> Vec<Map<String, Value>> {
        self.reported.lock().clone()
    }

    pub fn method_responses(&self) -> Vec<(String, u16, Value)> {
        self.responses.lock().clone()
    }
}

impl TwinTransport for MockTwinTransport {
    fn patch_reported(&self, properties: &Map<String, Value>) -> Result<(), PortError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PortError::Transport("injected failure".into()));
        }
        if !self.is_connected() {
            return Err(PortError::NotConnected);
        }
        info!("[MOCK] twin reported: {} properties", properties.len());
        self.reported.lock().push(properties.clone());
        Ok(())
    }

    fn respond_method(
        &self,
        request_id: &str,
        status: u16,
        payload: &Value,
    ) -> Result<(), PortError> {
        info!("[MOCK] method response {request_id}: {status}");
        self.responses
            .lock()
            .push((request_id.to_string(), status, payload.clone()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Provider that serves a scripted queue of sessions, then "no data".
/// Push an Err to simulate a vendor outage.
#[derive(Default)]
pub struct ScriptedSleepProvider {
    sessions: Mutex<Vec<Result<Option<SleepSession>, String>>>,
    heart_rate: Mutex<Option<HeartRateSummary>>,
}

impl ScriptedSleepProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_session(&self, session: SleepSession) {
        self.sessions.lock().push(Ok(Some(session)));
    }

    pub fn push_error(&self, message: &str) {
        self.sessions.lock().push(Err(message.to_string()));
    }

    pub fn set_heart_rate(&self, resting: f64) {
        *self.heart_rate.lock() = Some(HeartRateSummary {
            resting_heart_rate: Some(resting),
        });
    }
}

impl WearableDataProvider for ScriptedSleepProvider {
    fn fetch_latest_session(&self) -> Result<Option<SleepSession>, PortError> {
        let mut sessions = self.sessions.lock();
        if sessions.is_empty() {
            return Ok(None);
        }
        sessions.remove(0).map_err(PortError::Provider)
    }

    fn fetch_heart_rate(&self, _date: NaiveDate) -> Result<Option<HeartRateSummary>, PortError> {
        Ok(self.heart_rate.lock().clone())
    }
}

/// Predictor that always returns the same score
pub struct FixedPredictor {
    pub score: f64,
}

impl FixedPredictor {
    pub fn new(score: f64) -> Self {
        Self { score }
    }
}

impl QualityPredictor for FixedPredictor {
    fn predict(&self, _features: &smartalarm_edge::model::FeatureVector) -> Prediction {
        Prediction {
            quality: smartalarm_edge::alarm::SleepQuality::from_score(self.score),
            score: self.score,
        }
    }
}

/// Publisher that records every publish instead of sending it
#[derive(Default)]
pub struct RecordingAlertPublisher {
    published: Mutex<Vec<(String, Value)>>,
}

impl RecordingAlertPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().clone()
    }
}

impl AlertPublisher for RecordingAlertPublisher {
    fn publish(&self, topic: &str, payload: &Value) -> bool {
        info!("[MOCK] publish {topic}");
        self.published.lock().push((topic.to_string(), payload.clone()));
        true
    }
}

/// In-memory event sink
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<AlarmEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<AlarmEvent> {
        self.events.lock().clone()
    }
}

impl AlarmEventSink for MemoryEventSink {
    fn record(&self, event: &AlarmEvent) {
        self.events.lock().push(event.clone());
    }

    fn recent(&self, limit: usize) -> Vec<AlarmEvent> {
        self.events.lock().iter().rev().take(limit).cloned().collect()
    }
}
