//! Collaborator ports for the edge agent
//!
//! Everything the core talks to — the wearable API, the quality model, the
//! cloud twin transport, the alert broker and the event log — sits behind one
//! of the traits below. The agent binary wires in the real implementations
//! (`fitbit`, `model`, `mqtt`, `events`); the devkit ships broker-free mocks
//! for tests.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::alarm::SleepQuality;
use crate::events::AlarmEvent;
use crate::model::FeatureVector;

/// Errors surfaced by collaborator ports
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One sleep session as returned by the wearable API.
///
/// `deep_sleep_minutes` is only present for "stages" sessions; classic
/// sessions report restless/awake minutes instead and deep sleep gets
/// estimated downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepSession {
    pub date: NaiveDate,
    pub end_time: Option<NaiveDateTime>,
    pub minutes_asleep: u32,
    pub minutes_awake: u32,
    /// Sleep efficiency 0-100 as reported by the vendor
    pub efficiency: u32,
    pub deep_sleep_minutes: Option<f64>,
    pub is_stages: bool,
}

/// Daily heart-rate summary for one date
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartRateSummary {
    pub resting_heart_rate: Option<f64>,
}

/// Output of a quality predictor run
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub quality: SleepQuality,
    pub score: f64,
}

/// Wearable data source (sleep sessions + heart rate)
pub trait WearableDataProvider: Send + Sync {
    /// Most recent sleep session, or None when the vendor has no data yet
    fn fetch_latest_session(&self) -> Result<Option<SleepSession>, PortError>;
    fn fetch_heart_rate(&self, date: NaiveDate) -> Result<Option<HeartRateSummary>, PortError>;
}

/// Sleep-quality model (opaque predictor over a feature vector)
pub trait QualityPredictor: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> Prediction;
}

/// Fire-and-forget broadcast of alerts/predictions
pub trait AlertPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &serde_json::Value) -> bool;
}

/// Outbound half of the cloud device twin.
///
/// Inbound desired-property patches and direct methods arrive through the
/// twin message channel instead (see `twin::TwinMessage`), so the trait only
/// needs the send path and a liveness probe.
pub trait TwinTransport: Send + Sync {
    fn patch_reported(
        &self,
        properties: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), PortError>;
    fn respond_method(
        &self,
        request_id: &str,
        status: u16,
        payload: &serde_json::Value,
    ) -> Result<(), PortError>;
    fn is_connected(&self) -> bool;
}

/// Append-only sink for alarm transition events. Persistence failures are
/// the sink's problem; callers never block alarm handling on the log.
pub trait AlarmEventSink: Send + Sync {
    fn record(&self, event: &AlarmEvent);
    /// Most recent events first
    fn recent(&self, limit: usize) -> Vec<AlarmEvent>;
}

/// Provider used when the wearable account is not configured.
/// Always reports "no data"; the monitor loop stays a no-op.
pub struct NullDataProvider;

impl WearableDataProvider for NullDataProvider {
    fn fetch_latest_session(&self) -> Result<Option<SleepSession>, PortError> {
        Ok(None)
    }

    fn fetch_heart_rate(&self, _date: NaiveDate) -> Result<Option<HeartRateSummary>, PortError> {
        Ok(None)
    }
}

/// Publisher used when the MQTT link is disabled
pub struct NoopAlertPublisher;

impl AlertPublisher for NoopAlertPublisher {
    fn publish(&self, _topic: &str, _payload: &serde_json::Value) -> bool {
        false
    }
}
