//! Background sleep monitor
//!
//! Polls the wearable provider on a fixed cadence while an alarm is armed,
//! turns each session into a quality prediction, and feeds the result to
//! the alarm engine. Predictions and trigger alerts go out over the alert
//! publisher when cloud publishing is enabled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::alarm::{AlarmEngine, QualitySample};
use crate::events::{AlarmEvent, AlarmEventType};
use crate::model::FeatureExtractor;
use crate::ports::{AlarmEventSink, AlertPublisher, QualityPredictor, WearableDataProvider};
use crate::state::StatusFlags;

pub struct MonitorTopics {
    pub predictions: String,
    pub alerts: String,
}

pub struct SleepMonitor {
    engine: Arc<AlarmEngine>,
    provider: Arc<dyn WearableDataProvider>,
    predictor: Arc<dyn QualityPredictor>,
    publisher: Arc<dyn AlertPublisher>,
    events: Arc<dyn AlarmEventSink>,
    flags: Arc<StatusFlags>,
    extractor: Mutex<FeatureExtractor>,
    interval: Duration,
    topics: MonitorTopics,
    stop: AtomicBool,
    force_fetch: AtomicBool,
    last_sample: Mutex<Option<QualitySample>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SleepMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<AlarmEngine>,
        provider: Arc<dyn WearableDataProvider>,
        predictor: Arc<dyn QualityPredictor>,
        publisher: Arc<dyn AlertPublisher>,
        events: Arc<dyn AlarmEventSink>,
        flags: Arc<StatusFlags>,
        interval: Duration,
        topics: MonitorTopics,
    ) -> Self {
        Self {
            engine,
            provider,
            predictor,
            publisher,
            events,
            flags,
            extractor: Mutex::new(FeatureExtractor::new()),
            interval,
            topics,
            stop: AtomicBool::new(false),
            force_fetch: AtomicBool::new(false),
            last_sample: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Starts the monitor thread. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        self.flags.set_monitoring_active(true);
        info!("sleep monitor started (every {:?})", self.interval);

        let monitor = Arc::clone(self);
        *handle = Some(
            std::thread::Builder::new()
                .name("sleep-monitor".into())
                .spawn(move || monitor.run())
                .expect("spawn sleep monitor"),
        );
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.flags.set_monitoring_active(false);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        info!("sleep monitor stopped");
    }

    /// Asks the loop to poll on its next iteration even when gating would
    /// normally skip it.
    pub fn request_fetch(&self) {
        self.force_fetch.store(true, Ordering::SeqCst);
    }

    pub fn last_sample(&self) -> Option<QualitySample> {
        self.last_sample.lock().clone()
    }

    fn run(&self) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let forced = self.force_fetch.swap(false, Ordering::SeqCst);
            let alarm = self.engine.snapshot();
            let due = alarm.enabled && !alarm.triggered && self.flags.fitbit_connected();
            if due || forced {
                if let Err(e) = self.poll_once() {
                    error!("monitor poll failed: {e:#}");
                }
            } else {
                debug!("monitor idle (alarm armed: {}, provider connected: {})",
                    alarm.enabled && !alarm.triggered,
                    self.flags.fitbit_connected());
            }

            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(self.interval);
        }
    }

    /// One monitoring iteration: fetch, extract, predict, check the alarm.
    pub fn poll_once(&self) -> Result<()> {
        let Some(session) = self.provider.fetch_latest_session()? else {
            debug!("no sleep session available yet");
            return Ok(());
        };

        let heart_rate = match self.provider.fetch_heart_rate(session.date) {
            Ok(hr) => hr,
            Err(e) => {
                warn!("heart rate fetch failed, predicting without it: {e}");
                None
            }
        };

        let now = Local::now().naive_local();
        let features = self
            .extractor
            .lock()
            .extract(&session, heart_rate.as_ref(), now);
        let prediction = self.predictor.predict(&features);
        debug!(
            "predicted sleep quality {:?} (score {})",
            prediction.quality, prediction.score
        );

        if self.flags.cloud_enabled() {
            self.publisher.publish(
                &self.topics.predictions,
                &json!({
                    "quality": prediction.quality,
                    "score": prediction.score,
                    "date": session.date.to_string(),
                    "features": features,
                }),
            );
        }

        let sample = QualitySample::new(prediction.quality, Some(prediction.score));
        *self.last_sample.lock() = Some(sample.clone());

        if let Some(result) = self.engine.check_alarm_trigger(Some(&sample)) {
            info!("alarm trigger: {}", result.reason.as_str());
            let mut event = AlarmEvent::new(AlarmEventType::Triggered);
            event.trigger_reason = Some(result.reason);
            event.actual_time = Some(result.time.format("%H:%M:%S").to_string());
            event.scheduled_time = self.engine.snapshot().wake_time;
            event.sleep_quality = result.quality;
            event.sleep_score = result.score;
            self.events.record(&event);

            if self.flags.cloud_enabled() {
                self.publisher.publish(
                    &self.topics.alerts,
                    &json!({
                        "alert": "alarm_triggered",
                        "reason": result.reason.as_str(),
                        "time": result.time.format("%Y-%m-%dT%H:%M:%S").to_string(),
                        "quality": result.quality,
                        "score": result.score,
                    }),
                );
            }
        }

        Ok(())
    }
}
