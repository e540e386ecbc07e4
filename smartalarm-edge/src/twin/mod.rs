//! Device twin synchronization
//!
//! Keeps the device's reported state loosely synchronized with the cloud
//! twin. Outbound property changes collect in a merge buffer (last write
//! wins per key) and are flushed on a fixed tick, subject to a minimum
//! send interval and a send-rate circuit breaker. Inbound desired-property
//! patches and direct method calls arrive on a channel from the MQTT link
//! and are applied on the twin worker thread.

mod breaker;

pub use breaker::CircuitBreaker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::alarm::AlarmEngine;
use crate::monitor::SleepMonitor;
use crate::ports::TwinTransport;
use crate::state::StatusFlags;

/// Inbound work for the twin worker thread
#[derive(Debug)]
pub enum TwinMessage {
    DesiredPatch(Map<String, Value>),
    Method {
        name: String,
        request_id: String,
        payload: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    CircuitOpen,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::CircuitOpen => "circuit_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TwinSettings {
    pub min_send_interval: Duration,
    pub flush_tick: Duration,
    pub max_sends_per_minute: u32,
    pub breaker_cooldown: Duration,
}

impl Default for TwinSettings {
    fn default() -> Self {
        Self {
            min_send_interval: Duration::from_secs(60),
            flush_tick: Duration::from_secs(10),
            max_sends_per_minute: 10,
            breaker_cooldown: Duration::from_secs(300),
        }
    }
}

pub struct TwinSyncClient {
    transport: Option<Arc<dyn TwinTransport>>,
    engine: Arc<AlarmEngine>,
    monitor: Arc<SleepMonitor>,
    flags: Arc<StatusFlags>,
    settings: TwinSettings,
    buffer: Mutex<Map<String, Value>>,
    breaker: Mutex<CircuitBreaker>,
    last_send: Mutex<Option<Instant>>,
    state: Mutex<ConnectionState>,
    stop: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TwinSyncClient {
    pub fn new(
        transport: Option<Arc<dyn TwinTransport>>,
        engine: Arc<AlarmEngine>,
        monitor: Arc<SleepMonitor>,
        flags: Arc<StatusFlags>,
        settings: TwinSettings,
    ) -> Self {
        let breaker = CircuitBreaker::new(settings.max_sends_per_minute, settings.breaker_cooldown);
        Self {
            transport,
            engine,
            monitor,
            flags,
            settings,
            buffer: Mutex::new(Map::new()),
            breaker: Mutex::new(breaker),
            last_send: Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            stop: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Queues the boot-time reported state. Returns false when no transport
    /// is configured; the device then runs in local-only mode.
    pub fn init(&self) -> bool {
        if self.transport.is_none() {
            *self.state.lock() = ConnectionState::Disconnected;
            info!("no twin transport configured, running local-only");
            return false;
        }
        *self.state.lock() = ConnectionState::Connecting;

        let alarm = self.engine.snapshot();
        let mut props = Map::new();
        props.insert("device_started".into(), json!(Utc::now().to_rfc3339()));
        props.insert("alarm_enabled".into(), json!(alarm.enabled));
        props.insert("alarm_time".into(), json!(alarm.wake_time));
        props.insert("smart_wakeup_window".into(), json!(alarm.window_minutes));
        props.insert("cloud_enabled".into(), json!(self.flags.cloud_enabled()));
        props.insert(
            "monitoring_active".into(),
            json!(self.flags.monitoring_active()),
        );
        self.report(props);
        true
    }

    /// Merges properties into the pending buffer. Last write per key wins;
    /// nothing is sent until the next flush.
    pub fn report(&self, props: Map<String, Value>) {
        let mut buffer = self.buffer.lock();
        for (key, value) in props {
            buffer.insert(key, value);
        }
    }

    /// Queues the current alarm configuration as reported properties.
    pub fn report_alarm_state(&self) {
        let alarm = self.engine.snapshot();
        let mut props = Map::new();
        props.insert("alarm_enabled".into(), json!(alarm.enabled));
        props.insert("alarm_time".into(), json!(alarm.wake_time));
        props.insert("smart_wakeup_window".into(), json!(alarm.window_minutes));
        self.report(props);
    }

    pub fn pending_count(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Applies a desired-property patch. Only keys whose value actually
    /// differs from the current device state are applied and acknowledged,
    /// so a re-delivered patch is a no-op. Patches are only ever handled on
    /// the twin worker thread, one at a time.
    pub fn on_patch(&self, patch: Map<String, Value>) {
        let patch: Map<String, Value> = patch
            .into_iter()
            .filter(|(k, _)| !k.starts_with('$'))
            .collect();
        if patch.is_empty() {
            return;
        }
        debug!("desired patch: {:?}", patch.keys().collect::<Vec<_>>());

        let mut ack = Map::new();

        if let Some(enabled) = patch.get("cloud_enabled").and_then(Value::as_bool) {
            if enabled != self.flags.cloud_enabled() {
                self.flags.set_cloud_enabled(enabled);
                info!("cloud publishing {}", if enabled { "enabled" } else { "disabled" });
                ack.insert("cloud_enabled".into(), json!(enabled));
            }
        }

        if let Some(active) = patch.get("monitoring_active").and_then(Value::as_bool) {
            if active != self.flags.monitoring_active() {
                if active {
                    self.monitor.start();
                } else {
                    self.monitor.stop();
                }
                ack.insert("monitoring_active".into(), json!(active));
            }
        }

        // Alarm keys merge over the current config: an omitted key keeps
        // its value. capture_enabled is the legacy name for alarm_enabled;
        // a patch that carries only a new wake time arms the alarm.
        let current = self.engine.snapshot();
        let patch_time = patch.get("alarm_time").and_then(Value::as_str);
        let patch_window = patch.get("smart_wakeup_window").and_then(Value::as_i64);
        let patch_enabled = patch
            .get("alarm_enabled")
            .and_then(Value::as_bool)
            .or_else(|| patch.get("capture_enabled").and_then(Value::as_bool));

        if patch_time.is_some() || patch_window.is_some() || patch_enabled.is_some() {
            let time = patch_time
                .map(str::to_string)
                .or_else(|| current.wake_time.clone());
            let window = patch_window.unwrap_or(current.window_minutes);
            let enabled = patch_enabled.unwrap_or(patch_time.is_some() || current.enabled);

            if enabled {
                if let Some(time) = time.as_deref() {
                    let changed = !current.enabled
                        || current.wake_time.as_deref() != Some(time)
                        || current.window_minutes != window;
                    if changed {
                        if self.engine.set_alarm(time, window) {
                            self.monitor.start();
                            ack.insert("alarm_enabled".into(), json!(true));
                            ack.insert("alarm_time".into(), json!(time));
                            ack.insert("smart_wakeup_window".into(), json!(window));
                        } else {
                            warn!("twin patch carried invalid alarm_time {:?}", time);
                        }
                    }
                } else {
                    warn!("twin patch enables the alarm but no wake time is configured");
                }
            } else {
                if current.enabled {
                    self.engine.disable_alarm();
                    ack.insert("alarm_enabled".into(), json!(false));
                }
                if window != current.window_minutes {
                    self.engine.set_window(window);
                    ack.insert("smart_wakeup_window".into(), json!(window));
                }
            }
        }

        if !ack.is_empty() {
            ack.insert("last_sync".into(), json!(Utc::now().to_rfc3339()));
            self.report(ack);
        }
    }

    /// Dispatches a direct method call and sends the response through the
    /// transport.
    pub fn handle_method(&self, name: &str, request_id: &str, payload: Value) {
        let (status, body) = match name {
            "getStatus" => (
                200,
                json!({
                    "alarm": self.engine.get_alarm_status(),
                    "cloud_enabled": self.flags.cloud_enabled(),
                    "monitoring_active": self.flags.monitoring_active(),
                    "fitbit_connected": self.flags.fitbit_connected(),
                    "twin_connection": self.connection_state().as_str(),
                    "pending_properties": self.pending_count(),
                }),
            ),
            "setCloudEnabled" => {
                let enabled = payload.get("enabled").and_then(Value::as_bool).unwrap_or(true);
                self.flags.set_cloud_enabled(enabled);
                let mut props = Map::new();
                props.insert("cloud_enabled".into(), json!(enabled));
                self.report(props);
                (200, json!({ "cloud_enabled": enabled }))
            }
            "triggerFetch" => {
                self.monitor.request_fetch();
                (200, json!({ "fetch": "requested" }))
            }
            "setAlarm" => {
                let time = payload.get("time").and_then(Value::as_str);
                let window = payload.get("window").and_then(Value::as_i64).unwrap_or(30);
                match time {
                    Some(time) if self.engine.set_alarm(time, window) => {
                        self.monitor.start();
                        self.report_alarm_state();
                        (200, json!({ "alarm_time": time, "window": window }))
                    }
                    _ => (400, json!({ "error": "invalid or missing time, expected HH:MM" })),
                }
            }
            other => {
                warn!("unknown direct method {:?}", other);
                (404, json!({ "error": format!("unknown method: {other}") }))
            }
        };

        if let Some(transport) = &self.transport {
            if let Err(e) = transport.respond_method(request_id, status, &body) {
                warn!("failed to send method response for {name}: {e}");
            }
        }
    }

    /// One flush attempt: sends the buffered properties if the breaker is
    /// closed, the minimum interval has elapsed and the transport is up.
    pub fn flush_pending(&self) {
        self.flush_pending_at(Instant::now());
    }

    fn flush_pending_at(&self, now: Instant) {
        if self.breaker.lock().is_open(now) {
            *self.state.lock() = ConnectionState::CircuitOpen;
            return;
        }
        if self.buffer.lock().is_empty() {
            return;
        }
        if let Some(last) = *self.last_send.lock() {
            if now.duration_since(last) < self.settings.min_send_interval {
                return;
            }
        }
        let Some(transport) = &self.transport else {
            *self.state.lock() = ConnectionState::Disconnected;
            return;
        };
        if !transport.is_connected() {
            *self.state.lock() = ConnectionState::Connecting;
            return;
        }

        let snapshot = self.buffer.lock().clone();
        self.breaker.lock().record_send(now);
        match transport.patch_reported(&snapshot) {
            Ok(()) => {
                // Drop only what was actually sent; keep keys rewritten
                // while the send was in flight.
                let mut buffer = self.buffer.lock();
                buffer.retain(|k, v| snapshot.get(k) != Some(v));
                *self.last_send.lock() = Some(now);
                *self.state.lock() = ConnectionState::Connected;
                debug!("reported {} twin properties", snapshot.len());
            }
            Err(e) => {
                warn!("twin report failed, keeping {} properties buffered: {e}", snapshot.len());
                *self.state.lock() = ConnectionState::Connecting;
            }
        }
    }

    /// Starts the twin worker thread. It drains inbound patches and method
    /// calls between flush ticks.
    pub fn start(self: &Arc<Self>, rx: Receiver<TwinMessage>) {
        let client = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("twin-sync".into())
            .spawn(move || {
                let tick = client.settings.flush_tick;
                let mut next_flush = Instant::now() + tick;
                loop {
                    if client.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let timeout = next_flush.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(timeout) {
                        Ok(TwinMessage::DesiredPatch(patch)) => client.on_patch(patch),
                        Ok(TwinMessage::Method {
                            name,
                            request_id,
                            payload,
                        }) => client.handle_method(&name, &request_id, payload),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if Instant::now() >= next_flush {
                        client.flush_pending();
                        next_flush = Instant::now() + tick;
                    }
                }
                info!("twin worker stopped");
            })
            .expect("spawn twin worker");
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}
