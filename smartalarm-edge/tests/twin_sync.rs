//! End-to-end tests for twin synchronization and the monitor loop, running
//! against the devkit mocks instead of a broker and a Fitbit account.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use serde_json::json;

use smartalarm_devkit::{
    alarm_patch, cloud_enabled_patch, FixedPredictor, MemoryEventSink, MockTwinTransport,
    RecordingAlertPublisher, ScriptedSleepProvider,
};
use smartalarm_edge::alarm::AlarmEngine;
use smartalarm_edge::events::AlarmEventType;
use smartalarm_edge::monitor::{MonitorTopics, SleepMonitor};
use smartalarm_edge::ports::{
    AlarmEventSink, AlertPublisher, QualityPredictor, SleepSession, TwinTransport,
    WearableDataProvider,
};
use smartalarm_edge::state::StatusFlags;
use smartalarm_edge::twin::{ConnectionState, TwinSettings, TwinSyncClient};
use smartalarm_edge::TriggerReason;

struct Harness {
    engine: Arc<AlarmEngine>,
    flags: Arc<StatusFlags>,
    monitor: Arc<SleepMonitor>,
    provider: Arc<ScriptedSleepProvider>,
    publisher: Arc<RecordingAlertPublisher>,
    events: Arc<MemoryEventSink>,
    transport: Arc<MockTwinTransport>,
    twin: Arc<TwinSyncClient>,
}

fn harness(settings: TwinSettings, score: f64) -> Harness {
    let engine = Arc::new(AlarmEngine::new());
    let flags = Arc::new(StatusFlags::new());
    flags.set_fitbit_connected(true);

    let provider = Arc::new(ScriptedSleepProvider::new());
    let publisher = Arc::new(RecordingAlertPublisher::new());
    let events = Arc::new(MemoryEventSink::new());
    let transport = Arc::new(MockTwinTransport::new());

    let monitor = Arc::new(SleepMonitor::new(
        Arc::clone(&engine),
        Arc::clone(&provider) as Arc<dyn WearableDataProvider>,
        Arc::new(FixedPredictor::new(score)) as Arc<dyn QualityPredictor>,
        Arc::clone(&publisher) as Arc<dyn AlertPublisher>,
        Arc::clone(&events) as Arc<dyn AlarmEventSink>,
        Arc::clone(&flags),
        Duration::from_millis(10),
        MonitorTopics {
            predictions: "t/predictions".into(),
            alerts: "t/alerts".into(),
        },
    ));

    let twin = Arc::new(TwinSyncClient::new(
        Some(Arc::clone(&transport) as Arc<dyn TwinTransport>),
        Arc::clone(&engine),
        Arc::clone(&monitor),
        Arc::clone(&flags),
        settings,
    ));

    Harness {
        engine,
        flags,
        monitor,
        provider,
        publisher,
        events,
        transport,
        twin,
    }
}

fn fast_settings() -> TwinSettings {
    TwinSettings {
        min_send_interval: Duration::ZERO,
        flush_tick: Duration::from_millis(10),
        max_sends_per_minute: 100,
        breaker_cooldown: Duration::from_secs(300),
    }
}

fn stages_session() -> SleepSession {
    SleepSession {
        date: NaiveDate::from_ymd_opt(2026, 8, 27).unwrap(),
        end_time: NaiveDate::from_ymd_opt(2026, 8, 27)
            .unwrap()
            .and_hms_opt(7, 10, 0),
        minutes_asleep: 410,
        minutes_awake: 32,
        efficiency: 88,
        deep_sleep_minutes: Some(70.0),
        is_stages: true,
    }
}

#[test]
fn desired_patch_arms_alarm_and_acks() {
    let h = harness(fast_settings(), 80.0);

    h.twin.on_patch(alarm_patch("07:00", 20));

    let alarm = h.engine.snapshot();
    assert!(alarm.enabled);
    assert_eq!(alarm.wake_time.as_deref(), Some("07:00"));
    assert_eq!(alarm.window_minutes, 20);
    assert!(h.twin.pending_count() > 0);

    h.twin.flush_pending();
    let patches = h.transport.reported_patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].get("alarm_time"), Some(&json!("07:00")));
    assert_eq!(patches[0].get("alarm_enabled"), Some(&json!(true)));
    assert!(patches[0].contains_key("last_sync"));
    assert_eq!(h.twin.pending_count(), 0);
    assert_eq!(h.twin.connection_state(), ConnectionState::Connected);

    h.monitor.stop();
}

#[test]
fn redelivered_patch_is_a_noop() {
    let h = harness(fast_settings(), 80.0);

    h.twin.on_patch(alarm_patch("07:00", 20));
    h.twin.flush_pending();
    assert_eq!(h.twin.pending_count(), 0);

    // Same patch again: nothing changed, nothing new to report
    h.twin.on_patch(alarm_patch("07:00", 20));
    assert_eq!(h.twin.pending_count(), 0);

    h.monitor.stop();
}

#[test]
fn rapid_reports_merge_into_one_send() {
    let h = harness(fast_settings(), 80.0);

    let mut first = serde_json::Map::new();
    first.insert("battery".into(), json!(90));
    h.twin.report(first);

    let mut second = serde_json::Map::new();
    second.insert("battery".into(), json!(85));
    second.insert("uptime".into(), json!(120));
    h.twin.report(second);

    assert_eq!(h.twin.pending_count(), 2);
    h.twin.flush_pending();

    let patches = h.transport.reported_patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].get("battery"), Some(&json!(85)));
    assert_eq!(patches[0].get("uptime"), Some(&json!(120)));
}

#[test]
fn min_send_interval_defers_second_flush() {
    let settings = TwinSettings {
        min_send_interval: Duration::from_secs(60),
        ..fast_settings()
    };
    let h = harness(settings, 80.0);

    let mut props = serde_json::Map::new();
    props.insert("battery".into(), json!(90));
    h.twin.report(props);
    h.twin.flush_pending();
    assert_eq!(h.transport.reported_patches().len(), 1);

    let mut props = serde_json::Map::new();
    props.insert("battery".into(), json!(80));
    h.twin.report(props);
    h.twin.flush_pending();

    // Too soon: nothing sent, property stays buffered
    assert_eq!(h.transport.reported_patches().len(), 1);
    assert_eq!(h.twin.pending_count(), 1);
}

#[test]
fn breaker_trips_and_preserves_buffer() {
    let settings = TwinSettings {
        max_sends_per_minute: 1,
        ..fast_settings()
    };
    let h = harness(settings, 80.0);

    for value in [1, 2] {
        let mut props = serde_json::Map::new();
        props.insert("counter".into(), json!(value));
        h.twin.report(props);
        h.twin.flush_pending();
    }
    assert_eq!(h.transport.reported_patches().len(), 2);

    // Third flush finds the circuit open; the property is kept, not lost
    let mut props = serde_json::Map::new();
    props.insert("counter".into(), json!(3));
    h.twin.report(props);
    h.twin.flush_pending();
    assert_eq!(h.transport.reported_patches().len(), 2);
    assert_eq!(h.twin.pending_count(), 1);
    assert_eq!(h.twin.connection_state(), ConnectionState::CircuitOpen);
}

#[test]
fn breaker_recovers_after_cooldown() {
    let settings = TwinSettings {
        max_sends_per_minute: 1,
        breaker_cooldown: Duration::ZERO,
        ..fast_settings()
    };
    let h = harness(settings, 80.0);

    for value in [1, 2] {
        let mut props = serde_json::Map::new();
        props.insert("counter".into(), json!(value));
        h.twin.report(props);
        h.twin.flush_pending();
    }

    // Cooldown of zero: the next flush closes the circuit and drains
    let mut props = serde_json::Map::new();
    props.insert("counter".into(), json!(3));
    h.twin.report(props);
    h.twin.flush_pending();
    assert_eq!(h.transport.reported_patches().len(), 3);
    assert_eq!(h.twin.pending_count(), 0);
    assert_eq!(h.twin.connection_state(), ConnectionState::Connected);
}

#[test]
fn send_failure_keeps_properties_buffered() {
    let h = harness(fast_settings(), 80.0);

    let mut props = serde_json::Map::new();
    props.insert("battery".into(), json!(90));
    h.twin.report(props);

    h.transport.fail_next_send();
    h.twin.flush_pending();
    assert_eq!(h.transport.reported_patches().len(), 0);
    assert_eq!(h.twin.pending_count(), 1);
    assert_eq!(h.twin.connection_state(), ConnectionState::Connecting);

    h.twin.flush_pending();
    assert_eq!(h.transport.reported_patches().len(), 1);
    assert_eq!(h.twin.pending_count(), 0);
}

#[test]
fn cloud_enabled_patch_toggles_flag() {
    let h = harness(fast_settings(), 80.0);
    assert!(h.flags.cloud_enabled());

    h.twin.on_patch(cloud_enabled_patch(false));
    assert!(!h.flags.cloud_enabled());

    // Re-delivery does not queue another ack
    h.twin.flush_pending();
    h.twin.on_patch(cloud_enabled_patch(false));
    assert_eq!(h.twin.pending_count(), 0);
}

#[test]
fn window_only_patch_does_not_rearm_disabled_alarm() {
    let h = harness(fast_settings(), 80.0);
    assert!(h.engine.set_alarm("07:00", 30));
    h.engine.disable_alarm();

    let mut patch = serde_json::Map::new();
    patch.insert("smart_wakeup_window".into(), json!(15));
    h.twin.on_patch(patch);

    let alarm = h.engine.snapshot();
    assert!(!alarm.enabled);
    assert_eq!(alarm.window_minutes, 15);
    // The window change itself is acknowledged
    assert!(h.twin.pending_count() > 0);

    h.monitor.stop();
}

#[test]
fn enable_only_patch_rearms_with_current_settings() {
    let h = harness(fast_settings(), 80.0);
    assert!(h.engine.set_alarm("07:00", 20));
    h.engine.disable_alarm();

    let mut patch = serde_json::Map::new();
    patch.insert("alarm_enabled".into(), json!(true));
    h.twin.on_patch(patch);

    let alarm = h.engine.snapshot();
    assert!(alarm.enabled);
    assert_eq!(alarm.wake_time.as_deref(), Some("07:00"));
    assert_eq!(alarm.window_minutes, 20);

    // The legacy key re-arms the same way
    h.engine.disable_alarm();
    let mut patch = serde_json::Map::new();
    patch.insert("capture_enabled".into(), json!(true));
    h.twin.on_patch(patch);
    assert!(h.engine.snapshot().enabled);

    h.monitor.stop();
}

#[test]
fn enable_only_patch_without_wake_time_stays_disarmed() {
    let h = harness(fast_settings(), 80.0);

    let mut patch = serde_json::Map::new();
    patch.insert("alarm_enabled".into(), json!(true));
    h.twin.on_patch(patch);

    assert!(!h.engine.snapshot().enabled);
    assert_eq!(h.twin.pending_count(), 0);
}

#[test]
fn capture_enabled_false_disarms_alarm() {
    let h = harness(fast_settings(), 80.0);
    h.twin.on_patch(alarm_patch("07:00", 20));
    assert!(h.engine.snapshot().enabled);

    // Legacy key name, same meaning as alarm_enabled
    let mut patch = serde_json::Map::new();
    patch.insert("capture_enabled".into(), json!(false));
    h.twin.on_patch(patch);

    let alarm = h.engine.snapshot();
    assert!(!alarm.enabled);
    assert!(!alarm.triggered);

    h.monitor.stop();
}

#[test]
fn direct_methods_respond_over_transport() {
    let h = harness(fast_settings(), 80.0);

    h.twin.handle_method("getStatus", "req-1", json!({}));
    h.twin
        .handle_method("setAlarm", "req-2", json!({ "time": "06:45", "window": 25 }));
    h.twin.handle_method("setAlarm", "req-3", json!({ "time": "bogus" }));
    h.twin.handle_method("selfDestruct", "req-4", json!({}));

    let responses = h.transport.method_responses();
    assert_eq!(responses.len(), 4);
    assert_eq!(responses[0].1, 200);
    assert_eq!(responses[1].1, 200);
    assert_eq!(responses[2].1, 400);
    assert_eq!(responses[3].1, 404);

    let alarm = h.engine.snapshot();
    assert_eq!(alarm.wake_time.as_deref(), Some("06:45"));
    assert_eq!(alarm.window_minutes, 25);

    h.monitor.stop();
}

#[test]
fn poll_detects_light_sleep_inside_window() {
    // Fixed score of 40 maps to poor quality, which counts as light sleep
    let h = harness(fast_settings(), 40.0);

    let wake = Local::now().naive_local() + ChronoDuration::minutes(10);
    assert!(h
        .engine
        .set_alarm(&wake.format("%H:%M").to_string(), 30));

    h.provider.push_session(stages_session());
    h.provider.set_heart_rate(62.0);
    h.monitor.poll_once().unwrap();

    let alarm = h.engine.snapshot();
    assert!(alarm.triggered);
    assert_eq!(alarm.trigger_reason, Some(TriggerReason::LightSleepDetected));

    let events = h.events.all();
    assert!(events
        .iter()
        .any(|e| e.event_type == AlarmEventType::Triggered));

    let published = h.publisher.published();
    assert!(published.iter().any(|(topic, _)| topic == "t/predictions"));
    assert!(published.iter().any(|(topic, payload)| topic == "t/alerts"
        && payload.get("alert") == Some(&json!("alarm_triggered"))));
}

#[test]
fn good_quality_inside_window_does_not_trigger() {
    let h = harness(fast_settings(), 90.0);

    let wake = Local::now().naive_local() + ChronoDuration::minutes(10);
    assert!(h
        .engine
        .set_alarm(&wake.format("%H:%M").to_string(), 30));

    h.provider.push_session(stages_session());
    h.monitor.poll_once().unwrap();

    assert!(!h.engine.snapshot().triggered);
    // Prediction still went out
    assert!(h
        .publisher
        .published()
        .iter()
        .any(|(topic, _)| topic == "t/predictions"));
}

#[test]
fn provider_outage_is_tolerated() {
    let h = harness(fast_settings(), 40.0);
    h.provider.push_error("fitbit 503");
    h.provider.push_session(stages_session());

    assert!(h.monitor.poll_once().is_err());
    // Next poll succeeds with the queued session
    h.monitor.poll_once().unwrap();
    assert!(h.monitor.last_sample().is_some());
}

#[test]
fn no_transport_runs_local_only() {
    let engine = Arc::new(AlarmEngine::new());
    let flags = Arc::new(StatusFlags::new());
    let monitor = Arc::new(SleepMonitor::new(
        Arc::clone(&engine),
        Arc::new(ScriptedSleepProvider::new()),
        Arc::new(FixedPredictor::new(80.0)),
        Arc::new(RecordingAlertPublisher::new()),
        Arc::new(MemoryEventSink::new()),
        Arc::clone(&flags),
        Duration::from_millis(10),
        MonitorTopics {
            predictions: "t/predictions".into(),
            alerts: "t/alerts".into(),
        },
    ));
    let twin = TwinSyncClient::new(None, engine, monitor, flags, fast_settings());

    assert!(!twin.init());
    assert_eq!(twin.connection_state(), ConnectionState::Disconnected);
    twin.flush_pending();
    assert_eq!(twin.connection_state(), ConnectionState::Disconnected);
}
