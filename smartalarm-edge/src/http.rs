//! Local HTTP API
//!
//! Thin REST surface over the alarm engine for the bedside display and for
//! debugging. Handlers delegate straight to the engine and twin client;
//! no business logic lives here.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Local;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::alarm::{AlarmEngine, QualitySample, SleepQuality};
use crate::events::{AlarmEvent, AlarmEventType};
use crate::monitor::SleepMonitor;
use crate::ports::{AlarmEventSink, AlertPublisher};
use crate::state::StatusFlags;
use crate::twin::TwinSyncClient;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AlarmEngine>,
    pub monitor: Arc<SleepMonitor>,
    pub twin: Arc<TwinSyncClient>,
    pub events: Arc<dyn AlarmEventSink>,
    pub publisher: Arc<dyn AlertPublisher>,
    pub flags: Arc<StatusFlags>,
    pub alerts_topic: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/alarm", get(get_alarm).post(set_alarm).delete(disable_alarm))
        .route("/api/alarm/snooze", post(snooze_alarm))
        .route("/api/alarm/dismiss", post(dismiss_alarm))
        .route("/api/alarm/check", post(check_alarm))
        .route("/api/alarm/history", get(alarm_history))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "time": Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S").to_string(),
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "alarm": state.engine.get_alarm_status(),
        "cloud_enabled": state.flags.cloud_enabled(),
        "monitoring_active": state.flags.monitoring_active(),
        "fitbit_connected": state.flags.fitbit_connected(),
        "twin_connection": state.twin.connection_state().as_str(),
        "pending_properties": state.twin.pending_count(),
    }))
}

async fn get_alarm(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.engine.get_alarm_status()))
}

#[derive(Deserialize)]
struct SetAlarmBody {
    time: String,
    #[serde(default = "default_window")]
    window_minutes: i64,
}

fn default_window() -> i64 {
    30
}

async fn set_alarm(
    State(state): State<AppState>,
    Json(body): Json<SetAlarmBody>,
) -> (StatusCode, Json<Value>) {
    if !state.engine.set_alarm(&body.time, body.window_minutes) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid time format. Use HH:MM" })),
        );
    }

    let mut event = AlarmEvent::new(AlarmEventType::Set);
    event.scheduled_time = Some(body.time.clone());
    event.window_minutes = Some(body.window_minutes);
    state.events.record(&event);

    state.monitor.start();
    state.twin.report_alarm_state();
    state.publisher.publish(
        &state.alerts_topic,
        &json!({ "alert": "alarm_set", "time": body.time, "window": body.window_minutes }),
    );

    (StatusCode::OK, Json(json!(state.engine.get_alarm_status())))
}

async fn disable_alarm(State(state): State<AppState>) -> Json<Value> {
    state.engine.disable_alarm();
    state.events.record(&AlarmEvent::new(AlarmEventType::Disabled));
    state.twin.report_alarm_state();
    Json(json!(state.engine.get_alarm_status()))
}

#[derive(Deserialize)]
struct SnoozeBody {
    #[serde(default = "default_snooze")]
    minutes: i64,
}

fn default_snooze() -> i64 {
    9
}

async fn snooze_alarm(
    State(state): State<AppState>,
    body: Option<Json<SnoozeBody>>,
) -> (StatusCode, Json<Value>) {
    let minutes = body.map(|Json(b)| b.minutes).unwrap_or_else(default_snooze);
    match state.engine.snooze_alarm(minutes) {
        Some(new_time) => {
            let mut event = AlarmEvent::new(AlarmEventType::Snoozed);
            event.scheduled_time = Some(new_time.clone());
            state.events.record(&event);
            state.twin.report_alarm_state();
            state.publisher.publish(
                &state.alerts_topic,
                &json!({ "alert": "alarm_snoozed", "new_wake_time": new_time }),
            );
            (
                StatusCode::OK,
                Json(json!({ "snoozed": true, "new_wake_time": new_time })),
            )
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "alarm is not ringing or snooze limit reached" })),
        ),
    }
}

async fn dismiss_alarm(State(state): State<AppState>) -> Json<Value> {
    state.engine.dismiss_alarm();
    state.events.record(&AlarmEvent::new(AlarmEventType::Dismissed));
    state.twin.report_alarm_state();
    state
        .publisher
        .publish(&state.alerts_topic, &json!({ "alert": "alarm_dismissed" }));
    Json(json!(state.engine.get_alarm_status()))
}

/// Manual trigger check with the most recent prediction, for testing from
/// the bedside display. A trigger fired this way goes through the same
/// event-log and alert path as the monitor loop.
pub async fn check_alarm(State(state): State<AppState>) -> Json<Value> {
    let sample = state
        .monitor
        .last_sample()
        .unwrap_or_else(|| QualitySample::new(SleepQuality::Unknown, None));
    let result = state.engine.check_alarm_trigger(Some(&sample));

    if let Some(result) = &result {
        let mut event = AlarmEvent::new(AlarmEventType::Triggered);
        event.trigger_reason = Some(result.reason);
        event.actual_time = Some(result.time.format("%H:%M:%S").to_string());
        event.scheduled_time = state.engine.snapshot().wake_time;
        event.sleep_quality = result.quality;
        event.sleep_score = result.score;
        state.events.record(&event);

        state.publisher.publish(
            &state.alerts_topic,
            &json!({
                "alert": "alarm_triggered",
                "reason": result.reason.as_str(),
                "time": result.time.format("%Y-%m-%dT%H:%M:%S").to_string(),
                "quality": result.quality,
                "score": result.score,
            }),
        );
    }

    Json(json!({
        "triggered": result.is_some(),
        "result": result,
        "alarm": state.engine.get_alarm_status(),
    }))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

async fn alarm_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    Json(json!({ "events": state.events.recent(query.limit) }))
}
